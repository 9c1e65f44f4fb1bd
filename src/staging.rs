//! Single-slot handoff between the capture interrupt and the telemetry task.
//!
//! Three blocks are allocated up front and circulate between the producer's
//! spare, the one-deep mailbox and the consumer. The producer only ever writes
//! into a block nobody else holds and publishes it after the copy is done, so
//! the consumer sees either the previous complete block or the new complete
//! block. When the mailbox is still occupied the producer takes the stale
//! block back out and replaces it: latest block wins, nothing queues.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};

use crate::Sample;

const BLOCKS_IN_FLIGHT: usize = 3;

/// Copy of the most recently completed capture buffer
#[derive(Debug)]
pub struct StagingBlock {
    samples: Box<[Sample]>,
    len: usize,
    sequence: u64,
}

impl StagingBlock {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            samples: vec![0; capacity].into_boxed_slice(),
            len: 0,
            sequence: 0,
        }
    }

    /// Copy as much of `src` as fits, returning how many samples were kept
    fn fill_from(&mut self, src: &[Sample], sequence: u64) -> usize {
        let n = src.len().min(self.samples.len());
        self.samples[..n].copy_from_slice(&src[..n]);
        self.len = n;
        self.sequence = sequence;
        n
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Capture completion number this block was staged from, starting at 1
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// What happened to a freshly staged block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Published into an empty slot
    Published,
    /// Published, replacing a block the consumer never picked up
    Overwrote,
    /// Every block is checked out by the consumer; the data was dropped
    Dropped,
}

/// Interrupt-side end. Never blocks.
pub struct StagingProducer {
    spare: Option<StagingBlock>,
    slot_tx: Sender<StagingBlock>,
    slot_rx: Receiver<StagingBlock>,
    free_tx: Sender<StagingBlock>,
    free_rx: Receiver<StagingBlock>,
    sequence: u64,
}

/// Task-side end
pub struct StagingConsumer {
    slot_rx: Receiver<StagingBlock>,
    free_tx: Sender<StagingBlock>,
}

/// A staged block checked out by the consumer. Returned to the pool on drop.
pub struct StagedBlock<'a> {
    block: StagingBlock,
    free_tx: &'a Sender<StagingBlock>,
}

/// Allocate the staging blocks and split them into the two ends
pub fn staging_slot(capacity: usize) -> (StagingProducer, StagingConsumer) {
    let (slot_tx, slot_rx) = bounded(1);
    let (free_tx, free_rx) = bounded(BLOCKS_IN_FLIGHT);
    for _ in 1..BLOCKS_IN_FLIGHT {
        // Cannot fail, the channel was sized for every block
        let _ = free_tx.try_send(StagingBlock::with_capacity(capacity));
    }
    (
        StagingProducer {
            spare: Some(StagingBlock::with_capacity(capacity)),
            slot_tx,
            slot_rx: slot_rx.clone(),
            free_tx: free_tx.clone(),
            free_rx,
            sequence: 0,
        },
        StagingConsumer { slot_rx, free_tx },
    )
}

impl StagingProducer {
    /// Copy `samples` (clamped to the block capacity) and publish the copy
    pub fn stage(&mut self, samples: &[Sample]) -> StageOutcome {
        let (mut block, mut overwrote) = match self.take_writable() {
            Some(taken) => taken,
            None => return StageOutcome::Dropped,
        };
        self.sequence += 1;
        block.fill_from(samples, self.sequence);
        // Publish only after the copy is complete
        loop {
            match self.slot_tx.try_send(block) {
                Ok(()) => break,
                Err(TrySendError::Full(rejected)) => {
                    block = rejected;
                    if let Ok(stale) = self.slot_rx.try_recv() {
                        overwrote = true;
                        self.recycle(stale);
                    }
                }
                // We hold a receiver ourselves, so this cannot happen
                Err(TrySendError::Disconnected(rejected)) => {
                    self.recycle(rejected);
                    return StageOutcome::Dropped;
                }
            }
        }
        if overwrote {
            StageOutcome::Overwrote
        } else {
            StageOutcome::Published
        }
    }

    fn take_writable(&mut self) -> Option<(StagingBlock, bool)> {
        if let Some(block) = self.spare.take() {
            return Some((block, false));
        }
        if let Ok(block) = self.free_rx.try_recv() {
            return Some((block, false));
        }
        // Consumer holds one block, the slot holds the other: reclaim the stale one
        match self.slot_rx.try_recv() {
            Ok(block) => Some((block, true)),
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    fn recycle(&mut self, block: StagingBlock) {
        if self.spare.is_none() {
            self.spare = Some(block);
        } else {
            let _ = self.free_tx.try_send(block);
        }
    }

    /// Drop whatever is waiting in the slot without sending it
    pub fn discard_pending(&mut self) -> bool {
        match self.slot_rx.try_recv() {
            Ok(block) => {
                self.recycle(block);
                true
            }
            Err(_) => false,
        }
    }
}

impl StagingConsumer {
    /// Wait for the next staged block. `None` once the producer is gone.
    pub fn recv(&self) -> Option<StagedBlock<'_>> {
        self.slot_rx.recv().ok().map(|b| self.check_out(b))
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`
    pub fn recv_timeout(&self, timeout: Duration) -> Result<StagedBlock<'_>, RecvTimeoutError> {
        self.slot_rx.recv_timeout(timeout).map(|b| self.check_out(b))
    }

    pub fn try_recv(&self) -> Option<StagedBlock<'_>> {
        self.slot_rx.try_recv().ok().map(|b| self.check_out(b))
    }

    fn check_out(&self, block: StagingBlock) -> StagedBlock<'_> {
        StagedBlock {
            block,
            free_tx: &self.free_tx,
        }
    }
}

impl std::ops::Deref for StagedBlock<'_> {
    type Target = StagingBlock;

    fn deref(&self) -> &StagingBlock {
        &self.block
    }
}

impl Drop for StagedBlock<'_> {
    fn drop(&mut self) {
        let block = std::mem::replace(&mut self.block, StagingBlock::with_capacity(0));
        let _ = self.free_tx.try_send(block);
    }
}
