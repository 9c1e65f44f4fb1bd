//! In this module, we implement the runtime counters for the pipeline.
//! Everything here is a relaxed atomic so the interrupt path can bump
//! counters without taking a lock. The binary logs a snapshot periodically.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PipelineMonitor {
    blocks_captured: AtomicU64,
    blocks_overwritten: AtomicU64,
    blocks_dropped: AtomicU64,
    handoff_faults: AtomicU64,
    length_overruns: AtomicU64,
    chunks_sent: AtomicU64,
    chunks_skipped: AtomicU64,
    chunks_failed: AtomicU64,
    commands_applied: AtomicU64,
    commands_rejected: AtomicU64,
    commands_ignored: AtomicU64,
    rx_bytes_dropped: AtomicU64,
}

/// Point-in-time copy of every counter
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MonitorSnapshot {
    pub blocks_captured: u64,
    pub blocks_overwritten: u64,
    pub blocks_dropped: u64,
    pub handoff_faults: u64,
    pub length_overruns: u64,
    pub chunks_sent: u64,
    pub chunks_skipped: u64,
    pub chunks_failed: u64,
    pub commands_applied: u64,
    pub commands_rejected: u64,
    pub commands_ignored: u64,
    pub rx_bytes_dropped: u64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl PipelineMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block_captured(&self) {
        bump(&self.blocks_captured)
    }

    /// A staged block was replaced before the stager picked it up
    pub fn block_overwritten(&self) {
        bump(&self.blocks_overwritten)
    }

    /// A capture found no free staging block and was never staged
    pub fn block_dropped(&self) {
        bump(&self.blocks_dropped)
    }

    /// The ADC asked for a buffer the manager did not hold
    pub fn handoff_fault(&self) {
        bump(&self.handoff_faults)
    }

    pub fn length_overrun(&self) {
        bump(&self.length_overruns)
    }

    pub fn chunk_sent(&self) {
        bump(&self.chunks_sent)
    }

    pub fn chunk_skipped(&self) {
        bump(&self.chunks_skipped)
    }

    pub fn chunk_failed(&self) {
        bump(&self.chunks_failed)
    }

    pub fn command_applied(&self) {
        bump(&self.commands_applied)
    }

    pub fn command_rejected(&self) {
        bump(&self.commands_rejected)
    }

    pub fn command_ignored(&self) {
        bump(&self.commands_ignored)
    }

    pub fn rx_byte_dropped(&self) {
        bump(&self.rx_bytes_dropped)
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MonitorSnapshot {
            blocks_captured: load(&self.blocks_captured),
            blocks_overwritten: load(&self.blocks_overwritten),
            blocks_dropped: load(&self.blocks_dropped),
            handoff_faults: load(&self.handoff_faults),
            length_overruns: load(&self.length_overruns),
            chunks_sent: load(&self.chunks_sent),
            chunks_skipped: load(&self.chunks_skipped),
            chunks_failed: load(&self.chunks_failed),
            commands_applied: load(&self.commands_applied),
            commands_rejected: load(&self.commands_rejected),
            commands_ignored: load(&self.commands_ignored),
            rx_bytes_dropped: load(&self.rx_bytes_dropped),
        }
    }
}
