//! This module is responsible for exfilling staged sample blocks over the
//! notification transport.
//!
//! Each staged block is cut into chunks of `samples_per_chunk` samples (the
//! last one may be shorter), every sample packed as a little-endian `i16`,
//! and each chunk handed to the transport as one notification. There is no
//! header: the transport's own framing carries the length. This is live
//! telemetry, so a chunk the peer is not ready for is dropped, never retried.

use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[cfg(target_endian = "little")]
use byte_slice_cast::AsByteSlice;
use tracing::{debug, info, warn};

use crate::{
    error::TransportError, monitoring::PipelineMonitor, staging::StagingBlock,
    staging::StagingConsumer, Sample,
};

/// How long the stager waits for a block before re-checking the run flag
const IDLE_POLL: Duration = Duration::from_millis(100);

/// Notification sink (e.g. a GATT characteristic)
pub trait Transport {
    /// Send one chunk. Must not block waiting for the peer.
    fn send_chunk(&mut self, payload: &[u8]) -> Result<(), TransportError>;
}

/// Number of transport units one block of `total` samples needs
pub fn chunk_count(total: usize, samples_per_chunk: usize) -> usize {
    total.div_ceil(samples_per_chunk.max(1))
}

/// Sample ranges of each chunk, in capture order
pub fn chunk_ranges(total: usize, samples_per_chunk: usize) -> impl Iterator<Item = Range<usize>> {
    let step = samples_per_chunk.max(1);
    (0..total).step_by(step).map(move |start| {
        let remaining = total - start;
        start..start + remaining.min(step)
    })
}

/// Pack `samples` as little-endian `i16` into the front of `out`, returning the
/// number of bytes written. `out` must hold at least `2 * samples.len()` bytes.
pub fn pack_chunk(samples: &[Sample], out: &mut [u8]) -> usize {
    let n = 2 * samples.len();
    #[cfg(target_endian = "little")]
    {
        out[..n].copy_from_slice(samples.as_byte_slice());
    }
    #[cfg(not(target_endian = "little"))]
    {
        for (dst, s) in out[..n].chunks_exact_mut(2).zip(samples) {
            dst.copy_from_slice(&s.to_le_bytes());
        }
    }
    n
}

/// Result of sending one block
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TransmitReport {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct TelemetryStager<T> {
    transport: T,
    samples_per_chunk: usize,
    payload: Box<[u8]>,
    monitor: Arc<PipelineMonitor>,
}

impl<T: Transport> TelemetryStager<T> {
    pub fn new(transport: T, samples_per_chunk: usize, monitor: Arc<PipelineMonitor>) -> Self {
        let samples_per_chunk = samples_per_chunk.max(1);
        Self {
            transport,
            samples_per_chunk,
            payload: vec![0u8; 2 * samples_per_chunk].into_boxed_slice(),
            monitor,
        }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn into_transport(self) -> T {
        self.transport
    }

    /// Chunk and send one staged block
    pub fn transmit(&mut self, block: &StagingBlock) -> TransmitReport {
        let samples = block.samples();
        let mut report = TransmitReport::default();
        for range in chunk_ranges(samples.len(), self.samples_per_chunk) {
            let n = pack_chunk(&samples[range], &mut self.payload);
            match self.transport.send_chunk(&self.payload[..n]) {
                Ok(()) => {
                    report.sent += 1;
                    self.monitor.chunk_sent();
                }
                Err(TransportError::NotReady) => {
                    report.skipped += 1;
                    self.monitor.chunk_skipped();
                }
                Err(e) => {
                    report.failed += 1;
                    self.monitor.chunk_failed();
                    warn!(%e, len = n, "Chunk send failed");
                }
            }
        }
        if report.skipped > 0 {
            debug!(
                skipped = report.skipped,
                sequence = block.sequence(),
                "Peer not ready, chunks dropped"
            );
        }
        report
    }

    /// Deferred task body: send staged blocks until `running` drops or the
    /// producer goes away
    pub fn run(&mut self, consumer: &StagingConsumer, running: &AtomicBool) {
        info!(samples_per_chunk = self.samples_per_chunk, "Telemetry stager started");
        while running.load(Ordering::Acquire) {
            match consumer.recv_timeout(IDLE_POLL) {
                Ok(block) => {
                    let report = self.transmit(&block);
                    debug!(sequence = block.sequence(), ?report, "Block transmitted");
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("Telemetry stager stopped");
    }
}
