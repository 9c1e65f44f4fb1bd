//! This module contains all the capture logic
//!
//! The ADC fills one of two buffers (ping and pong) by DMA while we hold the
//! other. Buffers are moved into the driver when it asks for one and moved
//! back when it reports the buffer full, so the buffer we are reading from can
//! never be the one being written. Everything in [`CaptureManager::on_event`]
//! runs in interrupt context: no blocking, no allocation, no panics.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::{
    error::{HardwareError, PipelineError},
    monitoring::PipelineMonitor,
    scheduler::{SampleTimer, Scheduler},
    staging::{StageOutcome, StagingProducer},
    Sample,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferId {
    Ping,
    Pong,
}

impl BufferId {
    pub fn from_index(idx: u64) -> Self {
        if idx % 2 == 0 {
            BufferId::Ping
        } else {
            BufferId::Pong
        }
    }

    pub fn index(self) -> usize {
        match self {
            BufferId::Ping => 0,
            BufferId::Pong => 1,
        }
    }
}

/// A DMA target. Capacity is fixed at allocation.
#[derive(Debug)]
pub struct CaptureBuffer {
    id: BufferId,
    samples: Box<[Sample]>,
    reported: usize,
}

impl CaptureBuffer {
    pub fn new(id: BufferId, capacity: usize) -> Self {
        Self {
            id,
            samples: vec![0; capacity].into_boxed_slice(),
            reported: 0,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Whole backing store, for the driver to write into
    pub fn dma_target(&mut self) -> &mut [Sample] {
        &mut self.samples
    }

    /// Record how many samples the hardware says it wrote
    pub fn complete(&mut self, reported: usize) {
        self.reported = reported;
    }

    /// Sample count as reported by the hardware, which may exceed capacity
    pub fn reported_len(&self) -> usize {
        self.reported
    }

    /// The valid samples, clamped to capacity
    pub fn samples(&self) -> &[Sample] {
        &self.samples[..self.reported.min(self.samples.len())]
    }
}

/// Driver events delivered to [`CaptureManager::on_event`]
#[derive(Debug)]
pub enum AdcEvent {
    /// Warm-up finished; sampling may begin. Carries no data.
    Ready,
    /// The driver switched buffers and wants the next one queued
    BufferRequest,
    /// A buffer was filled and is handed back
    Done(CaptureBuffer),
    Other(u8),
}

/// Returned by [`AdcDriver::buffer_set`] along with the buffer it refused
#[derive(Debug)]
pub struct BufferRejected {
    pub buffer: CaptureBuffer,
    pub source: HardwareError,
}

/// The ADC side of the acquisition loop
pub trait AdcDriver {
    fn configure(&mut self) -> Result<(), HardwareError>;
    /// Queue `buffer` as a DMA target
    fn buffer_set(&mut self, buffer: CaptureBuffer) -> Result<(), BufferRejected>;
    /// Prepare for externally triggered sampling. Does not sample by itself.
    fn mode_trigger(&mut self) -> Result<(), HardwareError>;
    /// Stop sampling and give back every queued buffer
    fn abort(&mut self) -> Vec<CaptureBuffer>;
}

/// Summary of one completed block. Purely observational.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStats {
    pub mean: Sample,
    pub min: Sample,
    pub max: Sample,
}

impl BlockStats {
    /// Integer mean (truncated toward zero), min and max. `None` for an empty block.
    pub fn compute(samples: &[Sample]) -> Option<Self> {
        if samples.is_empty() {
            return None;
        }
        let mut sum = 0i64;
        let mut min = Sample::MAX;
        let mut max = Sample::MIN;
        for &s in samples {
            sum += i64::from(s);
            min = min.min(s);
            max = max.max(s);
        }
        Some(Self {
            mean: (sum / samples.len() as i64) as Sample,
            min,
            max,
        })
    }
}

pub struct CaptureManager<T> {
    slots: [Option<CaptureBuffer>; 2],
    requests: u64,
    completions: u64,
    capacity: usize,
    scheduler: Arc<Scheduler<T>>,
    staging: StagingProducer,
    monitor: Arc<PipelineMonitor>,
    last_stats: Option<BlockStats>,
}

impl<T: SampleTimer> CaptureManager<T> {
    /// Allocates both capture buffers. Nothing else allocates afterwards.
    pub fn new(
        capacity: usize,
        scheduler: Arc<Scheduler<T>>,
        staging: StagingProducer,
        monitor: Arc<PipelineMonitor>,
    ) -> Self {
        Self {
            slots: [
                Some(CaptureBuffer::new(BufferId::Ping, capacity)),
                Some(CaptureBuffer::new(BufferId::Pong, capacity)),
            ],
            requests: 0,
            completions: 0,
            capacity,
            scheduler,
            staging,
            monitor,
            last_stats: None,
        }
    }

    pub fn scheduler(&self) -> &Arc<Scheduler<T>> {
        &self.scheduler
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn last_stats(&self) -> Option<BlockStats> {
        self.last_stats
    }

    /// Capture completions handled so far
    pub fn completions(&self) -> u64 {
        self.completions
    }

    /// Buffer the next `BufferRequest` will hand out
    pub fn next_request(&self) -> BufferId {
        BufferId::from_index(self.requests)
    }

    /// Whether we currently hold `id` (as opposed to the hardware)
    pub fn holds(&self, id: BufferId) -> bool {
        self.slots[id.index()].is_some()
    }

    /// Configure the ADC and queue both buffers so it can double-buffer from
    /// the first sample
    pub fn configure<A: AdcDriver>(&mut self, adc: &mut A) -> Result<(), PipelineError> {
        let fail = |source: HardwareError| {
            error!(%source, "ADC setup error");
            PipelineError::Init { stage: "adc", source }
        };
        adc.configure().map_err(fail)?;
        for id in [BufferId::Ping, BufferId::Pong] {
            if let Some(buffer) = self.slots[id.index()].take() {
                if let Err(rejected) = adc.buffer_set(buffer) {
                    self.slots[id.index()] = Some(rejected.buffer);
                    return Err(fail(rejected.source));
                }
            }
        }
        adc.mode_trigger().map_err(fail)?;
        Ok(())
    }

    /// ADC event handler. Interrupt context.
    pub fn on_event<A: AdcDriver>(&mut self, event: AdcEvent, adc: &mut A) {
        match event {
            AdcEvent::Ready => {
                // Warm-up: just let the timer go
                if let Err(e) = self.scheduler.start() {
                    error!(%e, "Could not arm sampling timer");
                }
            }
            AdcEvent::BufferRequest => self.on_buffer_request(adc),
            AdcEvent::Done(buffer) => self.on_capture_complete(buffer),
            AdcEvent::Other(code) => debug!(code, "Unhandled ADC event"),
        }
    }

    /// Alternate strictly: request k gets buffer k mod 2
    fn on_buffer_request<A: AdcDriver>(&mut self, adc: &mut A) {
        let id = BufferId::from_index(self.requests);
        self.requests += 1;
        let Some(buffer) = self.slots[id.index()].take() else {
            // The hardware still owns it. Handing out the other one would break alternation.
            self.monitor.handoff_fault();
            error!(?id, "Requested buffer is still in flight");
            return;
        };
        if let Err(rejected) = adc.buffer_set(buffer) {
            self.monitor.handoff_fault();
            error!(source = %rejected.source, ?id, "Buffer set error");
            self.slots[id.index()] = Some(rejected.buffer);
        }
    }

    /// A filled buffer came back from the hardware: summarize it, stage a
    /// copy and keep it until it is requested again
    pub fn on_capture_complete(&mut self, buffer: CaptureBuffer) {
        let expected = BufferId::from_index(self.completions);
        self.completions += 1;
        self.monitor.block_captured();
        if buffer.id() != expected {
            warn!(got = ?buffer.id(), ?expected, "Capture completed out of order");
        }

        if buffer.reported_len() > buffer.capacity() {
            self.monitor.length_overrun();
            warn!(
                reported = buffer.reported_len(),
                capacity = buffer.capacity(),
                "Capture length clamped"
            );
        }
        let samples = buffer.samples();

        debug!(buffer = ?buffer.id(), samples = samples.len(), "Capture buffer filled");
        if let Some(stats) = BlockStats::compute(samples) {
            info!(avg = stats.mean, min = stats.min, max = stats.max, "Block statistics");
            self.last_stats = Some(stats);
        }

        match self.staging.stage(samples) {
            StageOutcome::Published => {}
            StageOutcome::Overwrote => {
                self.monitor.block_overwritten();
                debug!("Previous staged block overwritten before transmission");
            }
            StageOutcome::Dropped => {
                self.monitor.block_dropped();
                warn!("No staging block free, capture dropped");
            }
        }

        let idx = buffer.id().index();
        if self.slots[idx].replace(buffer).is_some() {
            error!(idx, "Capture buffer returned twice");
        }
    }

    /// Halt sampling and take back every buffer the driver still holds.
    /// Anything staged but not yet sent is discarded.
    pub fn shutdown<A: AdcDriver>(&mut self, adc: &mut A) {
        self.scheduler.stop();
        for buffer in adc.abort() {
            let idx = buffer.id().index();
            self.slots[idx] = Some(buffer);
        }
        if self.staging.discard_pending() {
            debug!("Discarded staged block at shutdown");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{sim::SimTimer, staging::staging_slot};
    use std::time::Duration;

    /// Driver stand-in that just queues whatever it is given
    #[derive(Default)]
    struct QueueAdc {
        queued: Vec<CaptureBuffer>,
        reject: bool,
    }

    impl AdcDriver for QueueAdc {
        fn configure(&mut self) -> Result<(), HardwareError> {
            Ok(())
        }

        fn buffer_set(&mut self, buffer: CaptureBuffer) -> Result<(), BufferRejected> {
            if self.reject || self.queued.len() >= 2 {
                return Err(BufferRejected {
                    buffer,
                    source: HardwareError::QueueFull,
                });
            }
            self.queued.push(buffer);
            Ok(())
        }

        fn mode_trigger(&mut self) -> Result<(), HardwareError> {
            Ok(())
        }

        fn abort(&mut self) -> Vec<CaptureBuffer> {
            std::mem::take(&mut self.queued)
        }
    }

    impl QueueAdc {
        fn fill_front(&mut self, value: Sample) -> CaptureBuffer {
            let mut buf = self.queued.remove(0);
            let n = buf.capacity();
            buf.dma_target().fill(value);
            buf.complete(n);
            buf
        }
    }

    fn manager(capacity: usize) -> (CaptureManager<SimTimer>, crate::staging::StagingConsumer) {
        let sched = Arc::new(Scheduler::new(SimTimer::new(), Duration::from_micros(333)));
        sched.init_timer().unwrap();
        let (prod, cons) = staging_slot(capacity);
        let mgr = CaptureManager::new(capacity, sched, prod, Arc::new(PipelineMonitor::new()));
        (mgr, cons)
    }

    #[test]
    fn stats() {
        let stats = BlockStats::compute(&[-100, 200, 0, 1]).unwrap();
        assert_eq!(stats.min, -100);
        assert_eq!(stats.max, 200);
        // 101 / 4 truncates
        assert_eq!(stats.mean, 25);
        let neg = BlockStats::compute(&[-3, -4]).unwrap();
        assert_eq!(neg.mean, -3);
        assert_eq!(BlockStats::compute(&[]), None);
    }

    #[test]
    fn warm_up_only_arms_timer() {
        let (mut mgr, cons) = manager(8);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        assert!(!mgr.scheduler().is_running());
        mgr.on_event(AdcEvent::Ready, &mut adc);
        assert!(mgr.scheduler().is_running());
        assert!(cons.try_recv().is_none());
        assert_eq!(mgr.completions(), 0);
    }

    #[test]
    fn buffers_alternate() {
        let (mut mgr, cons) = manager(8);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        assert!(!mgr.holds(BufferId::Ping) && !mgr.holds(BufferId::Pong));
        mgr.on_event(AdcEvent::Ready, &mut adc);

        for k in 0..10u64 {
            let done = adc.fill_front(k as Sample);
            assert_eq!(done.id(), BufferId::from_index(k));
            mgr.on_event(AdcEvent::Done(done), &mut adc);
            assert_eq!(mgr.next_request(), BufferId::from_index(k));
            mgr.on_event(AdcEvent::BufferRequest, &mut adc);
            // Never hold the buffer the hardware is writing
            let writing = adc.queued[0].id();
            assert!(!mgr.holds(writing));
            let staged = cons.try_recv().unwrap();
            assert_eq!(staged.samples(), &[k as Sample; 8]);
        }
        assert_eq!(mgr.completions(), 10);
        assert_eq!(mgr.monitor.snapshot().handoff_faults, 0);
    }

    #[test]
    fn request_for_busy_buffer_is_refused() {
        let (mut mgr, _cons) = manager(8);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        // Ping is still queued in the driver
        mgr.on_event(AdcEvent::BufferRequest, &mut adc);
        assert_eq!(adc.queued.len(), 2);
        assert_eq!(mgr.monitor.snapshot().handoff_faults, 1);
    }

    #[test]
    fn rejected_buffer_is_kept() {
        let (mut mgr, _cons) = manager(8);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        let done = adc.fill_front(1);
        mgr.on_event(AdcEvent::Done(done), &mut adc);
        adc.reject = true;
        mgr.on_event(AdcEvent::BufferRequest, &mut adc);
        assert!(mgr.holds(BufferId::Ping));
    }

    #[test]
    fn overrun_is_clamped() {
        let (mut mgr, cons) = manager(8);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        let mut done = adc.fill_front(7);
        done.complete(12);
        mgr.on_event(AdcEvent::Done(done), &mut adc);
        let staged = cons.try_recv().unwrap();
        assert_eq!(staged.len(), 8);
        assert_eq!(mgr.monitor.snapshot().length_overruns, 1);
        assert_eq!(mgr.last_stats().map(|s| s.max), Some(7));
    }

    #[test]
    fn capture_dropped_when_stager_holds_every_block() {
        let (mut mgr, cons) = manager(4);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        mgr.on_event(AdcEvent::Ready, &mut adc);
        let mut held = Vec::new();
        for k in 0..3 {
            let done = adc.fill_front(k);
            mgr.on_event(AdcEvent::Done(done), &mut adc);
            mgr.on_event(AdcEvent::BufferRequest, &mut adc);
            held.push(cons.try_recv().unwrap());
        }
        let done = adc.fill_front(9);
        mgr.on_event(AdcEvent::Done(done), &mut adc);
        let snap = mgr.monitor.snapshot();
        assert_eq!((snap.blocks_dropped, snap.blocks_overwritten), (1, 0));
        assert_eq!(snap.blocks_captured, 4);
        drop(held);
        assert!(cons.try_recv().is_none());
    }

    #[test]
    fn shutdown_reclaims_buffers() {
        let (mut mgr, cons) = manager(8);
        let mut adc = QueueAdc::default();
        mgr.configure(&mut adc).unwrap();
        mgr.on_event(AdcEvent::Ready, &mut adc);
        let done = adc.fill_front(3);
        mgr.on_event(AdcEvent::Done(done), &mut adc);
        mgr.shutdown(&mut adc);
        assert!(!mgr.scheduler().is_running());
        assert!(mgr.holds(BufferId::Ping) && mgr.holds(BufferId::Pong));
        assert!(cons.try_recv().is_none());
    }
}
