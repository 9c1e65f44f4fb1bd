//! Simulated peripherals so the pipeline runs on a host.
//!
//! The ADC emulation fills a whole queued buffer at once and then reports it,
//! optionally sleeping for the time the real hardware would take, which keeps
//! the event sequence (ready, done, buffer request, ...) identical to the
//! target's.

use std::collections::VecDeque;
use std::f64::consts::TAU;
use std::io::Write;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::{rngs::StdRng, Rng, SeedableRng};
use tracing::{debug, info, warn};

use crate::{
    capture::{AdcDriver, AdcEvent, BufferRejected, CaptureBuffer, CaptureManager},
    device::FrontEnd,
    error::{HardwareError, TransportError},
    exfil::Transport,
    scheduler::{EventRouter, HwEvent, HwTask, SampleTimer},
    Sample,
};

/// Timer with a shared enable flag
#[derive(Debug, Clone, Default)]
pub struct SimTimer {
    inner: Arc<TimerState>,
}

#[derive(Debug, Default)]
struct TimerState {
    enabled: AtomicBool,
    interval_us: AtomicU64,
    enables: AtomicUsize,
}

impl SimTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Times the timer went from disabled to enabled
    pub fn enable_count(&self) -> usize {
        self.inner.enables.load(Ordering::Relaxed)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_micros(self.inner.interval_us.load(Ordering::Relaxed))
    }
}

impl SampleTimer for SimTimer {
    fn init(&self, interval: Duration) -> Result<(), HardwareError> {
        let us = interval.as_micros();
        if us == 0 || us > u128::from(u32::MAX) {
            return Err(HardwareError::Init {
                peripheral: "timer",
                code: 0x0BAD_0004,
            });
        }
        self.inner.interval_us.store(us as u64, Ordering::Relaxed);
        Ok(())
    }

    fn enable(&self) {
        if !self.inner.enabled.swap(true, Ordering::AcqRel) {
            self.inner.enables.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn disable(&self) {
        self.inner.enabled.store(false, Ordering::Release);
    }

    fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::Acquire)
    }
}

/// Interconnect with a fixed number of channels
#[derive(Debug)]
pub struct SimRouter {
    channels: usize,
    routes: Vec<(HwEvent, HwTask)>,
}

impl SimRouter {
    pub fn new(channels: usize) -> Self {
        Self {
            channels,
            routes: Vec::with_capacity(channels),
        }
    }

    pub fn routes(&self) -> &[(HwEvent, HwTask)] {
        &self.routes
    }
}

impl EventRouter for SimRouter {
    fn route(&mut self, event: HwEvent, task: HwTask) -> Result<(), HardwareError> {
        if self.routes.len() == self.channels {
            return Err(HardwareError::NoChannel);
        }
        debug!(?event, ?task, channel = self.routes.len(), "Route enabled");
        self.routes.push((event, task));
        Ok(())
    }
}

/// What the emulated analog input sees
pub enum SignalSource {
    /// Sine in ADC counts plus uniform noise
    Sine {
        amplitude: f64,
        cycles_per_sample: f64,
        noise: i16,
        rng: StdRng,
    },
    /// Repeat a fixed pattern
    Sequence(Box<[Sample]>),
}

impl SignalSource {
    pub fn sine(
        amplitude: f64,
        frequency_hz: f64,
        sample_rate_hz: u32,
        noise: i16,
        seed: u64,
    ) -> Self {
        SignalSource::Sine {
            amplitude,
            cycles_per_sample: frequency_hz / f64::from(sample_rate_hz.max(1)),
            noise,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sequence(samples: impl Into<Box<[Sample]>>) -> Self {
        SignalSource::Sequence(samples.into())
    }

    /// Fill `dst` with the samples at positions `t..t + dst.len()`
    fn fill(&mut self, t: u64, dst: &mut [Sample]) {
        match self {
            SignalSource::Sine {
                amplitude,
                cycles_per_sample,
                noise,
                rng,
            } => {
                for (i, s) in dst.iter_mut().enumerate() {
                    let phase = TAU * *cycles_per_sample * (t + i as u64) as f64;
                    let jitter = if *noise > 0 {
                        rng.gen_range(-*noise..=*noise)
                    } else {
                        0
                    };
                    let v = (*amplitude * phase.sin()).round() as i32 + i32::from(jitter);
                    *s = v.clamp(i32::from(Sample::MIN), i32::from(Sample::MAX)) as Sample;
                }
            }
            SignalSource::Sequence(pattern) if !pattern.is_empty() => {
                for (i, s) in dst.iter_mut().enumerate() {
                    *s = pattern[((t + i as u64) % pattern.len() as u64) as usize];
                }
            }
            SignalSource::Sequence(_) => dst.fill(0),
        }
    }
}

/// Two-deep DMA buffer queue driven by a [`SimTimer`]
pub struct SimulatedAdc {
    timer: SimTimer,
    source: SignalSource,
    queue: VecDeque<CaptureBuffer>,
    configured: bool,
    triggered: bool,
    warmed_up: bool,
    request_pending: bool,
    samples_taken: u64,
    block_period: Option<Duration>,
}

impl SimulatedAdc {
    pub fn new(timer: SimTimer, source: SignalSource) -> Self {
        Self {
            timer,
            source,
            queue: VecDeque::with_capacity(2),
            configured: false,
            triggered: false,
            warmed_up: false,
            request_pending: false,
            samples_taken: 0,
            block_period: None,
        }
    }

    /// Sleep for the block fill time before each completion
    pub fn paced(mut self, block_period: Duration) -> Self {
        self.block_period = Some(block_period);
        self
    }

    pub fn samples_taken(&self) -> u64 {
        self.samples_taken
    }

    /// Next event the driver would raise, if any
    pub fn next_event(&mut self) -> Option<AdcEvent> {
        if !self.triggered {
            return None;
        }
        if !self.warmed_up {
            self.warmed_up = true;
            return Some(AdcEvent::Ready);
        }
        if self.request_pending {
            self.request_pending = false;
            return Some(AdcEvent::BufferRequest);
        }
        if !self.timer.is_enabled() {
            return None;
        }
        let mut buffer = self.queue.pop_front()?;
        if let Some(period) = self.block_period {
            thread::sleep(period);
        }
        let n = buffer.capacity();
        self.source.fill(self.samples_taken, buffer.dma_target());
        buffer.complete(n);
        self.samples_taken += n as u64;
        // The end event restarts into the next queued buffer, which frees a queue slot
        self.request_pending = true;
        Some(AdcEvent::Done(buffer))
    }
}

impl AdcDriver for SimulatedAdc {
    fn configure(&mut self) -> Result<(), HardwareError> {
        self.configured = true;
        Ok(())
    }

    fn buffer_set(&mut self, buffer: CaptureBuffer) -> Result<(), BufferRejected> {
        if self.queue.len() >= 2 {
            return Err(BufferRejected {
                buffer,
                source: HardwareError::QueueFull,
            });
        }
        self.queue.push_back(buffer);
        Ok(())
    }

    fn mode_trigger(&mut self) -> Result<(), HardwareError> {
        if !self.configured {
            return Err(HardwareError::NotConfigured);
        }
        self.triggered = true;
        Ok(())
    }

    fn abort(&mut self) -> Vec<CaptureBuffer> {
        self.triggered = false;
        self.request_pending = false;
        self.queue.drain(..).collect()
    }
}

/// Interrupt-context emulation: feed ADC events to the manager until
/// `running` drops
pub fn run_capture(
    manager: &mut CaptureManager<SimTimer>,
    adc: &mut SimulatedAdc,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        match adc.next_event() {
            Some(event) => manager.on_event(event, adc),
            None => thread::sleep(Duration::from_millis(1)),
        }
    }
    manager.shutdown(adc);
    info!(samples = adc.samples_taken(), "Capture stopped");
}

/// Peer state flags, shared with whoever plays the remote side
#[derive(Debug, Clone, Default)]
pub struct PeerState {
    connected: Arc<AtomicBool>,
    notify_enabled: Arc<AtomicBool>,
}

impl PeerState {
    pub fn set_connected(&self, on: bool) {
        self.connected.store(on, Ordering::Release);
        if !on {
            // Subscriptions do not survive a disconnect
            self.notify_enabled.store(false, Ordering::Release);
        }
    }

    pub fn set_notify_enabled(&self, on: bool) {
        self.notify_enabled.store(on, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.connected.load(Ordering::Acquire) && self.notify_enabled.load(Ordering::Acquire)
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingTransport {
    peer: PeerState,
    chunks: Vec<Vec<u8>>,
    attempts: usize,
}

impl RecordingTransport {
    pub fn connected() -> Self {
        let t = Self::default();
        t.peer.set_connected(true);
        t.peer.set_notify_enabled(true);
        t
    }

    pub fn set_notify_enabled(&self, on: bool) {
        self.peer.set_notify_enabled(on);
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }
}

impl Transport for RecordingTransport {
    fn send_chunk(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        self.attempts += 1;
        if !self.peer.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.chunks.push(payload.to_vec());
        Ok(())
    }
}

/// Appends every notification payload to a writer
pub struct FileTransport<W> {
    peer: PeerState,
    out: W,
}

impl<W: Write> FileTransport<W> {
    pub fn new(out: W, peer: PeerState) -> Self {
        Self { peer, out }
    }
}

impl<W: Write> Transport for FileTransport<W> {
    fn send_chunk(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        if !self.peer.is_ready() {
            return Err(TransportError::NotReady);
        }
        self.out.write_all(payload).map_err(|e| {
            warn!(%e, "Recording write failed");
            TransportError::Rejected(e.raw_os_error().unwrap_or(-5))
        })
    }
}

/// Front end that logs every setter and remembers what it was told
#[derive(Debug, Default)]
pub struct LoggingFrontEnd {
    mux: Option<u8>,
    gains: [Option<u8>; 2],
    pots: [Option<u8>; 4],
    excitation_hz: Option<u32>,
    power_ups: usize,
    power_downs: usize,
}

impl LoggingFrontEnd {
    pub fn mux(&self) -> Option<u8> {
        self.mux
    }

    pub fn gain(&self, channel: u8) -> Option<u8> {
        let idx = usize::from(channel.checked_sub(1)?);
        self.gains.get(idx).copied().flatten()
    }

    pub fn potentiometer(&self, channel: u8) -> Option<u8> {
        self.pots.get(usize::from(channel)).copied().flatten()
    }

    /// Frequency the excitation is running at, `None` when stopped
    pub fn excitation(&self) -> Option<u32> {
        self.excitation_hz
    }

    pub fn power_ups(&self) -> usize {
        self.power_ups
    }

    pub fn power_downs(&self) -> usize {
        self.power_downs
    }
}

impl FrontEnd for LoggingFrontEnd {
    fn apply_excitation_frequency(&mut self, hz: u32) {
        debug!(hz, "DDS frequency");
        if self.excitation_hz.is_some() {
            self.excitation_hz = Some(hz);
        }
    }

    fn apply_excitation_offset(&mut self, volts: f64) {
        debug!(volts, "DDS offset");
    }

    fn apply_excitation_amplification(&mut self, gain: f64) {
        debug!(gain, "DDS amplification");
    }

    fn start_excitation(&mut self, hz: u32) {
        debug!(hz, "DDS start");
        self.excitation_hz = Some(hz);
    }

    fn stop_excitation(&mut self) {
        debug!("DDS sleep");
        self.excitation_hz = None;
    }

    fn apply_gain_channel(&mut self, channel: u8, level: u8) {
        debug!(channel, level, "PGA");
        if let Some(slot) = channel
            .checked_sub(1)
            .and_then(|i| self.gains.get_mut(usize::from(i)))
        {
            *slot = Some(level);
        }
    }

    fn apply_potentiometer_channel(&mut self, channel: u8, value: u8) {
        debug!(channel, value, "Digipot wiper");
        if let Some(slot) = self.pots.get_mut(usize::from(channel)) {
            *slot = Some(value);
        }
    }

    fn apply_mux(&mut self, selection: u8) {
        debug!(selection, "Mux");
        self.mux = Some(selection);
    }

    fn apply_signal_chain_offset(&mut self, volts: f64) {
        debug!(volts, "Signal chain offset");
    }

    fn apply_signal_chain_amplification(&mut self, gain: f64) {
        debug!(gain, "Signal chain amplification");
    }

    fn power_up(&mut self) {
        self.power_ups += 1;
        info!("Front end powered up");
    }

    fn power_down(&mut self) {
        self.power_downs += 1;
        info!("Front end powered down");
    }
}
