//! Shared analog front-end configuration and the lifecycle flags.
//!
//! The command dispatcher is the only writer. Readers are the lifecycle loop
//! and whatever drives the peripherals. Offsets and gains are `f64`, wider
//! than any atomic we can rely on, so the settings live behind a `RwLock`.
//! The power and streaming flags sit behind their own mutex with a condvar
//! so the lifecycle loop can block on them instead of polling.

use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, RwLock};

pub const MUX_RANGE: RangeInclusive<u8> = 0..=7;
pub const PGA_CHANNELS: RangeInclusive<u8> = 1..=2;
pub const PGA_LEVELS: RangeInclusive<u8> = 0..=7;
pub const DIGIPOT_CHANNELS: RangeInclusive<u8> = 0..=3;
/// Volts
pub const OFFSET_RANGE: RangeInclusive<f64> = -3.3..=3.3;
pub const DDS_AMPLIFICATION_RANGE: RangeInclusive<f64> = -10.0..=10.0;
pub const SIGNAL_CHAIN_AMPLIFICATION_RANGE: RangeInclusive<f64> = 1.0..=7000.0;
/// Frequency `IDDS` starts the excitation signal at
pub const DEFAULT_EXCITATION_HZ: u32 = 1000;

/// Analog front-end settings as last applied
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceConfig {
    pub mux: u8,
    pub excitation_hz: u32,
    pub excitation_running: bool,
    pub excitation_offset: f64,
    pub excitation_amplification: f64,
    pub signal_chain_offset: f64,
    pub signal_chain_amplification: f64,
    /// PGA channels 1 and 2, stored at index `channel - 1`
    pub pga: [u8; 2],
    pub digipot: [u8; 4],
}

impl Default for DeviceConfig {
    /// Firmware defaults: 100K input resistance, zero-centered 1 kHz excitation
    fn default() -> Self {
        Self {
            mux: 0,
            excitation_hz: DEFAULT_EXCITATION_HZ,
            excitation_running: true,
            excitation_offset: -0.341,
            excitation_amplification: -1.0,
            signal_chain_offset: 0.6,
            signal_chain_amplification: 2.0,
            pga: [0; 2],
            digipot: [0; 4],
        }
    }
}

impl DeviceConfig {
    pub fn pga_level(&self, channel: u8) -> Option<u8> {
        PGA_CHANNELS
            .contains(&channel)
            .then(|| self.pga[usize::from(channel - 1)])
    }

    pub fn digipot_value(&self, channel: u8) -> Option<u8> {
        self.digipot.get(usize::from(channel)).copied()
    }
}

/// Flags read by the outer control loop
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    pub power_on: bool,
    pub streaming_armed: bool,
}

/// Peripheral setters for the analog chain. Calls are synchronous and only
/// have side effects; range checks happen before any of these are invoked.
pub trait FrontEnd {
    fn apply_excitation_frequency(&mut self, hz: u32);
    fn apply_excitation_offset(&mut self, volts: f64);
    fn apply_excitation_amplification(&mut self, gain: f64);
    fn start_excitation(&mut self, hz: u32);
    fn stop_excitation(&mut self);
    fn apply_gain_channel(&mut self, channel: u8, level: u8);
    fn apply_potentiometer_channel(&mut self, channel: u8, value: u8);
    fn apply_mux(&mut self, selection: u8);
    fn apply_signal_chain_offset(&mut self, volts: f64);
    fn apply_signal_chain_amplification(&mut self, gain: f64);
    fn power_up(&mut self);
    fn power_down(&mut self);

    /// Push the mux, excitation and signal-chain settings in `cfg`. Gain and
    /// potentiometer channels are left as they are.
    fn apply_baseline(&mut self, cfg: &DeviceConfig) {
        self.apply_mux(cfg.mux);
        self.apply_excitation_offset(cfg.excitation_offset);
        self.apply_excitation_amplification(cfg.excitation_amplification);
        if cfg.excitation_running {
            self.start_excitation(cfg.excitation_hz);
        } else {
            self.stop_excitation();
        }
        self.apply_signal_chain_amplification(cfg.signal_chain_amplification);
        self.apply_signal_chain_offset(cfg.signal_chain_offset);
    }
}

/// Injectable store shared by the dispatcher and the lifecycle loop
#[derive(Debug, Default)]
pub struct DeviceConfigStore {
    settings: RwLock<DeviceConfig>,
    lifecycle: Mutex<Lifecycle>,
    changed: Condvar,
}

impl DeviceConfigStore {
    pub fn new(initial: DeviceConfig) -> Self {
        Self {
            settings: RwLock::new(initial),
            ..Default::default()
        }
    }

    pub fn snapshot(&self) -> DeviceConfig {
        *self.settings.read()
    }

    pub fn update<R>(&self, f: impl FnOnce(&mut DeviceConfig) -> R) -> R {
        f(&mut self.settings.write())
    }

    pub fn is_power_on(&self) -> bool {
        self.lifecycle.lock().power_on
    }

    pub fn is_streaming_armed(&self) -> bool {
        self.lifecycle.lock().streaming_armed
    }

    pub fn set_power_on(&self, on: bool) {
        self.modify_lifecycle(|l| l.power_on = on);
    }

    pub fn arm_streaming(&self) {
        self.modify_lifecycle(|l| l.streaming_armed = true);
    }

    fn modify_lifecycle(&self, f: impl FnOnce(&mut Lifecycle)) {
        let mut guard = self.lifecycle.lock();
        f(&mut guard);
        self.changed.notify_all();
    }

    /// Block until `pred` holds or `timeout` passes. Returns whether `pred` held.
    pub fn wait_until(&self, pred: impl Fn(&Lifecycle) -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut guard = self.lifecycle.lock();
        while !pred(&guard) {
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                return pred(&guard);
            }
        }
        true
    }

    pub fn wait_for_power_on(&self, timeout: Duration) -> bool {
        self.wait_until(|l| l.power_on, timeout)
    }

    pub fn wait_for_streaming_armed(&self, timeout: Duration) -> bool {
        self.wait_until(|l| l.streaming_armed, timeout)
    }

    pub fn wait_for_power_off(&self, timeout: Duration) -> bool {
        self.wait_until(|l| !l.power_on, timeout)
    }

    /// Wake every waiter so it can re-check external shutdown conditions
    pub fn notify(&self) {
        let _guard = self.lifecycle.lock();
        self.changed.notify_all();
    }
}
