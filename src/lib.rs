use std::time::Duration;

pub mod args;
pub mod capture;
pub mod command;
pub mod control;
pub mod device;
pub mod error;
pub mod exfil;
pub mod monitoring;
pub mod scheduler;
pub mod sim;
pub mod staging;

pub use error::{CommandError, HardwareError, PipelineError, TransportError};

pub const ADC_SAMPLE_RATE_HZ: u32 = 3000;
/// Samples per capture block
pub const SAADC_BUFFER_SIZE: usize = 3000;
pub const SAMPLES_PER_NOTIFY: usize = 40;
/// Largest chunk that fits one notification at a 247 byte MTU (244 bytes of payload)
pub const MAX_NOTIFY_SAMPLES: usize = 122;
pub const MAX_SAMPLE_RATE_HZ: u32 = 1_000_000;

/// One signed 16-bit ADC conversion
pub type Sample = i16;

/// Shape of the sample stream. Fixed once the pipeline has been brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleStreamConfig {
    pub sample_rate_hz: u32,
    pub buffer_capacity: usize,
    pub samples_per_chunk: usize,
}

impl Default for SampleStreamConfig {
    fn default() -> Self {
        Self {
            sample_rate_hz: ADC_SAMPLE_RATE_HZ,
            buffer_capacity: SAADC_BUFFER_SIZE,
            samples_per_chunk: SAMPLES_PER_NOTIFY,
        }
    }
}

impl SampleStreamConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.sample_rate_hz == 0 || self.sample_rate_hz > MAX_SAMPLE_RATE_HZ {
            return Err(PipelineError::InvalidConfig(format!(
                "sample rate {} Hz not in 1..={MAX_SAMPLE_RATE_HZ}",
                self.sample_rate_hz
            )));
        }
        if self.buffer_capacity == 0 {
            return Err(PipelineError::InvalidConfig(
                "buffer capacity must be non-zero".to_owned(),
            ));
        }
        if self.samples_per_chunk == 0 || self.samples_per_chunk > MAX_NOTIFY_SAMPLES {
            return Err(PipelineError::InvalidConfig(format!(
                "{} samples per chunk not in 1..={MAX_NOTIFY_SAMPLES}",
                self.samples_per_chunk
            )));
        }
        Ok(())
    }

    /// Timer period between conversions, truncated to whole microseconds
    pub fn sample_interval(&self) -> Duration {
        Duration::from_micros(1_000_000 / u64::from(self.sample_rate_hz.max(1)))
    }

    /// Wall-clock time it takes the hardware to fill one capture buffer
    pub fn block_period(&self) -> Duration {
        self.sample_interval() * self.buffer_capacity as u32
    }
}
