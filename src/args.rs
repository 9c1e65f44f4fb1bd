//! Argument parsing for running from the command line

use std::path::PathBuf;

use clap::Parser;

use crate::{
    SampleStreamConfig, ADC_SAMPLE_RATE_HZ, MAX_NOTIFY_SAMPLES, SAADC_BUFFER_SIZE,
    SAMPLES_PER_NOTIFY,
};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
pub struct Args {
    /// ADC conversions per second
    #[clap(short = 'r', long, default_value_t = ADC_SAMPLE_RATE_HZ)]
    #[clap(value_parser = clap::value_parser!(u32).range(1..=1_000_000))]
    pub sample_rate: u32,
    /// Samples per capture buffer
    #[clap(short = 'b', long, default_value_t = SAADC_BUFFER_SIZE)]
    pub buffer_capacity: usize,
    /// Samples per notification
    #[clap(short = 'n', long, default_value_t = SAMPLES_PER_NOTIFY, value_parser = valid_chunk)]
    pub samples_per_chunk: usize,
    /// Where to record the notification stream. Defaults to a timestamped file.
    #[clap(short, long)]
    pub output: Option<PathBuf>,
    /// Behave like the desktop client: send ON then START right away
    #[clap(short, long)]
    pub auto_start: bool,
    /// Frequency of the simulated input signal in Hz
    #[clap(long, default_value_t = 5.0)]
    pub signal_freq: f64,
    /// Peak amplitude of the simulated input signal in ADC counts
    #[clap(long, default_value_t = 2000.0)]
    pub signal_amplitude: f64,
    /// Seed for the simulated noise
    #[clap(long, default_value_t = 0)]
    pub seed: u64,
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity,
}

impl Args {
    pub fn stream_config(&self) -> SampleStreamConfig {
        SampleStreamConfig {
            sample_rate_hz: self.sample_rate,
            buffer_capacity: self.buffer_capacity,
            samples_per_chunk: self.samples_per_chunk,
        }
    }
}

/// Match verbosity filter with tracing subscriber log levels
pub fn convert_filter(filter: log::LevelFilter) -> tracing_subscriber::filter::LevelFilter {
    match filter {
        log::LevelFilter::Off => tracing_subscriber::filter::LevelFilter::OFF,
        log::LevelFilter::Error => tracing_subscriber::filter::LevelFilter::ERROR,
        log::LevelFilter::Warn => tracing_subscriber::filter::LevelFilter::WARN,
        log::LevelFilter::Info => tracing_subscriber::filter::LevelFilter::INFO,
        log::LevelFilter::Debug => tracing_subscriber::filter::LevelFilter::DEBUG,
        log::LevelFilter::Trace => tracing_subscriber::filter::LevelFilter::TRACE,
    }
}

fn valid_chunk(s: &str) -> Result<usize, String> {
    let n: usize = s.parse().map_err(|_| "Invalid integer".to_string())?;
    if n == 0 || n > MAX_NOTIFY_SAMPLES {
        return Err(format!("Must be in 1..={MAX_NOTIFY_SAMPLES}"));
    }
    Ok(n)
}
