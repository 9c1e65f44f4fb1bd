//! Error types for the acquisition pipeline, the telemetry transport and the
//! command channel.

use thiserror::Error;

/// Failures reported by the timer, interconnect and ADC peripherals.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HardwareError {
    /// A peripheral driver refused its initialization
    #[error("{peripheral} init failed with code {code:#010x}")]
    Init { peripheral: &'static str, code: u32 },
    /// Every interconnect channel is already allocated
    #[error("no free interconnect channel")]
    NoChannel,
    /// The ADC already holds as many buffers as it can queue
    #[error("ADC buffer queue is full")]
    QueueFull,
    /// The ADC was asked to trigger before it was configured
    #[error("ADC not configured")]
    NotConfigured,
}

/// Errors that keep the pipeline from starting. None of these are retried.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("invalid stream configuration: {0}")]
    InvalidConfig(String),
    #[error("{stage} setup failed")]
    Init {
        stage: &'static str,
        #[source]
        source: HardwareError,
    },
    #[error("scheduler started before the timer was configured")]
    NotConfigured,
}

/// Outcome of a failed notification send.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No peer connected, or the peer has not enabled notifications
    #[error("peer not ready")]
    NotReady,
    /// The stack accepted the peer state but refused the notification
    #[error("notification rejected with code {0}")]
    Rejected(i32),
}

/// Reasons a command message is refused. The device configuration is left
/// untouched whenever one of these is produced.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("message of {len} bytes exceeds the {max} byte control buffer")]
    TooLong { len: usize, max: usize },
    #[error("{command}: cannot parse payload {payload:?}")]
    Malformed {
        command: &'static str,
        payload: String,
    },
    #[error("{command}: {value} outside [{min}, {max}]")]
    OutOfRange {
        command: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },
}
