use thiserror::Error;

/// Rejected schedule configuration. Never reaches persistence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Hour outside `0..=23`.
    #[error("hour {0} out of range (0-23)")]
    Hour(u32),
    /// Minute outside `0..=59`.
    #[error("minute {0} out of range (0-59)")]
    Minute(u32),
}

/// Failures of a dispatch cycle or a single send.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Send attempted while the gateway is not connected.
    #[error("messaging gateway is not connected; pair the device through /qr first")]
    TransportNotReady,
    /// A single send failed on the transport.
    #[error("transport error: {0}")]
    Transport(String),
    /// The bulk-send backend failed as a whole.
    #[error("backend error: {0}")]
    Backend(String),
    /// Local persistence failed while recording results.
    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// Errors raised by the reconnect state machine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReconnectError {
    /// A connection attempt is already in flight.
    #[error("a connection attempt is already in progress")]
    AlreadyConnecting,
}

/// Errors raised by the scheduler service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulerError {
    /// No bulk sender was registered for the feature area.
    #[error("no dispatcher registered for {0}")]
    Unregistered(crate::schedule::Feature),
    /// The schedule failed validation.
    #[error(transparent)]
    Config(#[from] ConfigError),
}
