//! Error types for the audio backend.
//!
//! Every native-API failure class gets its own variant carrying the platform
//! error string, so hosts can log a meaningful message and decide whether to
//! retry or fall back to the default device.

use thiserror::Error;

/// Unified error type for backend operations.
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    /// The platform audio subsystem failed to start. Fatal to the backend.
    #[error("audio subsystem failed to start: {0}")]
    SubsystemInit(String),

    /// Device enumeration failed entirely.
    #[error("device enumeration failed: {0}")]
    Enumeration(String),

    /// A device could not be opened.
    #[error("failed to open audio device: {0}")]
    DeviceOpen(String),

    /// A device's hardware format could not be queried.
    #[error("failed to query device format: {0}")]
    FormatQuery(String),

    /// A conversion stream could not be created.
    #[error("failed to create conversion stream: {0}")]
    StreamCreate(String),

    /// An existing conversion stream could not be reformatted in place.
    #[error("failed to reformat conversion stream: {0}")]
    StreamFormat(String),

    /// A conversion stream could not be bound to a device for active I/O.
    #[error("failed to bind stream to device: {0}")]
    StreamBind(String),

    /// Pushing or pulling stream data failed.
    #[error("stream data transfer failed: {0}")]
    StreamData(String),

    /// Input initialization was requested before the output endpoint had
    /// negotiated a format. Input derives its sample rate from output.
    #[error("input cannot initialize before the output endpoint")]
    OutputNotInitialized,
}

/// Result type alias for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;
