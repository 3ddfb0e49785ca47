//! Agent error types

use thiserror::Error;

/// Errors produced by the bridge agent.
///
/// `Cancelled` is distinguished from every failure variant: interruptible
/// waits return it when the shutdown token fires, and the session loop treats
/// it as a clean stop rather than something to retry.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Missing or invalid required settings field
    #[error("configuration error: {0}")]
    Config(String),

    /// The backend rejected the supplied pairing code
    #[error("pairing code not recognized")]
    InvalidPairCode,

    /// Pairing exchange failed for a reason other than a bad code
    #[error("pairing failed: {0}")]
    Pairing(String),

    /// The transcoder binary could not be launched
    #[error("failed to start {binary}: {source}")]
    TranscoderStart {
        binary: String,
        source: std::io::Error,
    },

    /// The transcoder exited with a non-zero code
    #[error("ffmpeg exited with code {code}")]
    TranscoderExited { code: i32 },

    /// The transcoder was terminated by a signal
    #[error("ffmpeg terminated by signal {signal}")]
    TranscoderSignaled { signal: i32 },

    /// The transcoder exited cleanly, which it never does in normal operation
    #[error("ffmpeg exited unexpectedly")]
    TranscoderEnded,

    /// An upload ran out of retry attempts
    #[error("upload failed after {attempts} attempts: {last_error}")]
    UploadExhausted { attempts: u32, last_error: String },

    /// Shutdown was requested while waiting or retrying
    #[error("operation cancelled")]
    Cancelled,

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

/// Result type for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
