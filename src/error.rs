//! Stream error types
//!
//! Every terminal failure funnels through `Engine::fail_with` with one of
//! these values; only the first one sticks.

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StreamError {
    #[error("network connection failed: {0}")]
    NetworkConnectionFailed(String),

    #[error("file stream get-property failed: {0}")]
    FileStreamGetPropertyFailed(String),

    #[error("file stream set-property failed: {0}")]
    FileStreamSetPropertyFailed(String),

    #[error("file stream parse failed: {0}")]
    FileStreamParseBytesFailed(String),

    #[error("file stream open failed: {0}")]
    FileStreamOpenFailed(String),

    #[error("no audio data found: {0}")]
    AudioDataNotFound(String),

    #[error("audio queue creation failed: {0}")]
    AudioQueueCreationFailed(String),

    #[error("audio queue buffer allocation failed: {0}")]
    AudioQueueBufferAllocationFailed(String),

    #[error("audio queue enqueue failed: {0}")]
    AudioQueueEnqueueFailed(String),

    #[error("audio queue add-listener failed: {0}")]
    AudioQueueAddListenerFailed(String),

    #[error("audio queue start failed: {0}")]
    AudioQueueStartFailed(String),

    #[error("audio queue pause failed: {0}")]
    AudioQueuePauseFailed(String),

    #[error("audio queue stop failed: {0}")]
    AudioQueueStopFailed(String),

    #[error("audio queue flush failed: {0}")]
    AudioQueueFlushFailed(String),

    #[error("audio packet too large for output buffer: {0}")]
    AudioBufferTooSmall(String),

    #[error("stream timed out: {0}")]
    TimedOut(String),
}

pub type Result<T> = std::result::Result<T, StreamError>;
