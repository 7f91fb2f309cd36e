//! Callbacks from proxy workers to the player layer

use std::sync::Arc;

/// Origin failures worth telling the player about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub enum FailureKind {
    /// Connection refused or host unresolvable
    NetworkUnavailable,
    /// Connect or read timed out
    Timeout,
    /// Origin rejected the URL, usually because it expired
    UrlInvalid,
}

/// Receives `cursor / total_size` every time bytes are handed to the player.
/// Called from worker tasks.
pub trait ProgressSink: Send + Sync {
    fn on_write_progress(&self, progress: f32);
}

/// Receives each classified origin failure. Called from worker tasks.
pub trait ErrorSink: Send + Sync {
    fn on_request_error(&self, kind: FailureKind);
}

impl<F> ProgressSink for F
where
    F: Fn(f32) + Send + Sync,
{
    fn on_write_progress(&self, progress: f32) {
        self(progress)
    }
}

impl<F> ErrorSink for F
where
    F: Fn(FailureKind) + Send + Sync,
{
    fn on_request_error(&self, kind: FailureKind) {
        self(kind)
    }
}

/// The sinks a request handler reports to.
#[derive(Clone, Default)]
pub struct Sinks {
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub errors: Option<Arc<dyn ErrorSink>>,
}

impl Sinks {
    pub fn progress(&self, progress: f32) {
        if let Some(sink) = &self.progress {
            sink.on_write_progress(progress);
        }
    }

    pub fn error(&self, kind: FailureKind) {
        if let Some(sink) = &self.errors {
            sink.on_request_error(kind);
        }
    }
}
