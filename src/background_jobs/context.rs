use tokio_util::sync::CancellationToken;

/// Context provided to executors while a job body runs.
#[derive(Clone, Default)]
pub struct JobContext {
    /// Cancelled when the process shuts down.
    pub cancellation_token: CancellationToken,
}

impl JobContext {
    pub fn new(cancellation_token: CancellationToken) -> Self {
        Self { cancellation_token }
    }

    /// Check if cancellation has been requested.
    ///
    /// Long-running executors should poll this and return
    /// `JobError::Cancelled` once it flips.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}
