use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::error::{Result, UpstreamError};

/// Handle to a remote call running in the background.
///
/// Dropping the handle (or letting [`wait_timeout`](Self::wait_timeout)
/// expire) only stops waiting locally; the remote call carries on.
#[derive(Debug)]
pub struct PendingCall<T> {
    dependency: &'static str,
    handle: JoinHandle<Result<T>>,
}

impl<T: Send + 'static> PendingCall<T> {
    pub(crate) fn spawn<F>(dependency: &'static str, call: F) -> Self
    where
        F: Future<Output = Result<T>> + Send + 'static,
    {
        Self {
            dependency,
            handle: tokio::spawn(call),
        }
    }

    /// Waits for the remote call to complete.
    pub async fn wait(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(UpstreamError::Unavailable {
                dependency: self.dependency.to_string(),
                reason: format!("call task failed: {err}"),
            }),
        }
    }

    /// Waits at most `deadline`; on expiry the call is abandoned locally.
    pub async fn wait_timeout(self, deadline: Duration) -> Result<T> {
        let dependency = self.dependency;
        match tokio::time::timeout(deadline, self.wait()).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(dependency, ?deadline, "gave up waiting for upstream call");
                Err(UpstreamError::Unavailable {
                    dependency: dependency.to_string(),
                    reason: format!("no answer within {deadline:?}"),
                })
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn dependency(&self) -> &'static str {
        self.dependency
    }
}
