//! Remote verification workers.
//!
//! The coordinator never executes verification commands itself for
//! remote-verified circuits: it drives an externally hosted worker through
//! the [`VerificationWorker`] contract and consumes its command lifecycle.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker {0} is unavailable")]
    Unavailable(String),
    #[error("worker request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("worker returned unexpected payload: {0}")]
    Protocol(String),
}

/// Lifecycle states of a command dispatched to a remote worker.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatus {
    Pending,
    InProgress,
    Success,
    Cancelling,
    Cancelled,
    Failed,
    TimedOut,
    Delayed,
}

impl CommandStatus {
    /// `true` while the command may still reach `Success`.
    pub fn is_in_flight(self) -> bool {
        matches!(self, CommandStatus::Pending | CommandStatus::InProgress)
    }
}

/// Control plane of a remote verification worker.
#[async_trait]
pub trait VerificationWorker: Send + Sync {
    async fn start(&self, handle: &str) -> Result<(), WorkerError>;
    async fn stop(&self, handle: &str) -> Result<(), WorkerError>;
    async fn is_running(&self, handle: &str) -> Result<bool, WorkerError>;
    /// Dispatches a shell command, returning the command id to poll.
    async fn run(&self, handle: &str, command: &str) -> Result<String, WorkerError>;
    async fn poll_status(&self, handle: &str, command_id: &str)
        -> Result<CommandStatus, WorkerError>;
    async fn fetch_output(&self, handle: &str, command_id: &str) -> Result<String, WorkerError>;
}

/// Stand-in used when no worker control plane is configured: every call
/// reports the worker as unavailable, so remote-verified circuits fail
/// fast instead of hanging.
pub struct UnconfiguredWorker;

#[async_trait]
impl VerificationWorker for UnconfiguredWorker {
    async fn start(&self, handle: &str) -> Result<(), WorkerError> {
        Err(WorkerError::Unavailable(handle.to_string()))
    }

    async fn stop(&self, _handle: &str) -> Result<(), WorkerError> {
        Ok(())
    }

    async fn is_running(&self, _handle: &str) -> Result<bool, WorkerError> {
        Ok(false)
    }

    async fn run(&self, handle: &str, _command: &str) -> Result<String, WorkerError> {
        Err(WorkerError::Unavailable(handle.to_string()))
    }

    async fn poll_status(
        &self,
        handle: &str,
        _command_id: &str,
    ) -> Result<CommandStatus, WorkerError> {
        Err(WorkerError::Unavailable(handle.to_string()))
    }

    async fn fetch_output(&self, handle: &str, _command_id: &str) -> Result<String, WorkerError> {
        Err(WorkerError::Unavailable(handle.to_string()))
    }
}

#[derive(Serialize)]
struct RunCommandRequest<'a> {
    command: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunCommandResponse {
    command_id: String,
}

#[derive(Deserialize)]
struct WorkerStatusResponse {
    running: bool,
}

#[derive(Deserialize)]
struct CommandStatusResponse {
    status: CommandStatus,
}

/// [`VerificationWorker`] adapter speaking JSON over HTTP to a worker host
/// daemon.
pub struct HttpWorkerClient {
    client: reqwest::Client,
    base: Url,
}

impl HttpWorkerClient {
    pub fn new(base: Url) -> Self {
        Self {
            client: reqwest::Client::new(),
            base,
        }
    }

    fn endpoint(&self, handle: &str, tail: &str) -> Result<Url, WorkerError> {
        self.base
            .join(&format!("workers/{}/{}", handle, tail))
            .map_err(|e| WorkerError::Protocol(e.to_string()))
    }
}

#[async_trait]
impl VerificationWorker for HttpWorkerClient {
    async fn start(&self, handle: &str) -> Result<(), WorkerError> {
        self.client
            .post(self.endpoint(handle, "start")?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<(), WorkerError> {
        self.client
            .post(self.endpoint(handle, "stop")?)
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }

    async fn is_running(&self, handle: &str) -> Result<bool, WorkerError> {
        let response: WorkerStatusResponse = self
            .client
            .get(self.endpoint(handle, "status")?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.running)
    }

    async fn run(&self, handle: &str, command: &str) -> Result<String, WorkerError> {
        let response: RunCommandResponse = self
            .client
            .post(self.endpoint(handle, "commands")?)
            .json(&RunCommandRequest { command })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.command_id)
    }

    async fn poll_status(
        &self,
        handle: &str,
        command_id: &str,
    ) -> Result<CommandStatus, WorkerError> {
        let response: CommandStatusResponse = self
            .client
            .get(self.endpoint(handle, &format!("commands/{}", command_id))?)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(response.status)
    }

    async fn fetch_output(&self, handle: &str, command_id: &str) -> Result<String, WorkerError> {
        let output = self
            .client
            .get(self.endpoint(handle, &format!("commands/{}/output", command_id))?)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_statuses_deserialize_from_wire_names() {
        let status: CommandStatus = serde_json::from_str("\"IN_PROGRESS\"").unwrap();
        assert_eq!(status, CommandStatus::InProgress);
        assert!(status.is_in_flight());

        let status: CommandStatus = serde_json::from_str("\"TIMED_OUT\"").unwrap();
        assert_eq!(status, CommandStatus::TimedOut);
        assert!(!status.is_in_flight());
    }
}
