//! Remote capability seam
//!
//! The registry only ever talks to servers through [`RemoteSession`]s handed
//! out by a [`Connector`]. [`SshConnector`] is the network-backed
//! implementation; tests plug in an in-memory fake.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::registry::ServerConfig;
use crate::ssh::{SshConnection, TunnelHandle};

/// Result of a remote command execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub command: String,
    /// -1 when the command hit its deadline
    pub exit_code: i32,
    /// stdout followed by stderr
    pub output: String,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }

    pub fn deadline_exceeded(command: &str, duration: Duration) -> Self {
        Self {
            command: command.to_string(),
            exit_code: -1,
            output: String::new(),
            duration_ms: duration.as_millis() as u64,
            timestamp: Utc::now(),
            timed_out: true,
        }
    }
}

/// One authenticated session to one remote host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Establish transport and authenticate. Idempotent.
    async fn connect(&self, deadline: Duration) -> Result<()>;

    /// Run a command in a fresh sub-session.
    ///
    /// A deadline expiry is reported as a timed-out [`CommandOutput`], not as
    /// an error.
    async fn execute(&self, command: &str, deadline: Duration) -> Result<CommandOutput>;

    /// Stream a local file to `remote`, returning bytes written.
    async fn upload_file(&self, local: &Path, remote: &str, deadline: Duration) -> Result<u64>;

    /// Stream `remote` into a local file, returning bytes read.
    async fn download_file(&self, remote: &str, local: &Path, deadline: Duration) -> Result<u64>;

    /// Forward `127.0.0.1:local_port` to `remote_host:remote_port`.
    async fn create_tunnel(
        &self,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelHandle>;

    /// Probe the session with a trivial command.
    async fn is_connected(&self) -> bool;

    /// Release the session. Idempotent.
    async fn close(&self);
}

/// Factory for unconnected sessions
pub trait Connector: Send + Sync {
    fn open(&self, config: &ServerConfig) -> Arc<dyn RemoteSession>;
}

/// Connector producing real SSH sessions
#[derive(Debug, Default, Clone, Copy)]
pub struct SshConnector;

impl Connector for SshConnector {
    fn open(&self, config: &ServerConfig) -> Arc<dyn RemoteSession> {
        Arc::new(SshConnection::new(config.clone()))
    }
}
