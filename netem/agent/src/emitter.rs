//! Shell-out command emitter for nftables and traffic control.
//!
//! All kernel state changes of the agent funnel through [`Emitter`]. The
//! real implementation serialises concurrent callers with a mutex, since
//! both the reconciler and the peer watcher tasks emit commands.

use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use serde_json::Value;
use tokio::{io::AsyncWriteExt, process::Command, sync::Mutex, time::timeout};
use tracing::Level;

use crate::{error::EmitError, nft::NftCommand};

pub const NFT_PROGRAM: &str = "nft";

const TC_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Emitter: Send + Sync + 'static {
    /// Apply a batch of nftables commands atomically and return the parsed
    /// JSON output (relevant for `list` commands, `Null` otherwise).
    async fn nft(&self, cmds: Vec<NftCommand>) -> Result<Value, EmitError>;

    /// Run one traffic-control command, failing on a non-zero exit code.
    async fn tc(&self, command: &str) -> Result<(), EmitError>;

    /// Run one traffic-control command, ignoring failure. Used on cleanup
    /// paths where the object may legitimately be absent already.
    async fn tc_quiet(&self, command: &str);
}

#[derive(Debug, Default)]
pub struct CommandEmitter {
    lock: Mutex<()>,
}

impl CommandEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    async fn run_tc(&self, command: &str) -> Result<(), EmitError> {
        let _guard = self.lock.lock().await;

        let mut parts = command.split_whitespace();
        let program = parts.next().ok_or_else(|| EmitError::Spawn {
            command: command.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
        })?;

        let output = timeout(TC_TIMEOUT, Command::new(program).args(parts).output())
            .await
            .map_err(|_| EmitError::Timeout {
                command: command.to_string(),
            })?
            .map_err(|source| EmitError::Spawn {
                command: command.to_string(),
                source,
            })?;

        if !output.status.success() {
            return Err(EmitError::Command {
                command: command.to_string(),
                rc: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(())
    }
}

#[async_trait]
impl Emitter for CommandEmitter {
    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    async fn nft(&self, cmds: Vec<NftCommand>) -> Result<Value, EmitError> {
        if cmds.is_empty() {
            return Ok(Value::Null);
        }

        let payload = serde_json::to_string(&serde_json::json!({ "nftables": cmds }))
            .map_err(EmitError::Output)?;

        let _guard = self.lock.lock().await;

        let command = format!("{NFT_PROGRAM} -j -f -");
        let mut child = Command::new(NFT_PROGRAM)
            .args(["-j", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| EmitError::Spawn {
                command: command.clone(),
                source,
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .map_err(|source| EmitError::Spawn {
                    command: command.clone(),
                    source,
                })?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|source| EmitError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(EmitError::Command {
                command,
                rc: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        if output.stdout.is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_slice(&output.stdout).map_err(EmitError::Output)
    }

    #[tracing::instrument(level = Level::TRACE, skip(self), err)]
    async fn tc(&self, command: &str) -> Result<(), EmitError> {
        self.run_tc(command).await
    }

    #[tracing::instrument(level = Level::TRACE, skip(self))]
    async fn tc_quiet(&self, command: &str) {
        if let Err(error) = self.run_tc(command).await {
            tracing::debug!(%error, command, "Ignoring failed tc command");
        }
    }
}
