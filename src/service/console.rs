//! Line-delimited JSON admin console.
//!
//! Each input line is one command object tagged by `command`; each reply is
//! one line, either `{"status":"ok","result":...}` or
//! `{"status":"error","message":...}`. A malformed line gets an error reply
//! and the loop carries on.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

use super::guard::RateLimitGuard;
use crate::error::Result;
use crate::ratelimit::{Clock, Policy, RateLimiter, Snapshot, SystemClock};

/// A console command.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    CheckRateLimit {
        identifier: String,
        operation: String,
    },
    CheckLimit {
        identifier: String,
        operation: String,
        #[serde(default)]
        policy: Option<Policy>,
    },
    IsBlocked {
        identifier: String,
        operation: String,
    },
    BlockUser {
        identifier: String,
        operation: String,
        duration_ms: u64,
    },
    ResetLimit {
        identifier: String,
        #[serde(default)]
        operation: Option<String>,
    },
    GetStats {
        #[serde(default)]
        identifier: Option<String>,
    },
    ExportRecords,
    ImportRecords {
        snapshot: Snapshot,
    },
    Sweep,
}

/// A console reply.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Reply {
    Ok { result: Value },
    Error { message: String },
}

/// Serves console commands against a shared limiter.
pub struct Console<C: Clock = SystemClock> {
    guard: RateLimitGuard<C>,
}

impl<C: Clock> Console<C> {
    pub fn new(rate_limiter: Arc<RateLimiter<C>>) -> Self {
        Self {
            guard: RateLimitGuard::new(rate_limiter),
        }
    }

    /// Run one command.
    pub fn execute(&self, command: Command) -> Result<Value> {
        let limiter = self.guard.rate_limiter();
        let result = match command {
            Command::CheckRateLimit {
                identifier,
                operation,
            } => serde_json::to_value(self.guard.check_rate_limit(&identifier, &operation)?)?,
            Command::CheckLimit {
                identifier,
                operation,
                policy,
            } => serde_json::to_value(limiter.check_limit(&identifier, &operation, policy)?)?,
            Command::IsBlocked {
                identifier,
                operation,
            } => json!({ "blocked": limiter.is_blocked(&identifier, &operation) }),
            Command::BlockUser {
                identifier,
                operation,
                duration_ms,
            } => {
                limiter.block_user(&identifier, &operation, duration_ms)?;
                json!({ "blocked": true })
            }
            Command::ResetLimit {
                identifier,
                operation,
            } => {
                let removed = limiter.reset_limit(&identifier, operation.as_deref());
                json!({ "removed": removed })
            }
            Command::GetStats { identifier } => {
                serde_json::to_value(limiter.get_stats(identifier.as_deref()))?
            }
            Command::ExportRecords => serde_json::to_value(limiter.export_records())?,
            Command::ImportRecords { snapshot } => {
                let imported = limiter.import_records(snapshot)?;
                json!({ "imported": imported })
            }
            Command::Sweep => json!({ "evicted": limiter.sweep_expired() }),
        };
        Ok(result)
    }

    /// Parse and run one input line.
    pub fn handle_line(&self, line: &str) -> Reply {
        let command: Command = match serde_json::from_str(line) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "Malformed console command");
                return Reply::Error {
                    message: format!("malformed command: {}", e),
                };
            }
        };

        debug!(command = ?command, "Processing console command");
        match self.execute(command) {
            Ok(result) => Reply::Ok { result },
            Err(e) => Reply::Error {
                message: e.to_string(),
            },
        }
    }

    /// Serve commands from `reader` until EOF or until `signal` resolves.
    ///
    /// Lines that are not valid UTF-8 get an error reply like any other
    /// malformed command.
    pub async fn serve_with_shutdown<R, W, F>(
        &self,
        mut reader: R,
        mut writer: W,
        signal: F,
    ) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        info!("Console ready for commands");

        let mut buf = Vec::new();
        tokio::pin!(signal);

        loop {
            buf.clear();
            tokio::select! {
                read = reader.read_until(b'\n', &mut buf) => {
                    if read? == 0 {
                        info!("Console input closed");
                        break;
                    }

                    let reply = match std::str::from_utf8(&buf) {
                        Ok(line) => {
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            self.handle_line(line)
                        }
                        Err(e) => {
                            warn!(error = %e, "Console command is not valid UTF-8");
                            Reply::Error {
                                message: format!("malformed command: {}", e),
                            }
                        }
                    };

                    let mut encoded = serde_json::to_vec(&reply)?;
                    encoded.push(b'\n');
                    writer.write_all(&encoded).await?;
                    writer.flush().await?;
                }
                _ = &mut signal => {
                    info!("Console shutting down");
                    break;
                }
            }
        }

        writer.flush().await?;
        Ok(())
    }
}
