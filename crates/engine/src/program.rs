//! Program execution — spawning and supervising run child processes.
//!
//! A [`Program`] is the bound form of a job's program template: a tagged
//! variant that can start a child, be serialized into the run record, and
//! be reconnected to after a restart. The child's stdin is `/dev/null`;
//! stdout and stderr are merged into a single captured blob. Exit code 0
//! is success, anything else is a failure.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::Arc;

use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Output id under which the merged stdout+stderr blob is stored.
pub const OUTPUT_ID: &str = "output";

/// How often a reconnected waiter polls the pid.
const RECONNECT_POLL_MS: u64 = 500;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Program
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Program {
    /// An argv vector executed directly.
    Process { argv: Vec<String> },
    /// A single shell string, run as `/bin/sh -c <command>`.
    Shell { command: String },
}

impl Program {
    /// The concrete argv this program executes.
    pub fn argv(&self) -> Vec<String> {
        match self {
            Self::Process { argv } => argv.clone(),
            Self::Shell { command } => {
                vec!["/bin/sh".into(), "-c".into(), command.clone()]
            }
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Start / completion types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// The child could not be launched at all.
#[derive(thiserror::Error, Debug)]
#[error("{message}")]
pub struct StartError {
    pub message: String,
}

/// How a supervised child finished. Converted into a run transition at
/// the supervision boundary; never propagated further.
#[derive(Debug)]
pub enum Outcome {
    /// Exit code 0.
    Success {
        meta: BTreeMap<String, Value>,
        outputs: BTreeMap<String, Vec<u8>>,
    },
    /// The child ran and exited nonzero.
    Failure {
        message: String,
        meta: BTreeMap<String, Value>,
        outputs: BTreeMap<String, Vec<u8>>,
    },
    /// Supervision itself failed (wait error, reconnect failure, …).
    Error {
        message: String,
        meta: BTreeMap<String, Value>,
        outputs: BTreeMap<String, Vec<u8>>,
    },
}

/// A running child: observations captured at spawn plus a future that
/// resolves when the child exits.
pub struct Launch {
    pub meta: BTreeMap<String, Value>,
    pub wait: BoxFuture<'static, Outcome>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Start
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

impl Program {
    /// Spawn the child process. Returns the spawn-time observations
    /// (hostname, username, start_time, pid) and the completion future.
    pub fn start(&self) -> Result<Launch, StartError> {
        let argv = self.argv();
        let (exe, rest) = argv.split_first().ok_or_else(|| StartError {
            message: "empty argv".into(),
        })?;

        let mut cmd = Command::new(exe);
        cmd.args(rest)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| StartError {
            message: format!("failed to spawn {exe}: {e}"),
        })?;

        let pid = child.id();
        let meta = BTreeMap::from([
            ("hostname".into(), json!(local_hostname())),
            ("username".into(), json!(local_username())),
            ("start_time".into(), json!(Utc::now().to_rfc3339())),
            ("pid".into(), json!(pid)),
        ]);

        // Merge stdout and stderr into one buffer via twin reader tasks.
        let merged = Arc::new(Mutex::new(Vec::new()));
        let out_task = child
            .stdout
            .take()
            .map(|s| tokio::spawn(drain_into(s, merged.clone())));
        let err_task = child
            .stderr
            .take()
            .map(|s| tokio::spawn(drain_into(s, merged.clone())));

        let wait = async move {
            let status = child.wait().await;
            if let Some(t) = out_task {
                let _ = t.await;
            }
            if let Some(t) = err_task {
                let _ = t.await;
            }

            let output = std::mem::take(&mut *merged.lock());
            let outputs = BTreeMap::from([(OUTPUT_ID.to_string(), output)]);
            let mut meta = BTreeMap::from([(
                "end_time".to_string(),
                json!(Utc::now().to_rfc3339()),
            )]);

            match status {
                Ok(status) => {
                    let code = status.code();
                    meta.insert("return_code".into(), json!(code));
                    match code {
                        Some(0) => Outcome::Success { meta, outputs },
                        Some(code) => Outcome::Failure {
                            message: format!("return code = {code}"),
                            meta,
                            outputs,
                        },
                        // Killed by signal; there is no exit code.
                        None => Outcome::Failure {
                            message: "terminated by signal".into(),
                            meta,
                            outputs,
                        },
                    }
                }
                Err(e) => Outcome::Error {
                    message: format!("waiting for child failed: {e}"),
                    meta,
                    outputs,
                },
            }
        }
        .boxed();

        Ok(Launch { meta, wait })
    }

    /// Re-establish a waiter for a child recorded in `meta` (by pid, on
    /// the recorded host). The waiter is not the child's parent, so the
    /// exit status is unobservable: a pid that disappears resolves as a
    /// program error with an "exit status unknown" message.
    pub fn reconnect(&self, meta: &BTreeMap<String, Value>) -> BoxFuture<'static, Outcome> {
        let recorded_host = meta
            .get("hostname")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let pid = meta.get("pid").and_then(|v| v.as_u64());

        async move {
            let local = local_hostname();
            match recorded_host {
                Some(host) if host != local => {
                    return Outcome::Error {
                        message: format!(
                            "run was started on {host}, not the local host {local}"
                        ),
                        meta: BTreeMap::new(),
                        outputs: BTreeMap::new(),
                    };
                }
                None => {
                    return Outcome::Error {
                        message: "no hostname recorded; cannot reconnect".into(),
                        meta: BTreeMap::new(),
                        outputs: BTreeMap::new(),
                    };
                }
                Some(_) => {}
            }

            let Some(pid) = pid else {
                return Outcome::Error {
                    message: "no pid recorded; cannot reconnect".into(),
                    meta: BTreeMap::new(),
                    outputs: BTreeMap::new(),
                };
            };

            if !pid_alive(pid) {
                return Outcome::Error {
                    message: format!("process {pid} is no longer running; cannot reconnect"),
                    meta: BTreeMap::new(),
                    outputs: BTreeMap::new(),
                };
            }

            // Poll until the pid disappears.
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(RECONNECT_POLL_MS)).await;
                if !pid_alive(pid) {
                    let meta = BTreeMap::from([(
                        "end_time".to_string(),
                        json!(Utc::now().to_rfc3339()),
                    )]);
                    return Outcome::Error {
                        message: format!(
                            "process {pid} exited while detached; exit status unknown"
                        ),
                        meta,
                        outputs: BTreeMap::new(),
                    };
                }
            }
        }
        .boxed()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

async fn drain_into(mut reader: impl AsyncRead + Unpin, sink: Arc<Mutex<Vec<u8>>>) {
    let mut buf = [0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => sink.lock().extend_from_slice(&buf[..n]),
        }
    }
}

fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "localhost".into())
}

fn local_username() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".into())
}

fn pid_alive(pid: u64) -> bool {
    std::path::Path::new(&format!("/proc/{pid}")).exists()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
