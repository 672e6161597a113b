//! Command transport into the ROS2 container.
//!
//! Every inspection is a `ros2` CLI call run through `docker exec` with the
//! ROS environment sourced first. The same transport backs the log stream,
//! where the command's stdout is read line by line for as long as it runs.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use nodewatch_core::{FetchError, StreamError};
use nodewatch_logs::{LineSource, LineStream};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

/// Shell prelude run before `source <setup>`: domain id from the workspace
/// file (0 when absent) and localhost-only discovery.
const ROS_ENV_PRELUDE: &str = "ROS_DOMAIN_ID=$(cat $HOME/tram.autoware/.ros_domain_id 2>/dev/null || echo 0) \
     && export ROS_DOMAIN_ID && export ROS_LOCALHOST_ONLY=1";

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Command `{command}` failed ({status}): {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("Failed to run `{command}`: {reason}")]
    Io { command: String, reason: String },
}

impl TransportError {
    /// Attach the failure to the cache key whose fetch ran the command.
    pub fn into_fetch_error(self, key: &str) -> FetchError {
        match self {
            TransportError::Timeout { after, .. } => FetchError::timeout(key, after),
            TransportError::CommandFailed { stderr, status, .. } if stderr.is_empty() => {
                FetchError::failed(key, format!("Command failed with {}", status))
            }
            TransportError::CommandFailed { stderr, .. } => FetchError::failed(key, stderr),
            other => FetchError::failed(key, other.to_string()),
        }
    }
}

/// Lines of a long-running command.
pub type CommandLines = BoxStream<'static, Result<String, TransportError>>;

// ============================================================================
// TRANSPORT TRAIT
// ============================================================================

/// Runs ROS2 CLI commands somewhere the ROS graph is reachable.
#[async_trait]
pub trait CommandTransport: Send + Sync {
    /// Run a command to completion and return its stdout.
    async fn exec(&self, command: &str) -> Result<String, TransportError>;

    /// Start a command and stream its non-empty output lines, stderr merged.
    async fn stream(&self, command: &str) -> Result<CommandLines, TransportError>;
}

// ============================================================================
// DOCKER EXEC
// ============================================================================

/// `docker exec` into a local container.
#[derive(Debug, Clone)]
pub struct DockerExecTransport {
    program: String,
    container: String,
    ros_setup: String,
    timeout: Duration,
}

impl DockerExecTransport {
    pub fn new(container: impl Into<String>, ros_setup: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: "docker".to_string(),
            container: container.into(),
            ros_setup: ros_setup.into(),
            timeout,
        }
    }

    /// Replace the `docker` binary.
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    /// Arguments passed to the docker binary for one command.
    pub fn exec_args(&self, command: &str, merge_stderr: bool) -> Vec<String> {
        let mut script = format!(
            "{} && source {} && {}",
            ROS_ENV_PRELUDE, self.ros_setup, command
        );
        if merge_stderr {
            script.push_str(" 2>&1");
        }
        vec![
            "exec".to_string(),
            "-e".to_string(),
            "PYTHONUNBUFFERED=1".to_string(),
            self.container.clone(),
            "bash".to_string(),
            "-c".to_string(),
            script,
        ]
    }

    fn command(&self, command: &str, merge_stderr: bool) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(self.exec_args(command, merge_stderr))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl CommandTransport for DockerExecTransport {
    async fn exec(&self, command: &str) -> Result<String, TransportError> {
        tracing::debug!(container = %self.container, command = %command, "Executing command");

        let child = self
            .command(command, false)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| TransportError::Io {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| TransportError::Io {
                command: command.to_string(),
                reason: e.to_string(),
            })?,
            Err(_) => {
                return Err(TransportError::Timeout {
                    command: command.to_string(),
                    after: self.timeout,
                })
            }
        };

        if !output.status.success() {
            return Err(TransportError::CommandFailed {
                command: command.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn stream(&self, command: &str) -> Result<CommandLines, TransportError> {
        tracing::debug!(container = %self.container, command = %command, "Starting stream");

        let mut child = self
            .command(command, true)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| TransportError::Io {
                command: command.to_string(),
                reason: e.to_string(),
            })?;

        let stdout = child.stdout.take().ok_or_else(|| TransportError::Io {
            command: command.to_string(),
            reason: "stdout not captured".to_string(),
        })?;

        let state = StreamState {
            lines: BufReader::new(stdout).lines(),
            _child: child,
            command: command.to_string(),
            failed: false,
        };
        Ok(stream::unfold(state, next_line).boxed())
    }
}

/// Keeps the child alive for as long as its stream is held; dropping the
/// stream kills the process.
struct StreamState {
    lines: Lines<BufReader<ChildStdout>>,
    _child: Child,
    command: String,
    failed: bool,
}

async fn next_line(mut state: StreamState) -> Option<(Result<String, TransportError>, StreamState)> {
    if state.failed {
        return None;
    }
    loop {
        match state.lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim_end_matches('\r');
                if line.is_empty() {
                    continue;
                }
                return Some((Ok(line.to_string()), state));
            }
            Ok(None) => return None,
            Err(e) => {
                state.failed = true;
                let err = TransportError::Io {
                    command: state.command.clone(),
                    reason: e.to_string(),
                };
                return Some((Err(err), state));
            }
        }
    }
}

// ============================================================================
// LOG SOURCE
// ============================================================================

/// Log source backed by `ros2 topic echo` on the source's topic.
pub struct TopicEchoSource {
    transport: Arc<dyn CommandTransport>,
}

impl TopicEchoSource {
    pub fn new(transport: Arc<dyn CommandTransport>) -> Self {
        Self { transport }
    }

    /// Command that streams a topic as YAML blocks. Best-effort QoS with a
    /// deep history so bursts from many nodes are not lost to the subscriber.
    pub fn echo_command(topic: &str) -> String {
        format!(
            "ros2 topic echo {} --no-arr --qos-reliability best_effort --qos-history keep_last --qos-depth 1000",
            topic
        )
    }
}

pub(crate) fn is_topic_name(topic: &str) -> bool {
    topic.len() > 1
        && topic.starts_with('/')
        && topic
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '/')
}

#[async_trait]
impl LineSource for TopicEchoSource {
    async fn open(&self, source_id: &str) -> Result<LineStream, StreamError> {
        if !is_topic_name(source_id) {
            return Err(StreamError::disconnected(source_id, "not a valid topic name"));
        }

        let source = source_id.to_string();
        let lines = self
            .transport
            .stream(&Self::echo_command(source_id))
            .await
            .map_err(|e| StreamError::disconnected(source_id, e.to_string()))?;

        Ok(lines
            .map(move |line| line.map_err(|e| StreamError::disconnected(source.as_str(), e.to_string())))
            .boxed())
    }
}
