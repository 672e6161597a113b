//! Scripted command transport for API tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use nodewatch_api::transport::{CommandLines, CommandTransport, TransportError};
use nodewatch_api::{ApiConfig, AppState};

pub const NODE_LIST: &str = "ros2 node list";
pub const SERVICE_LIST: &str = "ros2 service list";

/// Transport answering exact commands from a script and recording every call.
/// Unscripted commands fail like a non-zero exit.
#[derive(Default)]
pub struct FakeTransport {
    responses: Mutex<HashMap<String, Result<String, TransportError>>>,
    streams: Mutex<HashMap<String, Vec<String>>>,
    calls: Mutex<Vec<String>>,
    delay: Duration,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleep this long (on the Tokio clock) before each `exec` answer.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn respond(self, command: &str, stdout: &str) -> Self {
        self.set(command, Ok(stdout.to_string()));
        self
    }

    pub fn fail(self, command: &str, stderr: &str) -> Self {
        self.set(
            command,
            Err(TransportError::CommandFailed {
                command: command.to_string(),
                status: "exit status: 1".to_string(),
                stderr: stderr.to_string(),
            }),
        );
        self
    }

    /// Lines emitted by `stream(command)`; the stream then stays open.
    pub fn stream_lines(self, command: &str, lines: &[&str]) -> Self {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.to_string(), lines.iter().map(|l| l.to_string()).collect());
        self
    }

    pub fn set(&self, command: &str, outcome: Result<String, TransportError>) {
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.to_string(), outcome);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == command).count()
    }

    fn record(&self, command: &str) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(command.to_string());
    }
}

#[async_trait]
impl CommandTransport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<String, TransportError> {
        self.record(command);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.responses
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
            .unwrap_or_else(|| {
                Err(TransportError::CommandFailed {
                    command: command.to_string(),
                    status: "exit status: 1".to_string(),
                    stderr: "unscripted command".to_string(),
                })
            })
    }

    async fn stream(&self, command: &str) -> Result<CommandLines, TransportError> {
        self.record(command);
        let lines = self
            .streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(command)
            .cloned()
            .ok_or_else(|| TransportError::Io {
                command: command.to_string(),
                reason: "unscripted stream".to_string(),
            })?;
        Ok(stream::iter(lines.into_iter().map(Ok))
            .chain(stream::pending())
            .boxed())
    }
}

/// A small ROS graph: one lifecycle node and two regular ones.
pub fn ros_graph() -> FakeTransport {
    FakeTransport::new()
        .respond(NODE_LIST, "/planner\n/camera/driver\n/localizer\n")
        .respond(
            SERVICE_LIST,
            "/planner/get_state\n/planner/change_state\n/camera/driver/describe_parameters\n",
        )
        .respond(
            "ros2 node info /planner",
            "/planner\n  Subscribers:\n    /odom: nav_msgs/msg/Odometry\n  Publishers:\n    /plan: nav_msgs/msg/Path\n    /rosout: rcl_interfaces/msg/Log\n  Service Servers:\n    /planner/get_state: lifecycle_msgs/srv/GetState\n  Service Clients:\n\n  Action Servers:\n\n  Action Clients:\n",
        )
        .respond(
            "ros2 param dump /planner --print",
            "/planner:\n  ros__parameters:\n    horizon: 12\n    use_sim_time: false\n",
        )
        .respond("ros2 lifecycle get /planner", "current state: active [3]\n")
        .respond(
            "ros2 node info /camera/driver",
            "/camera/driver\n  Publishers:\n    /image_raw: sensor_msgs/msg/Image\n",
        )
}

pub fn app_state(transport: Arc<FakeTransport>) -> AppState {
    AppState::build(ApiConfig::default(), transport).expect("default config is valid")
}
