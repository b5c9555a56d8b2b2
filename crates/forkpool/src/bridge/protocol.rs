//! Wire protocol types for primary-worker communication.
//!
//! The primary writes [`ControlRequest`]s to the worker's stdin; the worker
//! writes [`ControlResponse`]s to its stdout. Worker logs go to stderr so
//! they never interleave with frames.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::listener::ListenSpec;

/// Identity of one worker incarnation.
///
/// Assigned by the supervisor at spawn time and never reused, so a
/// replacement worker is always distinguishable from the one it replaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(u64);

impl WorkerId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Control messages from primary to worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    /// Initial configuration sent immediately after spawn (must be first message).
    Init {
        worker_id: WorkerId,
        listen: ListenSpec,
    },

    /// Stop serving and exit now. In-flight requests are dropped.
    Shutdown,
}

/// Control messages from worker to primary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
    /// Listener bound, accepting connections.
    Listening { pid: u32, addr: SocketAddr },

    /// Worker is about to exit on its own (handler request or shutdown).
    Exiting { code: i32, reason: String },

    /// Unrecoverable worker error. The process exits non-zero right after.
    Fatal { reason: String },
}

impl ControlResponse {
    /// Human-readable reason carried by terminal messages.
    pub fn exit_reason(&self) -> Option<&str> {
        match self {
            ControlResponse::Listening { .. } => None,
            ControlResponse::Exiting { reason, .. } | ControlResponse::Fatal { reason } => {
                Some(reason)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_display() {
        assert_eq!(WorkerId::new(7).to_string(), "w7");
    }

    #[test]
    fn init_wire_shape() {
        let msg = ControlRequest::Init {
            worker_id: WorkerId::new(3),
            listen: ListenSpec::ReusePort {
                addr: "127.0.0.1:5000".parse().unwrap(),
            },
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "init",
          "worker_id": 3,
          "listen": {
            "mode": "reuse_port",
            "addr": "127.0.0.1:5000"
          }
        }
        "#);
    }

    #[test]
    fn listening_wire_shape() {
        let msg = ControlResponse::Listening {
            pid: 4242,
            addr: "0.0.0.0:5000".parse().unwrap(),
        };
        insta::assert_json_snapshot!(msg, @r#"
        {
          "type": "listening",
          "pid": 4242,
          "addr": "0.0.0.0:5000"
        }
        "#);
    }

    #[test]
    fn exit_reason_only_on_terminal_messages() {
        let listening = ControlResponse::Listening {
            pid: 1,
            addr: "127.0.0.1:1".parse().unwrap(),
        };
        assert_eq!(listening.exit_reason(), None);

        let fatal = ControlResponse::Fatal {
            reason: "bind failed".to_string(),
        };
        assert_eq!(fatal.exit_reason(), Some("bind failed"));
    }
}
