//! Control-channel message types

use serde::{Deserialize, Serialize};

/// Messages exchanged between a burrow server and its agents.
///
/// The first frame on every inbound connection decides its role: `Login`
/// opens a control channel, `NewWorkConn` offers a work connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum ControlMessage {
    /// Agent opens a control channel
    Login {
        /// `PROTOCOL_VERSION` of the agent
        version: u32,
        run_id: String,
        remote_port: u16,
        pool_count: u32,
        use_encryption: bool,
        use_compression: bool,
    },
    /// Server accepts or rejects the login
    LoginResp {
        run_id: String,
        error: Option<String>,
    },

    /// Server asks the agent to dial back a work connection.
    /// An empty `session_id` requests a spare connection for the idle pool.
    ReqWorkConn {
        session_id: String,
    },
    /// First frame on a dialed-back work connection
    NewWorkConn {
        run_id: String,
        session_id: String,
    },
    /// Server hands a work connection to a visitor session; relayed bytes follow
    StartWorkConn {
        session_id: String,
    },

    Ping,
    Pong,
}

impl ControlMessage {
    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ControlMessage::Login { .. } => "Login",
            ControlMessage::LoginResp { .. } => "LoginResp",
            ControlMessage::ReqWorkConn { .. } => "ReqWorkConn",
            ControlMessage::NewWorkConn { .. } => "NewWorkConn",
            ControlMessage::StartWorkConn { .. } => "StartWorkConn",
            ControlMessage::Ping => "Ping",
            ControlMessage::Pong => "Pong",
        }
    }
}
