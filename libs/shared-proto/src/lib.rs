
pub mod wire {
    /// Negotiated PCM rate on both directions of the line.
    pub const SAMPLE_RATE: u32 = 16_000;
    pub const CHANNELS: u16 = 1; // Mono
    pub const BYTES_PER_SAMPLE: usize = 2; // i16 little-endian
    /// Samples per captured block (one engine processing quantum).
    pub const BLOCK_SIZE: usize = 4096;

    /// Query parameter names carried by the connection target.
    pub const PARAM_SESSION_ID: &str = "session_id";
    pub const PARAM_START_NODE: &str = "start_node";
    pub const PARAM_CALLER_PHONE: &str = "caller_phone";

    pub const DEFAULT_START_NODE: &str = "greeting";
}

pub mod session {
    use serde::{Deserialize, Serialize};

    /// Connection-time metadata. Sent once in the connection target, never per frame.
    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ConnectParams {
        /// Opaque identifier handed out by the session negotiator.
        pub session_id: String,
        pub start_node: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub caller_phone: Option<String>,
    }

    impl ConnectParams {
        pub fn new(session_id: impl Into<String>) -> Self {
            Self {
                session_id: session_id.into(),
                start_node: crate::wire::DEFAULT_START_NODE.to_string(),
                caller_phone: None,
            }
        }

        pub fn with_start_node(mut self, start_node: impl Into<String>) -> Self {
            self.start_node = start_node.into();
            self
        }

        pub fn with_caller_phone(mut self, caller_phone: Option<String>) -> Self {
            self.caller_phone = caller_phone.filter(|v| !v.trim().is_empty());
            self
        }

        /// Query pairs in the order they are appended to the target.
        pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
            let mut pairs = vec![
                (crate::wire::PARAM_SESSION_ID, self.session_id.as_str()),
                (crate::wire::PARAM_START_NODE, self.start_node.as_str()),
            ];
            if let Some(phone) = self.caller_phone.as_deref() {
                pairs.push((crate::wire::PARAM_CALLER_PHONE, phone));
            }
            pairs
        }
    }
}

pub mod events {
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ConnectionState {
        Idle,
        Connecting,
        Active,
        Closing,
        Error,
    }

    impl ConnectionState {
        pub fn as_str(self) -> &'static str {
            match self {
                ConnectionState::Idle => "idle",
                ConnectionState::Connecting => "connecting",
                ConnectionState::Active => "active",
                ConnectionState::Closing => "closing",
                ConnectionState::Error => "error",
            }
        }
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum Speaker {
        Microphone,
        Agent,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    #[serde(rename_all = "snake_case")]
    pub enum ErrorCode {
        DeviceUnavailable,
        ConnectFailure,
        RenderFailure,
        ProtocolViolation,
        InvalidState,
    }

    /// Notifications published to observers of a voice session.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    #[serde(tag = "type", rename_all = "snake_case")]
    pub enum SessionEvent {
        Connected {
            session_id: String,
        },
        Disconnected,
        Error {
            code: ErrorCode,
            message: String,
        },
        SpeakingChanged {
            who: Speaker,
            speaking: bool,
        },
        Level {
            who: Speaker,
            rms: f32,
        },
    }
}
