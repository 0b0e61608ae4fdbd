//! Duplex voice line client: transport, session lifecycle and the glue
//! between the audio pipeline and the agent.

pub mod config;
pub mod controller;
pub mod error;
pub mod events;
pub mod observability;
pub mod transport;

pub use controller::{MuteFlags, SessionController};
pub use error::{VoiceError, VoiceResult};
pub use events::SessionListener;
pub use transport::{Connector, TransportError, WebSocketConnector};
