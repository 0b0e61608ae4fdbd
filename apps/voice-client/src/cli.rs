//! Command-line interface for the voice line.

use clap::Parser;
use media::{CaptureConfig, PlaybackConfig};
use shared_proto::session::ConnectParams;
use shared_proto::wire::{BLOCK_SIZE, DEFAULT_START_NODE};

use voice_client::config::{SessionConfig, DEFAULT_AGENT_URL};
use voice_client::observability::generate_session_id;

/// Voice line - duplex PCM audio with a remote voice agent
#[derive(Parser, Debug)]
#[command(name = "voice-line")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// WebSocket endpoint of the voice agent
    #[arg(long, env = "VOICE_AGENT_URL", default_value = DEFAULT_AGENT_URL)]
    pub endpoint: String,

    /// Session identifier from the negotiator; generated when absent
    #[arg(long, env = "VOICE_SESSION_ID")]
    pub session_id: Option<String>,

    /// Conversation node the agent starts from
    #[arg(long, env = "VOICE_START_NODE", default_value = DEFAULT_START_NODE)]
    pub start_node: String,

    #[arg(long, env = "VOICE_CALLER_PHONE")]
    pub caller_phone: Option<String>,

    /// Input device name (default: host default)
    #[arg(long, env = "VOICE_INPUT_DEVICE")]
    pub input_device: Option<String>,

    /// Output device name (default: host default)
    #[arg(long, env = "VOICE_OUTPUT_DEVICE")]
    pub output_device: Option<String>,

    /// RMS above which the microphone counts as speaking
    #[arg(long, env = "VOICE_SPEAKING_THRESHOLD", default_value_t = media::DEFAULT_SPEAKING_THRESHOLD)]
    pub speaking_threshold: f32,

    /// Samples per captured block
    #[arg(long, env = "VOICE_BLOCK_SIZE", default_value_t = BLOCK_SIZE)]
    pub block_size: usize,

    /// Drop the oldest agent audio beyond this many queued blocks
    #[arg(long, env = "VOICE_MAX_QUEUED_BLOCKS")]
    pub max_queued_blocks: Option<usize>,

    /// Log filter, e.g. `debug` or `voice_client=trace` (overrides RUST_LOG)
    #[arg(long, env = "APP_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Print audio level events as well
    #[arg(long)]
    pub levels: bool,

    /// List audio devices and exit
    #[arg(long)]
    pub list_devices: bool,
}

impl Args {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            endpoint: self.endpoint.clone(),
            capture: CaptureConfig {
                block_size: self.block_size,
                device_name: self.input_device.clone(),
                ..CaptureConfig::default()
            },
            playback: PlaybackConfig {
                device_name: self.output_device.clone(),
                ..PlaybackConfig::default()
            },
            speaking_threshold: self.speaking_threshold,
            max_queued_blocks: self.max_queued_blocks,
        }
    }

    pub fn connect_params(&self) -> ConnectParams {
        let session_id = self
            .session_id
            .clone()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(generate_session_id);

        ConnectParams::new(session_id)
            .with_start_node(self.start_node.clone())
            .with_caller_phone(self.caller_phone.clone())
    }
}
