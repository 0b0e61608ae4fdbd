//! Audio side of the voice line: codec, capture, playback and activity
//! detection. Nothing in here touches the network.

pub mod activity;
pub mod capture;
pub mod codec;
pub mod devices;
pub mod error;
pub mod playback;
pub mod scheduler;
mod stream;

pub use activity::{calculate_rms, rms_to_db, ActivityDetector, DEFAULT_SPEAKING_THRESHOLD};
pub use capture::{BlockReceiver, CaptureConfig, CaptureDevice, CpalCapture};
pub use devices::{
    default_input_device_name, default_output_device_name, list_input_devices,
    list_output_devices,
};
pub use error::{MediaError, MediaResult};
pub use playback::{completed, CpalRenderer, PlaybackConfig, RenderCompletion, Renderer};
pub use scheduler::{PlaybackEvent, PlaybackScheduler};
