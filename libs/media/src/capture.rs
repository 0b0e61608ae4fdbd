//! Microphone capture pipeline.
//!
//! Produces fixed-size mono float blocks on an unbounded channel until the
//! device is closed.

use crate::devices::find_input_device;
use crate::error::{MediaError, MediaResult};
use crate::stream::StreamThread;
use cpal::traits::DeviceTrait;
use shared_proto::wire::{BLOCK_SIZE, CHANNELS, SAMPLE_RATE};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Captured float blocks in capture order.
pub type BlockReceiver = mpsc::UnboundedReceiver<Vec<f32>>;

/// Sending half shared by the data and error callbacks. Emptied once the
/// device is gone, which ends the receiver's stream.
type BlockSender = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>;

fn lock_sender(sender: &BlockSender) -> MutexGuard<'_, Option<mpsc::UnboundedSender<Vec<f32>>>> {
    sender.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Append `data` and emit every complete block.
fn push_samples(pending: &mut Vec<f32>, block_size: usize, sender: &BlockSender, data: &[f32]) {
    let guard = lock_sender(sender);
    let Some(tx) = guard.as_ref() else {
        return;
    };

    pending.extend_from_slice(data);
    while pending.len() >= block_size {
        let block: Vec<f32> = pending.drain(..block_size).collect();
        // Receiver gone means the session was torn down
        if tx.send(block).is_err() {
            pending.clear();
            break;
        }
    }
}

fn on_stream_error(sender: &BlockSender, err: &cpal::StreamError) {
    tracing::error!(component = "media.capture", error = %err, "capture stream error");
    if matches!(err, cpal::StreamError::DeviceNotAvailable) && lock_sender(sender).take().is_some() {
        tracing::warn!(component = "media.capture", "input device lost, ending capture");
    }
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConfig {
    /// Target sample rate (default: 16000, the wire rate)
    pub sample_rate: u32,
    /// Samples per emitted block
    pub block_size: usize,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
    /// Input device name; `None` uses the host default
    pub device_name: Option<String>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            block_size: BLOCK_SIZE,
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
            device_name: None,
        }
    }
}

/// Exclusive handle on an input device.
pub trait CaptureDevice: Send {
    /// Acquire the device and start emitting blocks.
    fn open(&mut self, config: &CaptureConfig) -> MediaResult<BlockReceiver>;

    /// Release the device. Safe to call when never opened or already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

/// Capture backed by a cpal input stream.
#[derive(Default)]
pub struct CpalCapture {
    stream: Option<StreamThread>,
}

impl CpalCapture {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CaptureDevice for CpalCapture {
    fn open(&mut self, config: &CaptureConfig) -> MediaResult<BlockReceiver> {
        if self.stream.is_some() {
            return Err(MediaError::DeviceUnavailable(
                "capture device is already open".to_string(),
            ));
        }
        if config.block_size == 0 {
            return Err(MediaError::DeviceUnavailable(
                "capture block size must be greater than 0".to_string(),
            ));
        }

        // cpal exposes raw device streams only; voice processing stays with the host stack
        tracing::debug!(
            component = "media.capture",
            echo_cancellation = config.echo_cancellation,
            noise_suppression = config.noise_suppression,
            auto_gain_control = config.auto_gain_control,
            "requested capture constraints"
        );

        let (block_tx, block_rx) = mpsc::unbounded_channel();
        let sender: BlockSender = Arc::new(Mutex::new(Some(block_tx)));
        let config = config.clone();

        let stream = StreamThread::spawn("voice-capture", move || {
            let device = find_input_device(config.device_name.as_deref())?;
            tracing::info!(
                component = "media.capture",
                device = ?device.name(),
                sample_rate = config.sample_rate,
                block_size = config.block_size,
                "using input device"
            );

            let stream_config = cpal::StreamConfig {
                channels: CHANNELS,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            let block_size = config.block_size;
            let mut pending: Vec<f32> = Vec::with_capacity(block_size * 2);
            let error_sender = sender.clone();

            device
                .build_input_stream(
                    &stream_config,
                    move |data: &[f32], _info: &cpal::InputCallbackInfo| {
                        push_samples(&mut pending, block_size, &sender, data);
                    },
                    move |err| on_stream_error(&error_sender, &err),
                    None,
                )
                .map_err(|e| MediaError::DeviceUnavailable(format!("failed to open input stream: {e}")))
        })?;

        self.stream = Some(stream);
        Ok(block_rx)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            tracing::info!(component = "media.capture", "input device released");
        }
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}
