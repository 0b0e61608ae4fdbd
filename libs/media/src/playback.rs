//! Output rendering context.
//!
//! A renderer plays one block at a time and resolves that block's
//! completion when its last sample has been handed to the device.

use crate::devices::find_output_device;
use crate::error::{MediaError, MediaResult};
use crate::stream::StreamThread;
use cpal::traits::DeviceTrait;
use shared_proto::wire::{CHANNELS, SAMPLE_RATE};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// Resolves once the block passed to [`Renderer::render`] finished playing.
pub type RenderCompletion = oneshot::Receiver<MediaResult<()>>;

/// A completion that is already resolved.
pub fn completed(result: MediaResult<()>) -> RenderCompletion {
    let (tx, rx) = oneshot::channel();
    let _ = tx.send(result);
    rx
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackConfig {
    pub sample_rate: u32,
    /// Output device name; `None` uses the host default
    pub device_name: Option<String>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            device_name: None,
        }
    }
}

pub trait Renderer: Send {
    fn open(&mut self, config: &PlaybackConfig) -> MediaResult<()>;

    /// Start rendering `block`. At most one block may be in flight.
    fn render(&mut self, block: Vec<f32>) -> RenderCompletion;

    /// Release the output device. Idempotent.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

struct ActiveBlock {
    samples: Vec<f32>,
    position: usize,
    done: oneshot::Sender<MediaResult<()>>,
}

type SharedSlot = Arc<Mutex<Option<ActiveBlock>>>;

fn lock_slot(slot: &SharedSlot) -> MutexGuard<'_, Option<ActiveBlock>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Fill `out` from the active block, padding with silence. Resolves the
/// block's completion once it is exhausted.
fn fill_output(slot: &SharedSlot, out: &mut [f32]) {
    let mut slot = lock_slot(slot);
    let mut written = 0;

    if let Some(active) = slot.as_mut() {
        let remaining = &active.samples[active.position..];
        written = remaining.len().min(out.len());
        out[..written].copy_from_slice(&remaining[..written]);
        active.position += written;
    }
    out[written..].fill(0.0);

    if slot
        .as_ref()
        .is_some_and(|active| active.position >= active.samples.len())
    {
        if let Some(active) = slot.take() {
            let _ = active.done.send(Ok(()));
        }
    }
}

/// Renderer backed by a cpal output stream.
pub struct CpalRenderer {
    slot: SharedSlot,
    stream: Option<StreamThread>,
}

impl CpalRenderer {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            stream: None,
        }
    }
}

impl Default for CpalRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for CpalRenderer {
    fn open(&mut self, config: &PlaybackConfig) -> MediaResult<()> {
        if self.stream.is_some() {
            return Err(MediaError::DeviceUnavailable(
                "output device is already open".to_string(),
            ));
        }

        let config = config.clone();
        let data_slot = self.slot.clone();
        let err_slot = self.slot.clone();

        let stream = StreamThread::spawn("voice-playback", move || {
            let device = find_output_device(config.device_name.as_deref())?;
            tracing::info!(
                component = "media.playback",
                device = ?device.name(),
                sample_rate = config.sample_rate,
                "using output device"
            );

            let stream_config = cpal::StreamConfig {
                channels: CHANNELS,
                sample_rate: cpal::SampleRate(config.sample_rate),
                buffer_size: cpal::BufferSize::Default,
            };

            device
                .build_output_stream(
                    &stream_config,
                    move |data: &mut [f32], _info: &cpal::OutputCallbackInfo| {
                        fill_output(&data_slot, data);
                    },
                    move |err| {
                        tracing::error!(component = "media.playback", error = %err, "playback stream error");
                        if let Some(active) = lock_slot(&err_slot).take() {
                            let _ = active
                                .done
                                .send(Err(MediaError::RenderFailure(err.to_string())));
                        }
                    },
                    None,
                )
                .map_err(|e| MediaError::DeviceUnavailable(format!("failed to open output stream: {e}")))
        })?;

        self.stream = Some(stream);
        Ok(())
    }

    fn render(&mut self, block: Vec<f32>) -> RenderCompletion {
        if self.stream.is_none() {
            return completed(Err(MediaError::NotOpen("output renderer")));
        }

        let mut slot = lock_slot(&self.slot);
        if slot.is_some() {
            return completed(Err(MediaError::RenderFailure(
                "another block is still rendering".to_string(),
            )));
        }

        let (done, rx) = oneshot::channel();
        *slot = Some(ActiveBlock {
            samples: block,
            position: 0,
            done,
        });
        rx
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.stop();
            tracing::info!(component = "media.playback", "output device released");
        }
        // Pending completion is abandoned; its receiver sees a closed channel
        lock_slot(&self.slot).take();
    }

    fn is_open(&self) -> bool {
        self.stream.is_some()
    }
}

impl Drop for CpalRenderer {
    fn drop(&mut self) {
        self.close();
    }
}
