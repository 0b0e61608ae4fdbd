//! Dedicated threads for cpal streams.
//!
//! `cpal::Stream` is not `Send`, so each stream is built, played and dropped
//! on its own thread. The thread reports readiness once, then parks until it
//! is told to stop.

use crate::error::{MediaError, MediaResult};
use std::sync::mpsc;
use std::thread::{self, JoinHandle};

pub(crate) struct StreamThread {
    name: &'static str,
    stop_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl StreamThread {
    /// Spawn `build` on a fresh thread and wait until the stream is playing.
    pub(crate) fn spawn<F>(name: &'static str, build: F) -> MediaResult<Self>
    where
        F: FnOnce() -> MediaResult<cpal::Stream> + Send + 'static,
    {
        use cpal::traits::StreamTrait;

        let (ready_tx, ready_rx) = mpsc::sync_channel::<MediaResult<()>>(1);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let stream = match build() {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(MediaError::DeviceUnavailable(format!(
                        "failed to start stream: {e}"
                    ))));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Returns on an explicit stop or when the owner is dropped
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(|e| MediaError::DeviceUnavailable(format!("failed to spawn {name}: {e}")))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                name,
                stop_tx,
                handle,
            }),
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(MediaError::DeviceUnavailable(format!(
                    "{name} exited before the stream started"
                )))
            }
        }
    }

    /// Stop the stream and wait for the device to be released.
    pub(crate) fn stop(self) {
        let _ = self.stop_tx.send(());
        if self.handle.join().is_err() {
            tracing::warn!(component = "media.stream", thread = self.name, "stream thread panicked");
        }
    }
}
