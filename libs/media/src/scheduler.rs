//! Playback scheduler: FIFO queue plus a single drain loop.
//!
//! The drain loop is driven by its owner: `enqueue` starts a render when the
//! renderer is idle, `wait_render` suspends until the in-flight block is done
//! and `finish_render` moves on to the next block. The in-flight slot is the
//! guard that keeps two blocks from ever rendering at once.

use crate::activity::calculate_rms;
use crate::error::{MediaError, MediaResult};
use crate::playback::{RenderCompletion, Renderer};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub enum PlaybackEvent {
    /// Drain loop became active (true) or idle (false).
    AgentSpeaking(bool),
    /// RMS of a block that just started rendering.
    Level(f32),
    /// A block failed to render and was dropped.
    RenderFailed(MediaError),
    /// The queue bound was exceeded and the oldest blocks were discarded.
    Overflow { dropped: usize },
}

pub struct PlaybackScheduler {
    renderer: Box<dyn Renderer>,
    queue: VecDeque<Vec<f32>>,
    in_flight: Option<RenderCompletion>,
    muted: bool,
    agent_speaking: bool,
    max_queued: Option<usize>,
    started: u64,
}

impl PlaybackScheduler {
    /// `max_queued` bounds the waiting queue; `None` keeps it unbounded.
    pub fn new(renderer: Box<dyn Renderer>, max_queued: Option<usize>) -> Self {
        Self {
            renderer,
            queue: VecDeque::new(),
            in_flight: None,
            muted: false,
            agent_speaking: false,
            max_queued,
            started: 0,
        }
    }

    pub fn enqueue(&mut self, block: Vec<f32>) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        if self.muted {
            return events;
        }

        self.queue.push_back(block);
        self.pump(&mut events);

        if let Some(limit) = self.max_queued {
            let mut dropped = 0;
            while self.queue.len() > limit {
                self.queue.pop_front();
                dropped += 1;
            }
            if dropped > 0 {
                tracing::warn!(
                    component = "media.scheduler",
                    dropped,
                    limit,
                    "playback queue over limit, dropped oldest blocks"
                );
                events.push(PlaybackEvent::Overflow { dropped });
            }
        }

        events
    }

    /// Suspend until the in-flight block finishes. Pending forever when idle.
    ///
    /// Cancel safe: dropping the future leaves the block in flight.
    pub async fn wait_render(&mut self) -> MediaResult<()> {
        match self.in_flight.as_mut() {
            Some(completion) => completion.await.unwrap_or_else(|_| {
                Err(MediaError::RenderFailure(
                    "renderer dropped the block".to_string(),
                ))
            }),
            None => std::future::pending().await,
        }
    }

    /// Record the outcome of the in-flight block and start the next one.
    pub fn finish_render(&mut self, result: MediaResult<()>) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        self.in_flight = None;

        if let Err(e) = result {
            tracing::warn!(component = "media.scheduler", error = %e, "dropping block that failed to render");
            events.push(PlaybackEvent::RenderFailed(e));
        }

        self.pump(&mut events);
        events
    }

    /// Muting lets the in-flight block finish, discards the queue and resets
    /// agent speaking. Unmuting does not replay anything.
    pub fn set_muted(&mut self, muted: bool) -> Vec<PlaybackEvent> {
        let mut events = Vec::new();
        self.muted = muted;

        if muted {
            let discarded = self.queue.len();
            self.queue.clear();
            if discarded > 0 {
                tracing::debug!(component = "media.scheduler", discarded, "speaker muted, queue cleared");
            }
            if self.agent_speaking {
                self.agent_speaking = false;
                events.push(PlaybackEvent::AgentSpeaking(false));
            }
        }

        events
    }

    fn pump(&mut self, events: &mut Vec<PlaybackEvent>) {
        if self.in_flight.is_some() || self.muted {
            return;
        }

        let Some(block) = self.queue.pop_front() else {
            if self.agent_speaking {
                self.agent_speaking = false;
                events.push(PlaybackEvent::AgentSpeaking(false));
            }
            return;
        };

        if !self.agent_speaking {
            self.agent_speaking = true;
            events.push(PlaybackEvent::AgentSpeaking(true));
        }
        events.push(PlaybackEvent::Level(calculate_rms(&block)));

        self.started += 1;
        self.in_flight = Some(self.renderer.render(block));
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn is_rendering(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn agent_speaking(&self) -> bool {
        self.agent_speaking
    }

    /// Blocks handed to the renderer so far.
    pub fn started(&self) -> u64 {
        self.started
    }

    /// Drop queued and in-flight audio and hand the renderer back.
    pub fn into_renderer(mut self) -> Box<dyn Renderer> {
        self.queue.clear();
        self.in_flight = None;
        self.renderer
    }
}
