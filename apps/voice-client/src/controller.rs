//! Session lifecycle: connect, run, tear down.
//!
//! A running session is a single spawned task that owns the capture device,
//! the playback scheduler and the transport link. The controller only talks
//! to it through a command channel, so no session state is ever shared.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use media::codec;
use media::{
    ActivityDetector, BlockReceiver, CaptureDevice, MediaResult, PlaybackEvent, PlaybackScheduler, Renderer,
};
use serde::Serialize;
use shared_proto::events::{ConnectionState, SessionEvent, Speaker};
use shared_proto::session::ConnectParams;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;

use crate::config::SessionConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{EventBus, SessionListener};
use crate::observability::trace_id;
use crate::transport::{connection_target, Connector, Inbound, TransportLink};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MuteFlags {
    pub microphone_muted: bool,
    pub speaker_muted: bool,
}

struct Devices {
    capture: Box<dyn CaptureDevice>,
    renderer: Box<dyn Renderer>,
}

impl Devices {
    fn close(&mut self) {
        self.capture.close();
        self.renderer.close();
    }
}

enum Command {
    Disconnect,
    SetMicrophoneMuted(bool),
    SetSpeakerMuted(bool),
}

struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

struct Shared {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    mute: watch::Sender<MuteFlags>,
    events: EventBus,
    /// Present while no session holds them.
    devices: Mutex<Option<Devices>>,
    session: Mutex<Option<SessionHandle>>,
    abort_requested: AtomicBool,
    abort_connect: Notify,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            tracing::info!(
                component = "controller",
                from = previous.as_str(),
                to = state.as_str(),
                "connection state changed"
            );
        }
    }

    /// Unwind a half-built connection and hand the error back.
    fn fail_connect(&self, devices: Option<Devices>, err: VoiceError) -> VoiceError {
        tracing::error!(component = "controller", code = ?err.code(), error = %err, "connect failed");
        self.set_state(ConnectionState::Error);
        self.events.emit(err.to_event());

        self.set_state(ConnectionState::Closing);
        if let Some(mut devices) = devices {
            devices.close();
            *lock(&self.devices) = Some(devices);
        }
        self.mute.send_replace(MuteFlags::default());
        self.set_state(ConnectionState::Idle);
        self.events.emit(SessionEvent::Disconnected);
        err
    }
}

/// Owns the devices and the connector, and runs at most one session at a time.
///
/// Listeners run on whichever task emits the event and may call the mute
/// setters from there.
pub struct SessionController {
    shared: Arc<Shared>,
}

impl SessionController {
    pub fn new(
        config: SessionConfig,
        capture: Box<dyn CaptureDevice>,
        renderer: Box<dyn Renderer>,
        connector: Arc<dyn Connector>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (mute, _) = watch::channel(MuteFlags::default());

        Self {
            shared: Arc::new(Shared {
                config,
                connector,
                state,
                mute,
                events: EventBus::default(),
                devices: Mutex::new(Some(Devices { capture, renderer })),
                session: Mutex::new(None),
                abort_requested: AtomicBool::new(false),
                abort_connect: Notify::new(),
            }),
        }
    }

    pub fn add_listener(&self, listener: Arc<dyn SessionListener>) {
        self.shared.events.subscribe(listener);
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn mute_flags(&self) -> MuteFlags {
        *self.shared.mute.borrow()
    }

    /// Open capture, playback and transport, in that order, then start the
    /// session task. Any failure unwinds everything opened so far.
    pub async fn connect(&self, params: ConnectParams) -> VoiceResult<()> {
        let shared = &self.shared;

        let entered = shared.state.send_if_modified(|state| {
            if *state == ConnectionState::Idle {
                *state = ConnectionState::Connecting;
                true
            } else {
                false
            }
        });
        if !entered {
            return Err(VoiceError::InvalidState(format!(
                "connect while {}",
                self.state().as_str()
            )));
        }
        shared.abort_requested.store(false, Ordering::SeqCst);

        tracing::info!(
            component = "controller",
            session_id = %params.session_id,
            start_node = %params.start_node,
            trace_id = %trace_id(),
            "connecting"
        );

        let target = match connection_target(&shared.config.endpoint, &params) {
            Ok(target) => target,
            Err(e) => return Err(shared.fail_connect(None, e.into())),
        };

        let devices = lock(&shared.devices).take();
        let Some(mut devices) = devices else {
            return Err(shared.fail_connect(
                None,
                VoiceError::InvalidState("audio devices are held by another session".to_string()),
            ));
        };

        // Opening waits for the device streams to start; keep that off the runtime thread
        let opening = tokio::task::spawn_blocking({
            let shared = shared.clone();
            move || {
                let result = open_devices(&mut devices, &shared.config);
                (devices, result)
            }
        });
        let (devices, blocks) = match opening.await {
            Ok((devices, Ok(blocks))) => (devices, blocks),
            Ok((devices, Err(e))) => return Err(shared.fail_connect(Some(devices), e.into())),
            Err(e) => {
                return Err(shared.fail_connect(
                    None,
                    VoiceError::DeviceUnavailable(format!("device open did not complete: {e}")),
                ))
            }
        };

        let abort = shared.abort_connect.notified();
        tokio::pin!(abort);
        abort.as_mut().enable();
        if shared.abort_requested.load(Ordering::SeqCst) {
            return Err(shared.fail_connect(Some(devices), abandoned()));
        }

        let link = tokio::select! {
            result = shared.connector.connect(target) => match result {
                Ok(link) => link,
                Err(e) => return Err(shared.fail_connect(Some(devices), e.into())),
            },
            _ = &mut abort => return Err(shared.fail_connect(Some(devices), abandoned())),
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        {
            // Held until the handle is stored so disconnect() never sees Active without it
            let mut session = lock(&shared.session);
            shared.set_state(ConnectionState::Active);
            let task = tokio::spawn(run_session(
                shared.clone(),
                SessionParts {
                    session_id: params.session_id.clone(),
                    devices,
                    blocks,
                    link,
                    commands: command_rx,
                },
            ));
            *session = Some(SessionHandle { commands, task });
        }

        // Outside the lock: listeners may react by calling back into the controller
        shared.events.emit(SessionEvent::Connected {
            session_id: params.session_id,
        });
        Ok(())
    }

    /// End the session, whatever state it is in, and wait for teardown.
    pub async fn disconnect(&self) {
        let shared = &self.shared;

        let current = self.state();
        if current == ConnectionState::Connecting {
            shared.abort_requested.store(true, Ordering::SeqCst);
            shared.abort_connect.notify_waiters();
            let mut state = shared.state.subscribe();
            let _ = state.wait_for(|s| *s != ConnectionState::Connecting).await;
        }

        let handle = lock(&shared.session).take();
        let Some(handle) = handle else {
            // Another caller owns the teardown; wait for it to land
            let mut state = shared.state.subscribe();
            let _ = state.wait_for(|s| *s == ConnectionState::Idle).await;
            return;
        };

        let _ = handle.commands.send(Command::Disconnect);
        if let Err(e) = handle.task.await {
            tracing::error!(component = "controller", error = %e, "session task ended abnormally");
            shared.mute.send_replace(MuteFlags::default());
            if self.state() != ConnectionState::Idle {
                shared.set_state(ConnectionState::Idle);
                shared.events.emit(SessionEvent::Disconnected);
            }
        }
    }

    pub fn set_microphone_muted(&self, muted: bool) -> VoiceResult<()> {
        self.send_command(Command::SetMicrophoneMuted(muted))?;
        self.update_mute(|flags| flags.microphone_muted = muted);
        Ok(())
    }

    pub fn set_speaker_muted(&self, muted: bool) -> VoiceResult<()> {
        self.send_command(Command::SetSpeakerMuted(muted))?;
        self.update_mute(|flags| flags.speaker_muted = muted);
        Ok(())
    }

    fn send_command(&self, command: Command) -> VoiceResult<()> {
        let session = lock(&self.shared.session);
        match session.as_ref() {
            Some(handle) if self.state() == ConnectionState::Active => handle
                .commands
                .send(command)
                .map_err(|_| VoiceError::InvalidState("session is shutting down".to_string())),
            _ => Err(VoiceError::InvalidState(format!(
                "no active session ({})",
                self.state().as_str()
            ))),
        }
    }

    /// Teardown moves to Closing before resetting the flags, so a late
    /// update can never survive into Idle.
    fn update_mute(&self, apply: impl FnOnce(&mut MuteFlags)) {
        let shared = &self.shared;
        shared.mute.send_if_modified(|flags| {
            if *shared.state.borrow() != ConnectionState::Active {
                return false;
            }
            apply(flags);
            true
        });
    }
}

fn open_devices(devices: &mut Devices, config: &SessionConfig) -> MediaResult<BlockReceiver> {
    let blocks = devices.capture.open(&config.capture)?;
    devices.renderer.open(&config.playback)?;
    Ok(blocks)
}

fn abandoned() -> VoiceError {
    VoiceError::ConnectFailure("connect abandoned by disconnect".to_string())
}

struct SessionParts {
    session_id: String,
    devices: Devices,
    blocks: BlockReceiver,
    link: TransportLink,
    commands: mpsc::UnboundedReceiver<Command>,
}

enum SessionEnd {
    Requested,
    TransportClosed,
    Failed(VoiceError),
}

impl SessionEnd {
    fn as_str(&self) -> &'static str {
        match self {
            SessionEnd::Requested => "requested",
            SessionEnd::TransportClosed => "transport_closed",
            SessionEnd::Failed(_) => "failed",
        }
    }
}

async fn run_session(shared: Arc<Shared>, parts: SessionParts) {
    let SessionParts {
        session_id,
        devices,
        mut blocks,
        mut link,
        mut commands,
    } = parts;
    let Devices {
        mut capture,
        renderer,
    } = devices;

    let mut scheduler = PlaybackScheduler::new(renderer, shared.config.max_queued_blocks);
    let mut mic = ActivityDetector::new(shared.config.speaking_threshold);
    let mut flags = MuteFlags::default();
    let mut frames_sent: u64 = 0;
    let mut frames_received: u64 = 0;

    let end = loop {
        tokio::select! {
            biased;

            command = commands.recv() => match command {
                Some(Command::SetMicrophoneMuted(muted)) => {
                    flags.microphone_muted = muted;
                    tracing::info!(component = "controller", muted, "microphone mute changed");
                }
                Some(Command::SetSpeakerMuted(muted)) => {
                    flags.speaker_muted = muted;
                    tracing::info!(component = "controller", muted, "speaker mute changed");
                    publish_playback(&shared.events, scheduler.set_muted(muted));
                }
                Some(Command::Disconnect) | None => break SessionEnd::Requested,
            },

            result = scheduler.wait_render() => {
                publish_playback(&shared.events, scheduler.finish_render(result));
            }

            block = blocks.recv() => {
                let Some(block) = block else {
                    break SessionEnd::Failed(VoiceError::DeviceUnavailable(
                        "capture stream ended".to_string(),
                    ));
                };

                if let Some(speaking) = mic.observe(&block) {
                    shared.events.emit(SessionEvent::SpeakingChanged { who: Speaker::Microphone, speaking });
                }
                shared.events.emit(SessionEvent::Level { who: Speaker::Microphone, rms: mic.last_rms() });

                if flags.microphone_muted {
                    continue;
                }
                if link.send(codec::to_wire(&codec::encode(&block))).is_err() {
                    break SessionEnd::TransportClosed;
                }
                frames_sent += 1;
            }

            inbound = link.recv() => match inbound {
                Some(Inbound::Audio(payload)) => {
                    frames_received += 1;
                    if flags.speaker_muted {
                        continue;
                    }
                    match decode_payload(&payload) {
                        Ok(block) => publish_playback(&shared.events, scheduler.enqueue(block)),
                        Err(err) => drop_violation(err),
                    }
                }
                Some(Inbound::Violation(reason)) => {
                    drop_violation(VoiceError::ProtocolViolation(reason));
                }
                None => break SessionEnd::TransportClosed,
            },
        }
    };

    tracing::info!(
        component = "controller",
        session_id = %session_id,
        reason = end.as_str(),
        frames_sent,
        frames_received,
        blocks_rendered = scheduler.started(),
        "tearing down session"
    );

    if let SessionEnd::Failed(err) = &end {
        tracing::error!(component = "controller", code = ?err.code(), error = %err, "session failed");
        shared.set_state(ConnectionState::Error);
        shared.events.emit(err.to_event());
    }
    shared.set_state(ConnectionState::Closing);

    capture.close();
    drop(blocks);
    if let Some(speaking) = mic.reset() {
        shared.events.emit(SessionEvent::SpeakingChanged { who: Speaker::Microphone, speaking });
    }

    if scheduler.agent_speaking() {
        shared.events.emit(SessionEvent::SpeakingChanged { who: Speaker::Agent, speaking: false });
    }
    let mut renderer = scheduler.into_renderer();
    renderer.close();

    link.close().await;

    *lock(&shared.devices) = Some(Devices { capture, renderer });
    shared.mute.send_replace(MuteFlags::default());
    shared.set_state(ConnectionState::Idle);
    shared.events.emit(SessionEvent::Disconnected);
}

fn decode_payload(payload: &[u8]) -> VoiceResult<Vec<f32>> {
    if payload.is_empty() {
        return Err(VoiceError::ProtocolViolation("empty audio frame".to_string()));
    }
    let samples = codec::from_wire(payload)?;
    Ok(codec::decode(&samples))
}

/// Bad inbound messages are dropped without ending the session or telling observers.
fn drop_violation(err: VoiceError) {
    tracing::warn!(component = "controller", code = ?err.code(), error = %err, "dropping inbound message");
}

fn publish_playback(events: &EventBus, playback: Vec<PlaybackEvent>) {
    for event in playback {
        match event {
            PlaybackEvent::AgentSpeaking(speaking) => {
                events.emit(SessionEvent::SpeakingChanged { who: Speaker::Agent, speaking })
            }
            PlaybackEvent::Level(rms) => events.emit(SessionEvent::Level { who: Speaker::Agent, rms }),
            PlaybackEvent::RenderFailed(e) => events.emit(VoiceError::from(e).to_event()),
            // Already logged by the scheduler
            PlaybackEvent::Overflow { .. } => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{TransportError, WebSocketConnector};
    use futures_util::future::BoxFuture;
    use futures_util::{SinkExt, StreamExt};
    use media::playback::completed;
    use media::{CaptureConfig, MediaError, MediaResult, PlaybackConfig, RenderCompletion};
    use shared_proto::events::ErrorCode;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
    use tokio_tungstenite::tungstenite::Message;
    use url::Url;

    type Feed = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<f32>>>>>;

    #[derive(Clone, Default)]
    struct Counters {
        opened: Arc<AtomicUsize>,
        released: Arc<AtomicUsize>,
    }

    impl Counters {
        fn opened(&self) -> usize {
            self.opened.load(Ordering::SeqCst)
        }

        fn released(&self) -> usize {
            self.released.load(Ordering::SeqCst)
        }
    }

    #[derive(Clone, Copy)]
    enum CaptureMode {
        Works,
        Fails,
        /// Opening blocks the calling thread this long.
        Slow(Duration),
    }

    struct FakeCapture {
        counters: Counters,
        feed: Feed,
        mode: CaptureMode,
        open: bool,
    }

    impl CaptureDevice for FakeCapture {
        fn open(&mut self, _config: &CaptureConfig) -> MediaResult<BlockReceiver> {
            match self.mode {
                CaptureMode::Works => {}
                CaptureMode::Fails => {
                    return Err(MediaError::DeviceUnavailable("permission denied".to_string()))
                }
                CaptureMode::Slow(delay) => std::thread::sleep(delay),
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.feed.lock().expect("feed lock") = Some(tx);
            self.open = true;
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(rx)
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.feed.lock().expect("feed lock").take();
                self.counters.released.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// Completes every block as soon as it is handed over.
    struct FakeRenderer {
        counters: Counters,
        rendered: Arc<Mutex<Vec<Vec<f32>>>>,
        open: bool,
    }

    impl Renderer for FakeRenderer {
        fn open(&mut self, _config: &PlaybackConfig) -> MediaResult<()> {
            self.open = true;
            self.counters.opened.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn render(&mut self, block: Vec<f32>) -> RenderCompletion {
            self.rendered.lock().expect("rendered lock").push(block);
            completed(Ok(()))
        }

        fn close(&mut self) {
            if self.open {
                self.open = false;
                self.counters.released.fetch_add(1, Ordering::SeqCst);
            }
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    /// The agent's side of a channel link.
    struct RemoteEnd {
        sent: mpsc::UnboundedReceiver<Vec<u8>>,
        inject: mpsc::UnboundedSender<Inbound>,
    }

    #[derive(Clone, Default)]
    struct FakeConnector {
        attempts: Arc<AtomicUsize>,
        remote: Arc<Mutex<Option<RemoteEnd>>>,
        refuse: bool,
        /// Next attempt never resolves.
        stall: Arc<AtomicBool>,
    }

    impl Connector for FakeConnector {
        fn connect(&self, _target: Url) -> BoxFuture<'static, Result<TransportLink, TransportError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Box::pin(async { Err(TransportError::Handshake("connection refused".to_string())) });
            }
            if self.stall.swap(false, Ordering::SeqCst) {
                return Box::pin(std::future::pending());
            }

            let (out_tx, out_rx) = mpsc::unbounded_channel();
            let (in_tx, in_rx) = mpsc::unbounded_channel();
            *self.remote.lock().expect("remote lock") = Some(RemoteEnd {
                sent: out_rx,
                inject: in_tx,
            });
            Box::pin(async move { Ok(TransportLink::from_channels(out_tx, in_rx)) })
        }
    }

    struct Harness {
        controller: Arc<SessionController>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        seen: Vec<SessionEvent>,
        capture: Counters,
        renderer: Counters,
        feed: Feed,
        rendered: Arc<Mutex<Vec<Vec<f32>>>>,
    }

    impl Harness {
        fn new(config: SessionConfig, mode: CaptureMode, connector: Arc<dyn Connector>) -> Self {
            let capture = Counters::default();
            let renderer = Counters::default();
            let feed: Feed = Arc::default();
            let rendered: Arc<Mutex<Vec<Vec<f32>>>> = Arc::default();

            let controller = Arc::new(SessionController::new(
                config,
                Box::new(FakeCapture {
                    counters: capture.clone(),
                    feed: feed.clone(),
                    mode,
                    open: false,
                }),
                Box::new(FakeRenderer {
                    counters: renderer.clone(),
                    rendered: rendered.clone(),
                    open: false,
                }),
                connector,
            ));
            let (tx, events) = mpsc::unbounded_channel();
            controller.add_listener(Arc::new(tx));

            Self {
                controller,
                events,
                seen: Vec::new(),
                capture,
                renderer,
                feed,
                rendered,
            }
        }

        fn with_fake(connector: &FakeConnector) -> Self {
            Self::new(SessionConfig::default(), CaptureMode::Works, Arc::new(connector.clone()))
        }

        fn push_block(&self, block: Vec<f32>) {
            self.feed
                .lock()
                .expect("feed lock")
                .as_ref()
                .expect("capture is open")
                .send(block)
                .expect("session is reading capture");
        }

        async fn wait_for(&mut self, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(2), self.events.recv())
                    .await
                    .expect("event arrives in time")
                    .expect("event bus alive");
                self.seen.push(event.clone());
                if wanted(&event) {
                    return event;
                }
            }
        }

        fn drain(&mut self) -> Vec<SessionEvent> {
            while let Ok(event) = self.events.try_recv() {
                self.seen.push(event);
            }
            self.seen.clone()
        }

        fn rendered(&self) -> Vec<Vec<f32>> {
            self.rendered.lock().expect("rendered lock").clone()
        }
    }

    fn take_remote(connector: &FakeConnector) -> RemoteEnd {
        connector
            .remote
            .lock()
            .expect("remote lock")
            .take()
            .expect("link was created")
    }

    /// Let the session task work through everything already queued.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    fn wire(samples: &[f32]) -> Vec<u8> {
        codec::to_wire(&codec::encode(samples))
    }

    fn count(events: &[SessionEvent], wanted: &SessionEvent) -> usize {
        events.iter().filter(|e| *e == wanted).count()
    }

    #[tokio::test]
    async fn double_disconnect_releases_devices_once() {
        let connector = FakeConnector::default();
        let mut h = Harness::with_fake(&connector);

        h.controller.connect(ConnectParams::new("s-1")).await.expect("connect");
        assert_eq!(h.controller.state(), ConnectionState::Active);

        h.controller.disconnect().await;
        h.controller.disconnect().await;

        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!((h.capture.opened(), h.capture.released()), (1, 1));
        assert_eq!((h.renderer.opened(), h.renderer.released()), (1, 1));

        let events = h.drain();
        assert_eq!(
            events.first(),
            Some(&SessionEvent::Connected {
                session_id: "s-1".to_string()
            })
        );
        assert_eq!(count(&events, &SessionEvent::Disconnected), 1);
    }

    #[tokio::test]
    async fn transport_loss_takes_the_disconnect_path() {
        let connector = FakeConnector::default();
        let mut h = Harness::with_fake(&connector);

        h.controller.connect(ConnectParams::new("s-2")).await.expect("connect");
        h.controller.set_speaker_muted(true).expect("mute while active");
        drop(take_remote(&connector));

        h.wait_for(|e| *e == SessionEvent::Disconnected).await;
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(h.controller.mute_flags(), MuteFlags::default());

        h.controller.disconnect().await;
        h.controller.disconnect().await;
        assert_eq!(h.capture.released(), 1);
        assert_eq!(h.renderer.released(), 1);
        assert_eq!(count(&h.drain(), &SessionEvent::Disconnected), 1);

        // Devices came back, so the line can be dialled again
        h.controller.connect(ConnectParams::new("s-3")).await.expect("reconnect");
        assert_eq!(h.capture.opened(), 2);
        h.controller.disconnect().await;
    }

    #[tokio::test]
    async fn muted_microphone_sends_nothing_but_keeps_detecting() {
        let connector = FakeConnector::default();
        let mut h = Harness::with_fake(&connector);

        h.controller.connect(ConnectParams::new("s-4")).await.expect("connect");
        let mut remote = take_remote(&connector);

        h.controller.set_microphone_muted(true).expect("mute");
        assert!(h.controller.mute_flags().microphone_muted);
        for _ in 0..5 {
            h.push_block(vec![0.5; 4096]);
        }

        let mut levels = 0;
        while levels < 5 {
            if let SessionEvent::Level { who: Speaker::Microphone, .. } = h.wait_for(|_| true).await {
                levels += 1;
            }
        }
        assert!(h.seen.contains(&SessionEvent::SpeakingChanged {
            who: Speaker::Microphone,
            speaking: true
        }));
        assert!(remote.sent.try_recv().is_err(), "nothing leaves a muted microphone");

        h.controller.set_microphone_muted(false).expect("unmute");
        h.push_block(vec![0.25; 4096]);
        let frame = tokio::time::timeout(Duration::from_secs(2), remote.sent.recv())
            .await
            .expect("frame in time")
            .expect("link open");
        assert_eq!(frame.len(), 4096 * 2);

        h.controller.disconnect().await;
    }

    #[tokio::test]
    async fn capture_failure_never_dials() {
        let connector = FakeConnector::default();
        let mut h = Harness::new(SessionConfig::default(), CaptureMode::Fails, Arc::new(connector.clone()));

        let err = h
            .controller
            .connect(ConnectParams::new("s-5"))
            .await
            .expect_err("capture refuses");

        assert_eq!(err.code(), ErrorCode::DeviceUnavailable);
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(h.renderer.opened(), 0);

        let events = h.drain();
        assert!(matches!(
            events.as_slice(),
            [
                SessionEvent::Error { code: ErrorCode::DeviceUnavailable, .. },
                SessionEvent::Disconnected
            ]
        ));
    }

    #[tokio::test]
    async fn refused_connection_releases_opened_devices() {
        let connector = FakeConnector {
            refuse: true,
            ..FakeConnector::default()
        };
        let h = Harness::with_fake(&connector);

        let err = h
            .controller
            .connect(ConnectParams::new("s-6"))
            .await
            .expect_err("connector refuses");
        assert_eq!(err.code(), ErrorCode::ConnectFailure);
        assert_eq!((h.capture.opened(), h.capture.released()), (1, 1));
        assert_eq!((h.renderer.opened(), h.renderer.released()), (1, 1));

        // One call, one attempt
        let _ = h.controller.connect(ConnectParams::new("s-6")).await;
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert_eq!(h.controller.state(), ConnectionState::Idle);
    }

    #[tokio::test]
    async fn calls_outside_their_state_are_rejected() {
        let connector = FakeConnector::default();
        let h = Harness::with_fake(&connector);

        let err = h.controller.set_microphone_muted(true).expect_err("idle");
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(h.controller.mute_flags(), MuteFlags::default());

        h.controller.connect(ConnectParams::new("s-7")).await.expect("connect");
        let err = h
            .controller
            .connect(ConnectParams::new("s-7"))
            .await
            .expect_err("already active");
        assert_eq!(err.code(), ErrorCode::InvalidState);
        assert_eq!(h.controller.state(), ConnectionState::Active);

        h.controller.disconnect().await;
    }

    #[tokio::test]
    async fn speaker_mute_drops_inbound_audio() {
        let connector = FakeConnector::default();
        let mut h = Harness::with_fake(&connector);

        h.controller.connect(ConnectParams::new("s-8")).await.expect("connect");
        let remote = take_remote(&connector);

        h.controller.set_speaker_muted(true).expect("mute");
        remote.inject.send(Inbound::Audio(wire(&[0.5; 8]))).expect("inject");
        settle().await;
        assert!(h.rendered().is_empty());

        h.controller.set_speaker_muted(false).expect("unmute");
        remote.inject.send(Inbound::Audio(wire(&[-0.5; 8]))).expect("inject");
        h.wait_for(|e| {
            *e == SessionEvent::SpeakingChanged {
                who: Speaker::Agent,
                speaking: false,
            }
        })
        .await;

        let rendered = h.rendered();
        assert_eq!(rendered.len(), 1);
        assert!(rendered[0].iter().all(|s| (s + 0.5).abs() < 1e-4));

        h.controller.disconnect().await;
    }

    #[tokio::test]
    async fn malformed_frames_are_dropped_and_the_session_survives() {
        let connector = FakeConnector::default();
        let mut h = Harness::with_fake(&connector);

        h.controller.connect(ConnectParams::new("s-9")).await.expect("connect");
        let remote = take_remote(&connector);

        remote.inject.send(Inbound::Audio(vec![1, 2, 3])).expect("inject");
        remote.inject.send(Inbound::Audio(Vec::new())).expect("inject");
        remote
            .inject
            .send(Inbound::Violation("unexpected text message".to_string()))
            .expect("inject");
        remote.inject.send(Inbound::Audio(wire(&[0.1; 4]))).expect("inject");
        h.wait_for(|e| {
            *e == SessionEvent::SpeakingChanged {
                who: Speaker::Agent,
                speaking: false,
            }
        })
        .await;
        assert_eq!(h.rendered().len(), 1);
        assert_eq!(h.controller.state(), ConnectionState::Active);
        assert!(
            !h.seen.iter().any(|e| matches!(e, SessionEvent::Error { .. })),
            "bad messages are dropped without an error event"
        );

        h.controller.disconnect().await;
    }

    #[tokio::test]
    async fn losing_the_microphone_ends_the_session() {
        let connector = FakeConnector::default();
        let mut h = Harness::with_fake(&connector);

        h.controller.connect(ConnectParams::new("s-12")).await.expect("connect");
        // Capture drops its sender when the device goes away
        h.feed.lock().expect("feed lock").take();

        h.wait_for(|e| *e == SessionEvent::Disconnected).await;
        let error_at = h
            .seen
            .iter()
            .position(|e| matches!(e, SessionEvent::Error { code: ErrorCode::DeviceUnavailable, .. }))
            .expect("device loss is reported");
        assert!(error_at < h.seen.len() - 1);
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!((h.capture.opened(), h.capture.released()), (1, 1));
        assert_eq!((h.renderer.opened(), h.renderer.released()), (1, 1));

        h.controller.disconnect().await;
        assert_eq!(h.capture.released(), 1);
    }

    #[tokio::test]
    async fn disconnect_abandons_a_pending_connect() {
        let connector = FakeConnector::default();
        connector.stall.store(true, Ordering::SeqCst);
        let h = Harness::with_fake(&connector);

        let (result, ()) = tokio::join!(h.controller.connect(ConnectParams::new("s-13")), async {
            while connector.attempts.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            h.controller.disconnect().await;
        });

        let err = result.expect_err("connect gives up");
        assert_eq!(err, VoiceError::ConnectFailure("connect abandoned by disconnect".to_string()));
        assert_eq!(h.controller.state(), ConnectionState::Idle);
        assert_eq!((h.capture.opened(), h.capture.released()), (1, 1));
        assert_eq!((h.renderer.opened(), h.renderer.released()), (1, 1));

        h.controller.connect(ConnectParams::new("s-14")).await.expect("later connect");
        assert_eq!(h.controller.state(), ConnectionState::Active);
        h.controller.disconnect().await;
    }

    #[tokio::test]
    async fn slow_device_open_does_not_stall_the_runtime() {
        let connector = FakeConnector::default();
        let h = Harness::new(
            SessionConfig::default(),
            CaptureMode::Slow(Duration::from_millis(300)),
            Arc::new(connector.clone()),
        );

        let (result, during_open) = tokio::join!(h.controller.connect(ConnectParams::new("s-15")), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            (h.controller.state(), h.capture.opened())
        });

        result.expect("connect");
        assert_eq!(during_open, (ConnectionState::Connecting, 0));
        h.controller.disconnect().await;
    }

    /// Applies a saved mute preference as soon as the line is up.
    #[derive(Default)]
    struct MuteOnConnect {
        controller: std::sync::OnceLock<std::sync::Weak<SessionController>>,
        applied: Mutex<Option<VoiceResult<()>>>,
    }

    impl SessionListener for MuteOnConnect {
        fn on_event(&self, event: &SessionEvent) {
            if !matches!(event, SessionEvent::Connected { .. }) {
                return;
            }
            if let Some(controller) = self.controller.get().and_then(|weak| weak.upgrade()) {
                *self.applied.lock().expect("applied lock") = Some(controller.set_microphone_muted(true));
            }
        }
    }

    #[test]
    fn listener_can_mute_from_the_connected_event() {
        let (done_tx, done_rx) = std::sync::mpsc::channel();

        // Own thread and runtime, so a lock-up shows as a timeout instead of a hung test run
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");
            runtime.block_on(async move {
                let connector = FakeConnector::default();
                let h = Harness::with_fake(&connector);
                let listener = Arc::new(MuteOnConnect::default());
                let _ = listener.controller.set(Arc::downgrade(&h.controller));
                h.controller.add_listener(listener.clone());

                let connected = h.controller.connect(ConnectParams::new("s-16")).await;
                let muted = h.controller.mute_flags().microphone_muted;
                let applied = listener.applied.lock().expect("applied lock").take();
                h.controller.disconnect().await;
                let _ = done_tx.send((connected, applied, muted));
            });
        });

        let (connected, applied, muted) = done_rx
            .recv_timeout(Duration::from_secs(3))
            .expect("connect returns while a listener calls back into the controller");
        connected.expect("connect");
        assert_eq!(applied, Some(Ok(())));
        assert!(muted);
    }

    /// Accepts one client, echoes binary frames and records the request URI.
    async fn spawn_echo_agent() -> (String, JoinHandle<(String, Vec<Vec<u8>>)>) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");

        let task = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.expect("accept");
            let mut uri = String::new();
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
                uri = req.uri().to_string();
                Ok::<_, ErrorResponse>(resp)
            })
            .await
            .expect("handshake");

            let mut received = Vec::new();
            while let Some(Ok(msg)) = ws.next().await {
                match msg {
                    Message::Binary(data) => {
                        received.push(data.clone());
                        ws.send(Message::Binary(data)).await.expect("echo");
                    }
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            (uri, received)
        });

        (format!("ws://{addr}/ws"), task)
    }

    #[tokio::test]
    async fn silent_block_round_trips_through_an_echo_agent() {
        let (endpoint, agent) = spawn_echo_agent().await;
        let config = SessionConfig {
            endpoint,
            ..SessionConfig::default()
        };
        let mut h = Harness::new(config, CaptureMode::Works, Arc::new(WebSocketConnector));

        h.controller
            .connect(ConnectParams::new("echo-1").with_caller_phone(Some("+390612345".to_string())))
            .await
            .expect("connect to echo agent");

        h.push_block(vec![0.0; 4096]);
        h.wait_for(|e| {
            *e == SessionEvent::SpeakingChanged {
                who: Speaker::Agent,
                speaking: false,
            }
        })
        .await;

        let agent_on = h
            .seen
            .iter()
            .position(|e| {
                *e == SessionEvent::SpeakingChanged {
                    who: Speaker::Agent,
                    speaking: true,
                }
            })
            .expect("agent started speaking");
        assert!(agent_on < h.seen.len() - 1);

        let rendered = h.rendered();
        assert_eq!(rendered.len(), 1);
        assert_eq!(rendered[0], vec![0.0; 4096]);

        h.controller.disconnect().await;
        assert_eq!(h.controller.state(), ConnectionState::Idle);

        let (uri, received) = tokio::time::timeout(Duration::from_secs(2), agent)
            .await
            .expect("agent finishes")
            .expect("agent task");
        assert_eq!(received, vec![vec![0u8; 4096 * 2]]);
        assert!(uri.starts_with("/ws?session_id=echo-1&start_node=greeting"));
        assert!(uri.contains("caller_phone="));
    }
}
