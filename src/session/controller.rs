//! Session controller
//!
//! A single actor task owns every piece of mutable session state. Capture,
//! sockets, timers and HTTP calls run in their own tasks and report back
//! as [`Internal`] events tagged with the segment and connection they
//! belong to; anything tagged with a superseded id is dropped, so a
//! late callback can never act on a newer session.

use anyhow::Error;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::SessionConfig;
use super::error::SessionError;
use super::status::{EndingReason, SessionEvent, SessionState, SessionStatus};
use super::timer::{TimerHandle, Timers};
use crate::audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, CapturePipeline,
    MicArbiter, MicError, MicLease,
};
use crate::billing::{AuthProvider, BillingApi, BillingStatus};
use crate::transcript::{DraftMerger, SharedBuffer};
use crate::transport::{
    Connection, Effect, GatewayConnector, Inbound, Link, LinkEvent, LinkOutcome, Outbound,
    ServerMessage,
};

/// External collaborators the controller drives
pub struct SessionDeps {
    pub auth: Arc<dyn AuthProvider>,
    pub billing: Arc<dyn BillingApi>,
    pub connector: Arc<dyn GatewayConnector>,
    pub audio: Arc<dyn AudioBackendFactory>,
    pub mic: MicArbiter,
    pub buffer: SharedBuffer,
}

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

enum Command {
    Start(Reply<()>),
    Pause(Reply<()>),
    Resume(Reply<()>),
    Stop(Reply<()>),
    Balance(Reply<BillingStatus>),
    Redeem(String, Reply<BillingStatus>),
    SwitchAccount(Reply<()>),
    Logout(Reply<()>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PrepKind {
    Start,
    Resume,
}

/// Everything a segment needs, gathered off the actor
struct Prepared {
    token: String,
    gateway_url: String,
    lease: MicLease,
    backend: Box<dyn AudioBackend>,
    frames: mpsc::Receiver<AudioFrame>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CaptureExit {
    /// The source ran out on its own
    Exhausted,
    /// Stop requested; queued frames are flushed first
    Drain,
    /// Segment torn down or controller gone
    Abandoned,
}

#[derive(Debug, Clone, Copy)]
enum TimerKind {
    Keepalive,
    Reconnect,
    Grace,
}

enum Internal {
    Prepared {
        kind: PrepKind,
        result: Result<Prepared, SessionError>,
        reply: Reply<()>,
    },
    Audio {
        segment: u64,
        bytes: Vec<u8>,
    },
    CaptureEnded {
        segment: u64,
    },
    /// The capture task has forwarded its last frame
    CaptureDrained {
        segment: u64,
    },
    Opened {
        segment: u64,
        conn: u64,
        outbound: mpsc::UnboundedSender<Outbound>,
    },
    Socket {
        segment: u64,
        conn: u64,
        inbound: Inbound,
    },
    Timer {
        segment: u64,
        kind: TimerKind,
    },
}

/// Handle to the session actor; cheap to clone
#[derive(Clone)]
pub struct SessionController {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Receiver<SessionStatus>,
    mic: MicArbiter,
}

impl SessionController {
    /// Spawn the actor on the current tokio runtime
    pub fn spawn(config: SessionConfig, deps: SessionDeps) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(256);
        let (status_tx, status_rx) = watch::channel(SessionStatus::default());
        let mic = deps.mic.clone();

        let actor = Actor {
            config,
            deps: Arc::new(deps),
            internal: internal_tx,
            events: events.clone(),
            status: status_tx,
            session: None,
            preparing: None,
            next_segment: 0,
            next_conn: 0,
            last_state: SessionState::Idle,
        };
        tokio::spawn(actor.run(cmd_rx, internal_rx));

        Self {
            commands: cmd_tx,
            events,
            status: status_rx,
            mic,
        }
    }

    /// Authenticate, check the balance, take the microphone and start streaming
    pub async fn start(&self) -> Result<(), SessionError> {
        self.request(Command::Start).await
    }

    pub async fn pause(&self) -> Result<(), SessionError> {
        self.request(Command::Pause).await
    }

    /// Continue a paused session in a new draft span
    pub async fn resume(&self) -> Result<(), SessionError> {
        self.request(Command::Resume).await
    }

    pub async fn stop(&self) -> Result<(), SessionError> {
        self.request(Command::Stop).await
    }

    pub async fn balance(&self) -> Result<BillingStatus, SessionError> {
        self.request(Command::Balance).await
    }

    pub async fn redeem(&self, code: &str) -> Result<BillingStatus, SessionError> {
        let code = code.trim().to_string();
        self.request(|reply| Command::Redeem(code, reply)).await
    }

    /// Forget the cached token and log in again; refused while a session exists
    pub async fn switch_account(&self) -> Result<(), SessionError> {
        self.request(Command::SwitchAccount).await
    }

    /// Refused while a session exists
    pub async fn logout(&self) -> Result<(), SessionError> {
        self.request(Command::Logout).await
    }

    pub fn status(&self) -> SessionStatus {
        let mut status = self.status.borrow().clone();
        status.elapsed_ms = status
            .started_at
            .map(|at| (Utc::now() - at).num_milliseconds());
        status.mic_owner = self.mic.active_owner();
        status
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> Command,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .map_err(|_| SessionError::ControllerGone)?;
        rx.await.map_err(|_| SessionError::ControllerGone)?
    }
}

/// Owns one capture segment's resources; dropping it tears them all down
struct Segment {
    id: u64,
    link: Link,
    conn: Option<u64>,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
    capture: Option<CaptureHandle>,
    /// Stop is held back until the capture task reports drained
    draining: bool,
    lease: Option<MicLease>,
    timers: Timers,
}

impl Segment {
    fn send(&self, frame: Outbound) {
        if let Some(out) = &self.outbound {
            let _ = out.send(frame);
        }
    }

    fn close_socket(&mut self) {
        if let Some(out) = self.outbound.take() {
            let _ = out.send(Outbound::Close);
        }
        self.conn = None;
    }

    fn stop_capture(&mut self) {
        if self.capture.take().is_some() {
            debug!("Capture stop requested for segment {}", self.id);
        }
    }

    /// Ask the capture task to flush what it has; false if it is already gone
    fn drain_capture(&mut self) -> bool {
        self.draining = match self.capture.take() {
            Some(handle) => handle.stop.send(()).is_ok(),
            None => false,
        };
        self.draining
    }

    fn release_mic(&mut self) {
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
    }

    fn teardown(&mut self) {
        self.timers.cancel_all();
        self.stop_capture();
        self.close_socket();
        self.release_mic();
    }
}

struct ActiveSession {
    id: Uuid,
    token: String,
    gateway_url: String,
    started_at: DateTime<Utc>,
    state: SessionState,
    ending: EndingReason,
    draft: DraftMerger,
    segment: Option<Segment>,
}

/// Dropping this stops the capture task without a drain
struct CaptureHandle {
    stop: oneshot::Sender<()>,
}

struct Actor {
    config: SessionConfig,
    deps: Arc<SessionDeps>,
    internal: mpsc::UnboundedSender<Internal>,
    events: broadcast::Sender<SessionEvent>,
    status: watch::Sender<SessionStatus>,
    session: Option<ActiveSession>,
    preparing: Option<PrepKind>,
    next_segment: u64,
    next_conn: u64,
    last_state: SessionState,
}

impl Actor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
    ) {
        info!("Session controller started");

        loop {
            // Audio already queued must reach the link before a stop does
            tokio::select! {
                biased;
                Some(event) = internal.recv() => self.on_internal(event).await,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.on_command(cmd).await,
                    None => break,
                },
            }
            self.publish();
        }

        if let Some(mut session) = self.session.take() {
            if let Some(segment) = session.segment.as_mut() {
                segment.teardown();
            }
        }
        info!("Session controller stopped");
    }

    async fn on_command(&mut self, cmd: Command) {
        match cmd {
            Command::Start(reply) => match self.check_can_start() {
                Ok(()) => self.begin_prepare(PrepKind::Start, None, reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Resume(reply) => match self.check_can_resume() {
                Ok(token) => self.begin_prepare(PrepKind::Resume, Some(token), reply),
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            Command::Pause(reply) => {
                let result = self.pause().await;
                let _ = reply.send(result);
            }
            Command::Stop(reply) => {
                let result = self.stop().await;
                let _ = reply.send(result);
            }
            Command::Balance(reply) => {
                let deps = Arc::clone(&self.deps);
                tokio::spawn(async move {
                    let _ = reply.send(query_balance(&deps).await);
                });
            }
            Command::Redeem(code, reply) => {
                let deps = Arc::clone(&self.deps);
                tokio::spawn(async move {
                    let _ = reply.send(redeem_code(&deps, &code).await);
                });
            }
            Command::SwitchAccount(reply) => {
                if let Err(e) = self.check_idle("switch account") {
                    let _ = reply.send(Err(e));
                    return;
                }
                let deps = Arc::clone(&self.deps);
                tokio::spawn(async move {
                    let result = match deps.auth.switch_account().await {
                        Ok(Some(_)) => Ok(()),
                        Ok(None) => Err(SessionError::NotAuthenticated),
                        Err(e) => Err(billing_error(e)),
                    };
                    let _ = reply.send(result);
                });
            }
            Command::Logout(reply) => {
                if let Err(e) = self.check_idle("log out") {
                    let _ = reply.send(Err(e));
                    return;
                }
                let deps = Arc::clone(&self.deps);
                tokio::spawn(async move {
                    let _ = reply.send(deps.auth.logout().await.map_err(billing_error));
                });
            }
        }
    }

    fn state(&self) -> SessionState {
        if self.preparing.is_some() {
            return SessionState::Starting;
        }
        self.session
            .as_ref()
            .map(|s| s.state)
            .unwrap_or(SessionState::Idle)
    }

    fn check_idle(&self, op: &'static str) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle => Ok(()),
            state => Err(SessionError::InvalidState { op, state }),
        }
    }

    fn check_mic_free(&self) -> Result<(), SessionError> {
        match self.deps.mic.active_owner() {
            Some(owner) => Err(SessionError::MicrophoneBusy { owner }),
            None => Ok(()),
        }
    }

    fn check_can_start(&self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Idle => self.check_mic_free(),
            SessionState::Starting | SessionState::Ending => Err(SessionError::Busy),
            SessionState::Running | SessionState::Paused => Err(SessionError::AlreadyActive),
        }
    }

    fn check_can_resume(&self) -> Result<String, SessionError> {
        match (self.state(), &self.session) {
            (SessionState::Paused, Some(session)) => {
                self.check_mic_free()?;
                Ok(session.token.clone())
            }
            (SessionState::Starting | SessionState::Ending, _) => Err(SessionError::Busy),
            (state, _) => Err(SessionError::InvalidState { op: "resume", state }),
        }
    }

    fn begin_prepare(&mut self, kind: PrepKind, token: Option<String>, reply: Reply<()>) {
        info!("Preparing session ({:?})", kind);
        self.preparing = Some(kind);

        let deps = Arc::clone(&self.deps);
        let owner = self.config.owner.clone();
        let backend_config = self.config.backend_config();
        let internal = self.internal.clone();
        tokio::spawn(async move {
            let result = prepare(&deps, token, &owner, backend_config).await;
            let _ = internal.send(Internal::Prepared {
                kind,
                result,
                reply,
            });
        });
    }

    async fn on_prepared(
        &mut self,
        kind: PrepKind,
        result: Result<Prepared, SessionError>,
        reply: Reply<()>,
    ) {
        self.preparing = None;

        let prepared = match result {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!("Session {:?} failed: {}", kind, e);
                self.emit(SessionEvent::error(e.to_string()));
                let _ = reply.send(Err(e));
                return;
            }
        };

        let deps = Arc::clone(&self.deps);
        match kind {
            PrepKind::Start => {
                let cursor = deps.buffer.lock().await.cursor_position();
                let mut draft = DraftMerger::new();
                draft.reset(cursor);
                let id = Uuid::new_v4();
                self.session = Some(ActiveSession {
                    id,
                    token: prepared.token.clone(),
                    gateway_url: prepared.gateway_url.clone(),
                    started_at: Utc::now(),
                    state: SessionState::Running,
                    ending: EndingReason::None,
                    draft,
                    segment: None,
                });
                info!("Session {} started, draft at {}", id, cursor);
            }
            PrepKind::Resume => {
                let Some(session) = self.session.as_mut() else {
                    let _ = reply.send(Err(SessionError::InvalidState {
                        op: "resume",
                        state: SessionState::Idle,
                    }));
                    return;
                };
                {
                    let mut buf = deps.buffer.lock().await;
                    session.draft.begin_new_segment(&mut *buf);
                }
                session.gateway_url = prepared.gateway_url.clone();
                session.state = SessionState::Running;
                session.ending = EndingReason::None;
                info!("Session resumed");
            }
        }

        self.open_segment(prepared).await;
        self.emit(SessionEvent::ok(match kind {
            PrepKind::Start => "Voice note started",
            PrepKind::Resume => "Voice note resumed",
        }));
        let _ = reply.send(Ok(()));
    }

    async fn open_segment(&mut self, prepared: Prepared) {
        self.next_segment += 1;
        let id = self.next_segment;

        let link = Link::new(
            self.config.transport.clone(),
            prepared.token,
            self.config.client.clone(),
            self.config.chunk_bytes(),
        );
        let capture = spawn_capture(
            id,
            prepared.backend,
            prepared.frames,
            self.config.sample_rate,
            self.internal.clone(),
        );

        if let Some(session) = self.session.as_mut() {
            session.segment = Some(Segment {
                id,
                link,
                conn: None,
                outbound: None,
                capture: Some(capture),
                draining: false,
                lease: Some(prepared.lease),
                timers: Timers::default(),
            });
        }
        self.drive(LinkEvent::Connect).await;
    }

    async fn pause(&mut self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Running => {}
            SessionState::Starting | SessionState::Ending => return Err(SessionError::Busy),
            state => return Err(SessionError::InvalidState { op: "pause", state }),
        }
        info!("Pausing session");
        self.begin_ending(EndingReason::Pause).await;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), SessionError> {
        match self.state() {
            SessionState::Running => {
                info!("Stopping session");
                self.begin_ending(EndingReason::Stop).await;
                Ok(())
            }
            SessionState::Paused => {
                // Nothing is open while paused
                self.session = None;
                info!("Paused session discarded");
                self.emit(SessionEvent::ok("Voice note ended"));
                Ok(())
            }
            SessionState::Starting | SessionState::Ending => Err(SessionError::Busy),
            state => Err(SessionError::InvalidState { op: "stop", state }),
        }
    }

    /// The link hears about the stop only after the capture tail has been queued
    async fn begin_ending(&mut self, reason: EndingReason) {
        let mut draining = false;
        if let Some(session) = self.session.as_mut() {
            session.state = SessionState::Ending;
            session.ending = reason;
            if let Some(segment) = session.segment.as_mut() {
                draining = segment.drain_capture();
                segment.release_mic();
            }
        }
        if draining {
            debug!("Waiting for capture to drain");
        } else {
            self.drive(LinkEvent::StopRequested).await;
        }
    }

    async fn on_internal(&mut self, event: Internal) {
        match event {
            Internal::Prepared {
                kind,
                result,
                reply,
            } => self.on_prepared(kind, result, reply).await,

            Internal::Audio { segment, bytes } => {
                if self.segment_mut(segment).is_some() {
                    self.drive(LinkEvent::Audio(bytes)).await;
                }
            }

            Internal::CaptureEnded { segment } => {
                if self.segment_mut(segment).is_some() {
                    info!("Audio source exhausted");
                    self.emit(SessionEvent::CaptureEnded);
                }
            }

            Internal::CaptureDrained { segment } => {
                let Some(current) = self.segment_mut(segment) else {
                    return;
                };
                current.capture = None;
                if std::mem::take(&mut current.draining) {
                    self.drive(LinkEvent::StopRequested).await;
                }
            }

            Internal::Opened {
                segment,
                conn,
                outbound,
            } => match self.connection_mut(segment, conn) {
                Some(current) => {
                    current.outbound = Some(outbound);
                    self.drive(LinkEvent::Opened).await;
                }
                None => {
                    let _ = outbound.send(Outbound::Close);
                }
            },

            Internal::Socket {
                segment,
                conn,
                inbound,
            } => {
                if self.connection_mut(segment, conn).is_none() {
                    return;
                }
                let event = match inbound {
                    Inbound::Text(text) => match ServerMessage::parse(&text) {
                        Some(msg) => LinkEvent::Message(msg),
                        None => return,
                    },
                    Inbound::Error(e) => LinkEvent::SocketError(e),
                    Inbound::Closed => LinkEvent::SocketClosed,
                };
                self.drive(event).await;
            }

            Internal::Timer { segment, kind } => {
                let Some(current) = self.segment_mut(segment) else {
                    return;
                };
                let event = match kind {
                    TimerKind::Keepalive => LinkEvent::KeepaliveTick {
                        wall_ms: Utc::now().timestamp_millis(),
                    },
                    TimerKind::Reconnect => {
                        current.timers.reconnect = None;
                        LinkEvent::ReconnectDue
                    }
                    TimerKind::Grace => {
                        current.timers.grace = None;
                        LinkEvent::GraceExpired
                    }
                };
                self.drive(event).await;
            }
        }
    }

    fn segment_mut(&mut self, id: u64) -> Option<&mut Segment> {
        self.session
            .as_mut()
            .and_then(|s| s.segment.as_mut())
            .filter(|s| s.id == id)
    }

    fn connection_mut(&mut self, segment: u64, conn: u64) -> Option<&mut Segment> {
        self.segment_mut(segment).filter(|s| s.conn == Some(conn))
    }

    async fn drive(&mut self, event: LinkEvent) {
        let effects = match self.session.as_mut().and_then(|s| s.segment.as_mut()) {
            Some(segment) => segment.link.handle(event, Instant::now()),
            None => return,
        };
        self.apply(effects).await;
    }

    async fn apply(&mut self, effects: Vec<Effect>) {
        let mut finished = None;
        for effect in effects {
            match effect {
                Effect::Finished(outcome) => finished = Some(outcome),
                Effect::Transcript { text, is_final } => {
                    self.write_transcript(text, is_final).await
                }
                Effect::Billing(fields) => self.emit(SessionEvent::Billing {
                    fields: serde_json::Value::Object(fields),
                }),
                Effect::Ready => self.emit(SessionEvent::ok("Listening, start speaking")),
                io => self.apply_io(io),
            }
        }
        if let Some(outcome) = finished {
            self.finish(outcome);
        }
    }

    fn apply_io(&mut self, effect: Effect) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(segment) = session.segment.as_mut() else {
            return;
        };

        match effect {
            Effect::OpenSocket => {
                self.next_conn += 1;
                segment.conn = Some(self.next_conn);
                segment.outbound = None;
                spawn_connection(
                    Arc::clone(&self.deps.connector),
                    session.gateway_url.clone(),
                    segment.id,
                    self.next_conn,
                    self.internal.clone(),
                );
            }
            Effect::Send(msg) => segment.send(Outbound::Text(msg.to_json())),
            Effect::SendAudio(bytes) => segment.send(Outbound::Binary(bytes)),
            Effect::CloseSocket => segment.close_socket(),
            Effect::StartKeepalive => {
                let internal = self.internal.clone();
                let id = segment.id;
                segment.timers.keepalive = Some(TimerHandle::every(
                    self.config.transport.keepalive_interval(),
                    move || {
                        internal
                            .send(Internal::Timer {
                                segment: id,
                                kind: TimerKind::Keepalive,
                            })
                            .is_ok()
                    },
                ));
            }
            Effect::StopKeepalive => segment.timers.keepalive = None,
            Effect::ScheduleReconnect(delay) => {
                segment.timers.reconnect = Some(schedule(
                    &self.internal,
                    segment.id,
                    delay,
                    TimerKind::Reconnect,
                ));
            }
            Effect::StartGrace(delay) => {
                segment.timers.grace =
                    Some(schedule(&self.internal, segment.id, delay, TimerKind::Grace));
            }
            Effect::CancelTimers => segment.timers.cancel_all(),
            Effect::Ready
            | Effect::Transcript { .. }
            | Effect::Billing(_)
            | Effect::Finished(_) => {}
        }
    }

    async fn write_transcript(&mut self, text: String, is_final: bool) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        {
            let mut buf = self.deps.buffer.lock().await;
            session.draft.apply(&mut *buf, &text);
        }
        debug!("Transcript ({}): {}", if is_final { "final" } else { "partial" }, text);
        self.emit(SessionEvent::Transcript { text, is_final });
    }

    /// Close the current segment and settle the session according to why it ended
    fn finish(&mut self, outcome: LinkOutcome) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let Some(mut segment) = session.segment.take() {
            segment.teardown();
        }

        let paused = match (session.ending, &outcome) {
            (EndingReason::Pause, _) => true,
            (EndingReason::Stop, _) => false,
            (EndingReason::None, LinkOutcome::ConnectionLost) => true,
            (EndingReason::None, _) => false,
        };
        let notice = match &outcome {
            LinkOutcome::ConnectionLost => {
                SessionEvent::error("Connection lost, resume to retry")
            }
            LinkOutcome::Rejected(error) => {
                SessionEvent::error(format!("Voice note failed: {}", error))
            }
            LinkOutcome::Completed => SessionEvent::ok(match session.ending {
                EndingReason::Pause => "Voice note paused",
                EndingReason::Stop => "Voice note ended",
                EndingReason::None => "Voice note ended by the gateway",
            }),
        };

        session.ending = EndingReason::None;
        if paused {
            session.state = SessionState::Paused;
            info!("Session paused ({:?})", outcome);
        } else {
            self.session = None;
            info!("Session closed ({:?})", outcome);
        }
        self.emit(notice);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }

    fn publish(&mut self) {
        let state = self.state();
        if state != self.last_state {
            self.last_state = state;
            self.emit(SessionEvent::StateChanged { state });
        }

        let session = self.session.as_ref();
        let segment = session.and_then(|s| s.segment.as_ref());
        self.status.send_replace(SessionStatus {
            session_id: session.map(|s| s.id),
            state,
            ending: session.map(|s| s.ending).unwrap_or_default(),
            link: segment.map(|s| s.link.state()),
            reconnect_attempts: segment.map(|s| s.link.attempts()).unwrap_or(0),
            started_at: session.map(|s| s.started_at),
            elapsed_ms: None,
            draft: session.map(|s| s.draft.span()),
            mic_owner: self.deps.mic.active_owner(),
        });
    }
}

fn schedule(
    internal: &mpsc::UnboundedSender<Internal>,
    segment: u64,
    delay: Duration,
    kind: TimerKind,
) -> TimerHandle {
    let internal = internal.clone();
    TimerHandle::after(delay, move || {
        let _ = internal.send(Internal::Timer { segment, kind });
    })
}

fn billing_error(e: Error) -> SessionError {
    SessionError::Billing(format!("{:#}", e))
}

async fn require_token(deps: &SessionDeps) -> Result<String, SessionError> {
    deps.auth
        .ensure_token()
        .await
        .map_err(billing_error)?
        .ok_or(SessionError::NotAuthenticated)
}

async fn query_balance(deps: &SessionDeps) -> Result<BillingStatus, SessionError> {
    let token = require_token(deps).await?;
    deps.billing.status(&token).await.map_err(billing_error)
}

async fn redeem_code(deps: &SessionDeps, code: &str) -> Result<BillingStatus, SessionError> {
    let token = require_token(deps).await?;
    let status = deps
        .billing
        .redeem(&token, code)
        .await
        .map_err(billing_error)?;
    info!("Redeemed top-up code, balance {} min", status.display_minutes());
    Ok(status)
}

/// Auth, balance and gateway checks, then microphone and capture
///
/// The microphone is only touched once every account check has passed.
async fn prepare(
    deps: &SessionDeps,
    token: Option<String>,
    owner: &str,
    backend_config: AudioBackendConfig,
) -> Result<Prepared, SessionError> {
    let token = match token {
        Some(token) => token,
        None => require_token(deps).await?,
    };

    let status = deps.billing.status(&token).await.map_err(billing_error)?;
    let gateway_url = status
        .gateway_url()
        .ok_or(SessionError::MissingGateway)?
        .to_string();
    if status.balance_ms <= 0.0 {
        return Err(SessionError::InsufficientBalance {
            balance_ms: status.balance_ms,
        });
    }
    info!(
        "Balance {} min, gateway {}",
        status.display_minutes(),
        gateway_url
    );

    let lease = deps.mic.acquire(owner).map_err(|e| match e {
        MicError::Held { owner } | MicError::AlreadyOwned { owner } => {
            SessionError::MicrophoneBusy { owner }
        }
    })?;

    let mut backend = deps
        .audio
        .create(backend_config)
        .map_err(|e| SessionError::Capture(format!("{:#}", e)))?;
    let frames = backend
        .start()
        .await
        .map_err(|e| SessionError::Capture(format!("{:#}", e)))?;
    info!("Capture started on {} backend", backend.name());

    Ok(Prepared {
        token,
        gateway_url,
        lease,
        backend,
        frames,
    })
}

fn spawn_capture(
    segment: u64,
    mut backend: Box<dyn AudioBackend>,
    mut frames: mpsc::Receiver<AudioFrame>,
    sample_rate: u32,
    internal: mpsc::UnboundedSender<Internal>,
) -> CaptureHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let pipeline = CapturePipeline::new(sample_rate);
        let forward = |frame: AudioFrame| {
            let bytes = pipeline.encode(&frame);
            bytes.is_empty() || internal.send(Internal::Audio { segment, bytes }).is_ok()
        };

        let exit = loop {
            tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(frame) => {
                        if !forward(frame) {
                            break CaptureExit::Abandoned;
                        }
                    }
                    None => break CaptureExit::Exhausted,
                },
                stop = &mut stop_rx => break match stop {
                    Ok(()) => CaptureExit::Drain,
                    Err(_) => CaptureExit::Abandoned,
                },
            }
        };

        // Frames still queued in the backend channel belong to this segment
        if exit == CaptureExit::Drain {
            let mut flushed = 0;
            while let Ok(frame) = frames.try_recv() {
                if !forward(frame) {
                    break;
                }
                flushed += 1;
            }
            debug!("Capture drained {} queued frames for segment {}", flushed, segment);
        }
        let _ = internal.send(Internal::CaptureDrained { segment });

        if let Err(e) = backend.stop().await {
            warn!("Failed to stop {} backend: {}", backend.name(), e);
        }
        if exit == CaptureExit::Exhausted {
            let _ = internal.send(Internal::CaptureEnded { segment });
        }
        debug!("Capture task for segment {} finished", segment);
    });

    CaptureHandle { stop: stop_tx }
}

fn spawn_connection(
    connector: Arc<dyn GatewayConnector>,
    url: String,
    segment: u64,
    conn: u64,
    internal: mpsc::UnboundedSender<Internal>,
) {
    tokio::spawn(async move {
        let Connection {
            outbound,
            mut inbound,
        } = match connector.connect(&url).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("Gateway connect failed: {:#}", e);
                let _ = internal.send(Internal::Socket {
                    segment,
                    conn,
                    inbound: Inbound::Error(format!("{:#}", e)),
                });
                return;
            }
        };

        if internal
            .send(Internal::Opened {
                segment,
                conn,
                outbound,
            })
            .is_err()
        {
            return;
        }

        while let Some(item) = inbound.recv().await {
            let terminal = !matches!(item, Inbound::Text(_));
            if internal
                .send(Internal::Socket {
                    segment,
                    conn,
                    inbound: item,
                })
                .is_err()
                || terminal
            {
                return;
            }
        }
        let _ = internal.send(Internal::Socket {
            segment,
            conn,
            inbound: Inbound::Closed,
        });
    });
}
