//! Gateway connection state machine
//!
//! `Link` is pure: it never touches a socket or a timer. Every input is a
//! [`LinkEvent`], every output is a list of [`Effect`]s for the session
//! runtime to carry out, so the whole transition table can be exercised
//! without I/O.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::messages::{ClientInfo, ClientMessage, ReconnectInfo, RecognizerOptions, ServerMessage};
use crate::audio::ChunkQueue;

/// Transport tunables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    pub keepalive_interval_ms: u64,
    pub pong_timeout_ms: u64,
    pub reconnect_base_ms: u64,
    pub reconnect_cap_ms: u64,
    pub max_reconnect_attempts: u32,
    pub stop_grace_ms: u64,
    /// Hold duration requested from the gateway in the handshake
    pub hold_ms: u64,
    pub language: String,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            keepalive_interval_ms: 20_000,
            pong_timeout_ms: 60_000,
            reconnect_base_ms: 500,
            reconnect_cap_ms: 8_000,
            max_reconnect_attempts: 5,
            stop_grace_ms: 8_000,
            hold_ms: 120_000,
            language: "zh".to_string(),
        }
    }
}

impl TransportSettings {
    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Backoff for the given 1-based attempt: min(cap, base * 2^(attempt-1))
pub fn reconnect_delay(attempt: u32, base_ms: u64, cap_ms: u64) -> Duration {
    let exp = attempt.saturating_sub(1).min(32);
    let delay = base_ms.saturating_mul(1u64 << exp).min(cap_ms);
    Duration::from_millis(delay)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Handshaking,
    Ready,
    Reconnecting,
    Closed,
}

/// Why a link reached `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkOutcome {
    /// Graceful end: gateway `end`, stop acknowledged, or grace expired
    Completed,
    /// Gateway sent `error`
    Rejected(String),
    /// Reconnect budget exhausted
    ConnectionLost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connect,
    Opened,
    Message(ServerMessage),
    SocketError(String),
    SocketClosed,
    /// Keepalive timer tick; `wall_ms` is the client clock for the ping payload
    KeepaliveTick { wall_ms: i64 },
    ReconnectDue,
    Audio(Vec<u8>),
    StopRequested,
    GraceExpired,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    OpenSocket,
    Send(ClientMessage),
    SendAudio(Vec<u8>),
    CloseSocket,
    StartKeepalive,
    StopKeepalive,
    ScheduleReconnect(Duration),
    StartGrace(Duration),
    CancelTimers,
    Ready,
    Transcript { text: String, is_final: bool },
    Billing(serde_json::Map<String, serde_json::Value>),
    Finished(LinkOutcome),
}

/// Connection lifecycle for one capture segment
///
/// The chunk queue lives here so that audio captured while disconnected
/// survives into the next connection.
#[derive(Debug)]
pub struct Link {
    settings: TransportSettings,
    token: String,
    client: ClientInfo,
    state: LinkState,
    attempts: u32,
    reconnect_pending: bool,
    last_reason: Option<String>,
    last_pong: Option<Instant>,
    handshake_sent: bool,
    ending: bool,
    queue: ChunkQueue,
}

impl Link {
    pub fn new(settings: TransportSettings, token: String, client: ClientInfo, chunk_bytes: usize) -> Self {
        Self {
            settings,
            token,
            client,
            state: LinkState::Disconnected,
            attempts: 0,
            reconnect_pending: false,
            last_reason: None,
            last_pong: None,
            handshake_sent: false,
            ending: false,
            queue: ChunkQueue::new(chunk_bytes),
        }
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn is_ready(&self) -> bool {
        self.state == LinkState::Ready
    }

    pub fn handshake_sent(&self) -> bool {
        self.handshake_sent
    }

    pub fn is_ending(&self) -> bool {
        self.ending
    }

    pub fn queued_bytes(&self) -> usize {
        self.queue.len()
    }

    pub fn handle(&mut self, event: LinkEvent, now: Instant) -> Vec<Effect> {
        let mut fx = Vec::new();
        if self.state == LinkState::Closed {
            return fx;
        }

        match event {
            LinkEvent::Connect => {
                if self.state == LinkState::Disconnected {
                    self.state = LinkState::Connecting;
                    fx.push(Effect::OpenSocket);
                }
            }

            LinkEvent::Opened => {
                if self.state == LinkState::Connecting {
                    self.state = LinkState::Handshaking;
                    fx.push(Effect::Send(self.start_message()));
                    self.handshake_sent = true;
                    debug!("Handshake sent");
                }
            }

            LinkEvent::Message(msg) => self.on_message(msg, now, &mut fx),

            LinkEvent::SocketError(reason) => {
                warn!("Gateway socket error: {}", reason);
                self.on_socket_lost("ws_error", &mut fx);
            }

            LinkEvent::SocketClosed => self.on_socket_lost("ws_close", &mut fx),

            LinkEvent::KeepaliveTick { wall_ms } => {
                if self.state == LinkState::Ready && !self.ending {
                    fx.push(Effect::Send(ClientMessage::Ping { ts: wall_ms }));
                    let timeout = Duration::from_millis(self.settings.pong_timeout_ms);
                    let silent = self
                        .last_pong
                        .map(|at| now.saturating_duration_since(at))
                        .unwrap_or_default();
                    if silent > timeout {
                        warn!("No pong for {:?}, reconnecting", silent);
                        self.schedule_reconnect("pong_timeout", &mut fx);
                    }
                }
            }

            LinkEvent::ReconnectDue => {
                self.reconnect_pending = false;
                if self.state == LinkState::Reconnecting && !self.ending {
                    self.state = LinkState::Connecting;
                    self.handshake_sent = false;
                    fx.push(Effect::OpenSocket);
                }
            }

            LinkEvent::Audio(bytes) => {
                if !self.ending {
                    self.queue.push(bytes);
                    if self.state == LinkState::Ready {
                        fx.extend(self.queue.drain_ready().into_iter().map(Effect::SendAudio));
                    }
                }
            }

            LinkEvent::StopRequested => {
                if self.ending {
                    return fx;
                }
                self.ending = true;
                if self.state == LinkState::Ready {
                    fx.extend(self.queue.flush_final().into_iter().map(Effect::SendAudio));
                    fx.push(Effect::Send(ClientMessage::Stop));
                    fx.push(Effect::StopKeepalive);
                    fx.push(Effect::StartGrace(self.settings.stop_grace()));
                } else {
                    // Nothing open to drain or acknowledge
                    self.finish(LinkOutcome::Completed, &mut fx);
                }
            }

            LinkEvent::GraceExpired => {
                if self.ending {
                    info!("Stop grace period expired, forcing teardown");
                    self.finish(LinkOutcome::Completed, &mut fx);
                }
            }
        }

        fx
    }

    fn on_message(&mut self, msg: ServerMessage, now: Instant, fx: &mut Vec<Effect>) {
        match msg {
            ServerMessage::Ready => {
                if self.state != LinkState::Handshaking {
                    return;
                }
                info!("Gateway ready");
                self.state = LinkState::Ready;
                self.attempts = 0;
                self.last_pong = Some(now);
                fx.extend(self.queue.drain_ready().into_iter().map(Effect::SendAudio));
                fx.push(Effect::StartKeepalive);
                fx.push(Effect::Ready);
            }
            ServerMessage::Pong => self.last_pong = Some(now),
            ServerMessage::Partial { text } => self.on_text(text, false, fx),
            ServerMessage::Final { text } => self.on_text(text, true, fx),
            ServerMessage::Billing { fields } => fx.push(Effect::Billing(fields)),
            ServerMessage::End => {
                info!("Gateway ended the session");
                self.finish(LinkOutcome::Completed, fx);
            }
            ServerMessage::Error { error } => {
                let error = if error.is_empty() {
                    "unknown".to_string()
                } else {
                    error
                };
                warn!("Gateway error: {}", error);
                self.finish(LinkOutcome::Rejected(error), fx);
            }
            ServerMessage::Unknown => {}
        }
    }

    fn on_text(&mut self, text: String, is_final: bool, fx: &mut Vec<Effect>) {
        if self.state == LinkState::Ready && !text.is_empty() {
            fx.push(Effect::Transcript { text, is_final });
        }
    }

    fn on_socket_lost(&mut self, reason: &str, fx: &mut Vec<Effect>) {
        if self.ending {
            // The gateway closed after our stop; nothing left to wait for
            self.finish(LinkOutcome::Completed, fx);
        } else {
            self.schedule_reconnect(reason, fx);
        }
    }

    fn schedule_reconnect(&mut self, reason: &str, fx: &mut Vec<Effect>) {
        if self.ending || self.reconnect_pending {
            return;
        }

        if self.attempts >= self.settings.max_reconnect_attempts {
            warn!(
                "Giving up after {} reconnect attempts ({})",
                self.attempts, reason
            );
            self.finish(LinkOutcome::ConnectionLost, fx);
            return;
        }

        self.attempts += 1;
        let delay = reconnect_delay(
            self.attempts,
            self.settings.reconnect_base_ms,
            self.settings.reconnect_cap_ms,
        );
        info!(
            "Reconnecting in {:?} (attempt {}, reason {})",
            delay, self.attempts, reason
        );

        self.state = LinkState::Reconnecting;
        self.reconnect_pending = true;
        self.handshake_sent = false;
        self.last_reason = Some(reason.to_string());
        fx.push(Effect::StopKeepalive);
        fx.push(Effect::CloseSocket);
        fx.push(Effect::ScheduleReconnect(delay));
    }

    fn finish(&mut self, outcome: LinkOutcome, fx: &mut Vec<Effect>) {
        self.state = LinkState::Closed;
        self.reconnect_pending = false;
        self.queue.clear();
        fx.push(Effect::CancelTimers);
        fx.push(Effect::CloseSocket);
        fx.push(Effect::Finished(outcome));
    }

    fn start_message(&self) -> ClientMessage {
        let mut client = self.client.clone();
        client.reconnect = self.last_reason.as_ref().map(|reason| ReconnectInfo {
            tries: self.attempts,
            reason: reason.clone(),
        });

        ClientMessage::Start {
            token: self.token.clone(),
            hold_ms: self.settings.hold_ms,
            client,
            recognizer: RecognizerOptions {
                language: self.settings.language.clone(),
            },
        }
    }
}
