// Shared fakes for the integration tests: a scriptable gateway, a billing
// service with a fixed status, and an audio source fed from the test body.

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use asr_note::audio::{
    AudioBackend, AudioBackendConfig, AudioBackendFactory, AudioFrame, CapturePipeline, MicArbiter,
};
use asr_note::billing::{AuthProvider, BillingApi, BillingStatus, Endpoint};
use asr_note::session::{
    SessionConfig, SessionController, SessionDeps, SessionEvent, SessionState,
};
use asr_note::transcript::StringBuffer;
use asr_note::transport::{Connection, GatewayConnector, Inbound, Outbound};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::Instant;

pub const GATEWAY_URL: &str = "ws://gateway.test/asr";
pub const TOKEN: &str = "test-token";

/// Generous upper bound; with a paused clock this only matters when a test is stuck
const WAIT: Duration = Duration::from_secs(300);

// ---------------------------------------------------------------------------
// Gateway

/// Connector half handed to the controller
pub struct FakeConnector {
    sockets: mpsc::UnboundedSender<FakeSocket>,
    refuse_next: Arc<AtomicUsize>,
    refuse_all: Arc<AtomicBool>,
    attempts: Arc<StdMutex<Vec<Instant>>>,
}

/// Test half: accepts sockets and decides which connects fail
pub struct FakeGateway {
    sockets: mpsc::UnboundedReceiver<FakeSocket>,
    refuse_next: Arc<AtomicUsize>,
    refuse_all: Arc<AtomicBool>,
    attempts: Arc<StdMutex<Vec<Instant>>>,
}

pub fn fake_gateway() -> (FakeConnector, FakeGateway) {
    let (tx, rx) = mpsc::unbounded_channel();
    let refuse_next = Arc::new(AtomicUsize::new(0));
    let refuse_all = Arc::new(AtomicBool::new(false));
    let attempts = Arc::new(StdMutex::new(Vec::new()));

    let connector = FakeConnector {
        sockets: tx,
        refuse_next: Arc::clone(&refuse_next),
        refuse_all: Arc::clone(&refuse_all),
        attempts: Arc::clone(&attempts),
    };
    let gateway = FakeGateway {
        sockets: rx,
        refuse_next,
        refuse_all,
        attempts,
    };
    (connector, gateway)
}

#[async_trait::async_trait]
impl GatewayConnector for FakeConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        self.attempts.lock().unwrap().push(Instant::now());

        if self.refuse_all.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let refused = self
            .refuse_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(anyhow!("connection refused"));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        self.sockets
            .send(FakeSocket {
                url: url.to_string(),
                sent: out_rx,
                server: in_tx,
            })
            .map_err(|_| anyhow!("gateway gone"))?;

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

impl FakeGateway {
    pub async fn accept(&mut self) -> FakeSocket {
        tokio::time::timeout(WAIT, self.sockets.recv())
            .await
            .expect("timed out waiting for a gateway connection")
            .expect("connector dropped")
    }

    /// Fail the next `n` connects
    pub fn refuse_next(&self, n: usize) {
        self.refuse_next.store(n, Ordering::SeqCst);
    }

    pub fn refuse_all(&self, refuse: bool) {
        self.refuse_all.store(refuse, Ordering::SeqCst);
    }

    /// Instant of every connect call so far, successful or not
    pub fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

/// Server side of one accepted socket
pub struct FakeSocket {
    pub url: String,
    sent: mpsc::UnboundedReceiver<Outbound>,
    server: mpsc::UnboundedSender<Inbound>,
}

impl FakeSocket {
    pub fn send(&self, msg: Value) {
        let _ = self.server.send(Inbound::Text(msg.to_string()));
    }

    pub fn send_raw(&self, text: &str) {
        let _ = self.server.send(Inbound::Text(text.to_string()));
    }

    pub fn ready(&self) {
        self.send(json!({"type": "ready"}));
    }

    pub fn partial(&self, text: &str) {
        self.send(json!({"type": "partial", "text": text}));
    }

    pub fn final_text(&self, text: &str) {
        self.send(json!({"type": "final", "text": text}));
    }

    pub fn end(&self) {
        self.send(json!({"type": "end"}));
    }

    pub fn close(&self) {
        let _ = self.server.send(Inbound::Closed);
    }

    /// Next frame the client wrote; `None` once the client hung up
    pub async fn next(&mut self) -> Option<Outbound> {
        tokio::time::timeout(WAIT, self.sent.recv())
            .await
            .expect("timed out waiting for a client frame")
    }

    /// Next JSON control message, skipping audio
    pub async fn next_json(&mut self) -> Value {
        loop {
            match self.next().await {
                Some(Outbound::Text(text)) => return serde_json::from_str(&text).unwrap(),
                Some(Outbound::Binary(_)) => continue,
                other => panic!("expected a text frame, got {:?}", other),
            }
        }
    }

    /// Next control message of the given type, skipping audio and other messages
    pub async fn next_of_type(&mut self, ty: &str) -> Value {
        loop {
            let msg = self.next_json().await;
            if msg["type"] == ty {
                return msg;
            }
        }
    }

    /// Next audio chunk, skipping pings
    pub async fn next_binary(&mut self) -> Vec<u8> {
        loop {
            match self.next().await {
                Some(Outbound::Binary(bytes)) => return bytes,
                Some(Outbound::Text(text)) if text.contains("\"ping\"") => continue,
                other => panic!("expected an audio frame, got {:?}", other),
            }
        }
    }

    /// Wait for the client to close this socket
    pub async fn closed(&mut self) {
        loop {
            match self.next().await {
                Some(Outbound::Close) | None => return,
                Some(_) => continue,
            }
        }
    }

    /// Everything written so far without waiting
    pub fn drain(&mut self) -> Vec<Outbound> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.sent.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

// ---------------------------------------------------------------------------
// Billing and auth

pub fn funded(balance_ms: f64) -> BillingStatus {
    BillingStatus {
        balance_ms,
        balance_min: None,
        ws: Some(Endpoint {
            url: GATEWAY_URL.to_string(),
        }),
        pay: Some(Endpoint {
            url: "https://pay.test/topup".to_string(),
        }),
    }
}

/// Billing service that always answers with the configured status
pub struct ScriptedBilling {
    status: StdMutex<BillingStatus>,
    status_calls: AtomicUsize,
}

impl ScriptedBilling {
    pub fn new(status: BillingStatus) -> Self {
        Self {
            status: StdMutex::new(status),
            status_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_status(&self, status: BillingStatus) {
        *self.status.lock().unwrap() = status;
    }

    pub fn status_calls(&self) -> usize {
        self.status_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl BillingApi for ScriptedBilling {
    async fn me(&self, _token: &str) -> Result<Value> {
        Ok(json!({"username": "tester"}))
    }

    async fn login(&self, _username: &str, _password: &str) -> Result<String> {
        Ok(TOKEN.to_string())
    }

    async fn register(&self, _username: &str, _password: &str) -> Result<String> {
        Ok(TOKEN.to_string())
    }

    async fn logout(&self, _token: &str) -> Result<()> {
        Ok(())
    }

    async fn status(&self, _token: &str) -> Result<BillingStatus> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.status.lock().unwrap().clone())
    }

    async fn redeem(&self, _token: &str, code: &str) -> Result<BillingStatus> {
        if code != "GOOD-CODE" {
            return Err(anyhow!("HTTP 400: invalid code"));
        }
        let mut status = self.status.lock().unwrap();
        status.balance_ms += 60_000.0;
        Ok(status.clone())
    }
}

/// Auth provider with a fixed token (or none)
pub struct FixedAuth {
    token: Option<String>,
    logouts: AtomicUsize,
}

impl FixedAuth {
    pub fn new(token: Option<&str>) -> Self {
        Self {
            token: token.map(str::to_string),
            logouts: AtomicUsize::new(0),
        }
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl AuthProvider for FixedAuth {
    async fn ensure_token(&self) -> Result<Option<String>> {
        Ok(self.token.clone())
    }

    async fn logout(&self) -> Result<()> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Audio

/// Audio source whose frames are pushed by the test
#[derive(Default)]
pub struct ChannelAudio {
    current: Arc<StdMutex<Option<mpsc::Sender<AudioFrame>>>>,
    created: AtomicUsize,
}

impl ChannelAudio {
    /// Number of backends created so far (one per capture segment)
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Deliver one 16kHz block to the live backend; false if none is capturing
    pub async fn push(&self, samples: Vec<f32>) -> bool {
        let tx = self.current.lock().unwrap().clone();
        match tx {
            Some(tx) => tx
                .send(AudioFrame::new(samples, 16000, 0))
                .await
                .is_ok(),
            None => false,
        }
    }

    /// End the current source, as a replayed file does
    pub fn exhaust(&self) {
        self.current.lock().unwrap().take();
    }
}

impl AudioBackendFactory for ChannelAudio {
    fn create(&self, _config: AudioBackendConfig) -> Result<Box<dyn AudioBackend>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ChannelBackend {
            slot: Arc::clone(&self.current),
            capturing: false,
        }))
    }
}

struct ChannelBackend {
    slot: Arc<StdMutex<Option<mpsc::Sender<AudioFrame>>>>,
    capturing: bool,
}

#[async_trait::async_trait]
impl AudioBackend for ChannelBackend {
    async fn start(&mut self) -> Result<mpsc::Receiver<AudioFrame>> {
        let (tx, rx) = mpsc::channel(64);
        *self.slot.lock().unwrap() = Some(tx);
        self.capturing = true;
        Ok(rx)
    }

    async fn stop(&mut self) -> Result<()> {
        self.slot.lock().unwrap().take();
        self.capturing = false;
        Ok(())
    }

    fn is_capturing(&self) -> bool {
        self.capturing
    }

    fn name(&self) -> &str {
        "channel"
    }
}

/// Little-endian PCM the session produces for `samples`
pub fn pcm(samples: &[f32]) -> Vec<u8> {
    CapturePipeline::new(16000).encode(&AudioFrame::new(samples.to_vec(), 16000, 0))
}

// ---------------------------------------------------------------------------
// Harness

pub struct Harness {
    pub controller: SessionController,
    pub gateway: FakeGateway,
    pub audio: Arc<ChannelAudio>,
    pub billing: Arc<ScriptedBilling>,
    pub auth: Arc<FixedAuth>,
    pub mic: MicArbiter,
    pub buffer: Arc<Mutex<StringBuffer>>,
    pub events: broadcast::Receiver<SessionEvent>,
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        owner: "asr-note".to_string(),
        realtime: false,
        ..SessionConfig::default()
    }
}

pub fn harness(status: BillingStatus) -> Harness {
    build(status, StringBuffer::new(), Some(TOKEN))
}

pub fn harness_with_text(status: BillingStatus, text: &str) -> Harness {
    build(status, StringBuffer::with_text(text), Some(TOKEN))
}

pub fn logged_out_harness() -> Harness {
    build(funded(60_000.0), StringBuffer::new(), None)
}

fn build(status: BillingStatus, buffer: StringBuffer, token: Option<&str>) -> Harness {
    let (connector, gateway) = fake_gateway();
    let audio = Arc::new(ChannelAudio::default());
    let billing = Arc::new(ScriptedBilling::new(status));
    let auth = Arc::new(FixedAuth::new(token));
    let mic = MicArbiter::new();
    let (buffer, shared) = buffer.shared();

    let controller = SessionController::spawn(
        test_config(),
        SessionDeps {
            auth: auth.clone(),
            billing: billing.clone(),
            connector: Arc::new(connector),
            audio: audio.clone(),
            mic: mic.clone(),
            buffer: shared,
        },
    );
    let events = controller.subscribe();

    Harness {
        controller,
        gateway,
        audio,
        billing,
        auth,
        mic,
        buffer,
        events,
    }
}

impl Harness {
    /// Start a session and complete the handshake; returns the ready socket
    pub async fn start_ready(&mut self) -> FakeSocket {
        self.controller.start().await.expect("start failed");
        let mut socket = self.gateway.accept().await;
        let start = socket.next_json().await;
        assert_eq!(start["type"], "start");
        socket.ready();
        self.wait_for(|e| matches!(e, SessionEvent::Notice { message, .. } if message.starts_with("Listening")))
            .await;
        socket
    }

    pub async fn text(&self) -> String {
        self.buffer.lock().await.text().to_string()
    }

    pub async fn wait_for(&mut self, pred: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let events = &mut self.events;
        tokio::time::timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if pred(&event) => return event,
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => panic!("controller gone"),
                }
            }
        })
        .await
        .expect("timed out waiting for a session event")
    }

    pub async fn wait_for_state(&mut self, state: SessionState) {
        self.wait_for(|e| matches!(e, SessionEvent::StateChanged { state: s } if *s == state))
            .await;
    }

    pub async fn wait_for_final(&mut self) -> String {
        match self
            .wait_for(|e| matches!(e, SessionEvent::Transcript { is_final: true, .. }))
            .await
        {
            SessionEvent::Transcript { text, .. } => text,
            _ => unreachable!(),
        }
    }

}

/// Let every spawned task run to idle. With a paused clock, time only
/// advances once nothing else is runnable, so this returns after all
/// pending channel traffic has been handled.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}
