use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

/// How long a closing socket waits for the peer before it is dropped
pub const CLOSE_WAIT: Duration = Duration::from_secs(1);

/// Frames written to the gateway
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

/// What the socket reader observed
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Text(String),
    Error(String),
    Closed,
}

/// One open duplex socket
///
/// Dropping the `outbound` sender closes the socket; `inbound` ends with
/// exactly one `Closed` or `Error` item.
pub struct Connection {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
}

/// Opens sockets to the recognition gateway
#[async_trait::async_trait]
pub trait GatewayConnector: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Connection>;
}

/// WebSocket connector backed by tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

impl WsConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait::async_trait]
impl GatewayConnector for WsConnector {
    async fn connect(&self, url: &str) -> Result<Connection> {
        let (stream, _) = connect_async(url)
            .await
            .with_context(|| format!("Failed to connect to gateway {}", url))?;
        info!("Gateway socket open: {}", url);

        let (mut ws_tx, mut ws_rx) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Inbound>();
        let closed_tx = in_tx.clone();

        let mut reader = tokio::spawn(async move {
            let last = loop {
                match ws_rx.next().await {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        if in_tx.send(Inbound::Text(text.to_string())).is_err() {
                            return;
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(frame))) => {
                        if let Some(frame) = frame {
                            debug!("Gateway closed: {} {}", frame.code, frame.reason);
                        }
                        break Inbound::Closed;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("Gateway socket error: {}", e);
                        break Inbound::Error(e.to_string());
                    }
                    None => break Inbound::Closed,
                }
            };
            let _ = in_tx.send(last);
        });

        // Writer: forwards until Close or until every sender is dropped, then
        // gives the peer CLOSE_WAIT to answer before the reader is cut off
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                let msg = match frame {
                    Outbound::Text(text) => tungstenite::Message::Text(text.into()),
                    Outbound::Binary(bytes) => tungstenite::Message::Binary(bytes.into()),
                    Outbound::Close => break,
                };
                if let Err(e) = ws_tx.send(msg).await {
                    debug!("Gateway write failed: {}", e);
                    break;
                }
            }

            let closing = async {
                let _ = ws_tx.close().await;
                let _ = (&mut reader).await;
            };
            if tokio::time::timeout(CLOSE_WAIT, closing).await.is_err() {
                debug!("Gateway did not finish the close handshake, dropping socket");
                reader.abort();
                let _ = closed_tx.send(Inbound::Closed);
            }
        });

        Ok(Connection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}
