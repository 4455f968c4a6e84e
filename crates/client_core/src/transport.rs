use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientRequest, ServerEvent};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        client::IntoClientRequest,
        http::{header::COOKIE, HeaderValue},
        Message,
    },
};
use tracing::{debug, warn};

/// Credentials presented on the socket handshake.
#[derive(Debug, Clone, Default)]
pub struct SessionAuth {
    pub socket_url: String,
    pub session_cookie: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Event(ServerEvent),
    Closed(Option<String>),
}

/// One live transport. Dropping `outbound` closes the write side.
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<ClientRequest>,
    pub inbound: mpsc::UnboundedReceiver<LinkEvent>,
}

#[async_trait]
pub trait SocketConnector: Send + Sync {
    async fn connect(&self, auth: &SessionAuth) -> Result<SocketLink>;
}

pub struct WebSocketConnector;

#[async_trait]
impl SocketConnector for WebSocketConnector {
    async fn connect(&self, auth: &SessionAuth) -> Result<SocketLink> {
        let mut request = auth
            .socket_url
            .as_str()
            .into_client_request()
            .with_context(|| format!("invalid socket url: {}", auth.socket_url))?;
        if let Some(cookie) = &auth.session_cookie {
            request.headers_mut().insert(
                COOKIE,
                HeaderValue::from_str(cookie).context("session cookie is not a valid header")?,
            );
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .with_context(|| format!("failed to connect websocket: {}", auth.socket_url))?;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientRequest>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<LinkEvent>();

        tokio::spawn(async move {
            while let Some(request) = outbound_rx.recv().await {
                let text = match serde_json::to_string(&request) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!("socket: failed to encode client frame: {err}");
                        continue;
                    }
                };
                if let Err(err) = ws_writer.send(Message::Text(text)).await {
                    warn!("socket: write failed: {err}");
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        tokio::spawn(async move {
            let reason = loop {
                match ws_reader.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text) {
                            Ok(event) => {
                                if inbound_tx.send(LinkEvent::Event(event)).is_err() {
                                    return;
                                }
                            }
                            Err(err) => {
                                warn!("socket: skipping malformed server frame: {err}");
                            }
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame.map(|frame| frame.reason.to_string());
                    }
                    Some(Ok(_)) => {
                        debug!("socket: ignoring non-text frame");
                    }
                    Some(Err(err)) => break Some(err.to_string()),
                    None => break None,
                }
            };
            let _ = inbound_tx.send(LinkEvent::Closed(reason));
        });

        Ok(SocketLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
