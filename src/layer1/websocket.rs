// WebSocket Transport - tokio-tungstenite implementation of FrameTransport
// Plus login/subscribe message builders for OKX-style venues

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use std::fmt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::layer1::connection::{Credentials, FrameTransport, StreamError};

type HmacSha256 = Hmac<Sha256>;
type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LOGIN_PATH: &str = "/users/self/verify";

// ============================================================================
// Message builders
// ============================================================================

/// `{"op":"subscribe","args":[{"channel":..,"instId":..}]}`
pub fn subscribe_message(channel: &str, symbol: &str) -> String {
    json!({
        "op": "subscribe",
        "args": [{ "channel": channel, "instId": symbol }],
    })
    .to_string()
}

/// Login request signed with Base64(HMAC-SHA256) over `timestamp + "GET" + path`
pub fn login_message(credentials: &Credentials, timestamp_secs: i64) -> Result<String, StreamError> {
    let timestamp = timestamp_secs.to_string();
    let sign = sign(&credentials.api_secret, &format!("{}GET{}", timestamp, LOGIN_PATH))?;

    Ok(json!({
        "op": "login",
        "args": [{
            "apiKey": credentials.api_key,
            "passphrase": credentials.passphrase,
            "timestamp": timestamp,
            "sign": sign,
        }],
    })
    .to_string())
}

fn sign(secret: &str, payload: &str) -> Result<String, StreamError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| StreamError::FatalAuth(format!("invalid api secret: {}", e)))?;
    mac.update(payload.as_bytes());
    Ok(STANDARD.encode(mac.finalize().into_bytes()))
}

// ============================================================================
// Transport
// ============================================================================

/// WebSocket `FrameTransport`. Pings are answered inline; binary frames are
/// decoded as UTF-8.
#[derive(Default)]
pub struct WsTransport {
    stream: Option<WsStream>,
    messages_received: u64,
    bytes_received: u64,
}

impl WsTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }
}

impl fmt::Display for WsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "WsTransport(connected={}, messages={}, bytes={})",
            self.is_connected(),
            self.messages_received,
            self.bytes_received
        )
    }
}

#[async_trait]
impl FrameTransport for WsTransport {
    async fn connect(&mut self, endpoint: &str) -> Result<(), StreamError> {
        self.close().await;

        let (stream, response) = connect_async(endpoint).await.map_err(classify_error)?;
        info!(endpoint = endpoint, status = %response.status(), "WebSocket connected");
        self.stream = Some(stream);
        Ok(())
    }

    async fn send(&mut self, text: String) -> Result<(), StreamError> {
        let stream = self.stream.as_mut().ok_or(StreamError::ConnectionClosed)?;
        stream.send(Message::Text(text)).await.map_err(classify_error)
    }

    async fn recv(&mut self) -> Result<Option<String>, StreamError> {
        let stream = self.stream.as_mut().ok_or(StreamError::ConnectionClosed)?;

        loop {
            let message = match stream.next().await {
                None => return Ok(None),
                Some(Err(e)) => return Err(classify_error(e)),
                Some(Ok(message)) => message,
            };

            match message {
                Message::Text(text) => {
                    self.messages_received += 1;
                    self.bytes_received += text.len() as u64;
                    return Ok(Some(text));
                }
                Message::Binary(data) => {
                    self.messages_received += 1;
                    self.bytes_received += data.len() as u64;
                    return Ok(Some(String::from_utf8_lossy(&data).into_owned()));
                }
                Message::Ping(data) => {
                    debug!("Received ping, sending pong");
                    stream.send(Message::Pong(data)).await.map_err(classify_error)?;
                }
                Message::Pong(_) | Message::Frame(_) => {}
                Message::Close(frame) => {
                    warn!(frame = ?frame, "WebSocket closed by server");
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.close(None).await {
                debug!(error = %e, "WebSocket close handshake failed");
            }
        }
    }
}

/// 401/403 and malformed URLs are fatal; everything else is retried
fn classify_error(err: tungstenite::Error) -> StreamError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status().as_u16();
            if status == 401 || status == 403 {
                StreamError::FatalAuth(format!("HTTP {}", status))
            } else {
                StreamError::Transport(format!("HTTP {}", status))
            }
        }
        tungstenite::Error::Url(e) => StreamError::InvalidEndpoint(e.to_string()),
        tungstenite::Error::HttpFormat(e) => StreamError::InvalidEndpoint(e.to_string()),
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            StreamError::ConnectionClosed
        }
        other => StreamError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credentials() -> Credentials {
        Credentials {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            passphrase: "pass".to_string(),
        }
    }

    #[test]
    fn test_subscribe_message() {
        let msg: serde_json::Value = serde_json::from_str(&subscribe_message("books", "BTC-USDT-SWAP")).unwrap();
        assert_eq!(msg["op"], "subscribe");
        assert_eq!(msg["args"][0]["channel"], "books");
        assert_eq!(msg["args"][0]["instId"], "BTC-USDT-SWAP");
    }

    #[test]
    fn test_login_message_signature() {
        let msg: serde_json::Value =
            serde_json::from_str(&login_message(&credentials(), 1_700_000_000).unwrap()).unwrap();
        let args = &msg["args"][0];
        assert_eq!(msg["op"], "login");
        assert_eq!(args["apiKey"], "key");
        assert_eq!(args["timestamp"], "1700000000");

        assert_eq!(args["sign"], "lhmJXK08fk9SI1ZwFXKFRrPtzfbNOwC+D1xMJJ/1KZg=");
    }

    #[test]
    fn test_sign_is_deterministic() {
        assert_eq!(sign("k", "payload").unwrap(), sign("k", "payload").unwrap());
        assert_ne!(sign("k", "payload").unwrap(), sign("k2", "payload").unwrap());
    }

    #[test]
    fn test_transport_starts_disconnected() {
        let transport = WsTransport::new();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_endpoint_is_fatal() {
        let mut transport = WsTransport::new();
        let err = transport.connect("not a url").await.unwrap_err();
        assert!(err.is_fatal(), "{:?}", err);
    }

    #[tokio::test]
    async fn test_recv_without_connect() {
        let mut transport = WsTransport::new();
        assert_eq!(transport.recv().await.unwrap_err(), StreamError::ConnectionClosed);
    }
}
