//! Realtime socket transport
//!
//! The channel driver talks to the socket only through these traits, which
//! carry JSON text frames. The production implementation is a
//! `tokio-tungstenite` websocket.

use crate::error::RealtimeError;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use irp_common::config::RealtimeSettings;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, trace};

/// One open socket
#[async_trait]
pub trait RealtimeTransport: Send {
    async fn send(&mut self, frame: String) -> Result<(), RealtimeError>;

    /// Next inbound text frame; `None` once the peer closed the socket
    async fn recv(&mut self) -> Option<Result<String, RealtimeError>>;

    async fn close(&mut self);
}

/// Opens sockets; called again for every reconnect
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn RealtimeTransport>, RealtimeError>;
}

/// Websocket URL for a project URL and API key
///
/// `https://x.example` becomes `wss://x.example/realtime/v1/websocket?apikey=<key>`.
pub fn websocket_url(project_url: &str, api_key: &str) -> Result<String, RealtimeError> {
    let mut url = url::Url::parse(project_url)
        .map_err(|e| RealtimeError::Config(format!("invalid realtime url {}: {}", project_url, e)))?;

    let scheme = match url.scheme() {
        "https" | "wss" => "wss",
        "http" | "ws" => "ws",
        other => {
            return Err(RealtimeError::Config(format!(
                "unsupported realtime url scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| RealtimeError::Config(format!("cannot use scheme {}", scheme)))?;
    url.set_path("/realtime/v1/websocket");
    url.set_query(None);
    url.query_pairs_mut().append_pair("apikey", api_key);
    Ok(url.to_string())
}

/// Connector for a websocket URL
#[derive(Debug, Clone)]
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    /// Connector built from `[realtime]` settings; both url and key are required
    pub fn from_settings(settings: &RealtimeSettings) -> Result<Self, RealtimeError> {
        let project_url = settings
            .url
            .as_deref()
            .ok_or_else(|| RealtimeError::Config("realtime.url is not set".to_string()))?;
        let api_key = settings
            .api_key
            .as_deref()
            .ok_or_else(|| RealtimeError::Config("realtime.api_key is not set".to_string()))?;
        Ok(Self::new(websocket_url(project_url, api_key)?))
    }
}

#[async_trait]
impl RealtimeConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn RealtimeTransport>, RealtimeError> {
        let (stream, response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RealtimeError::Connect(e.to_string()))?;
        debug!(status = %response.status(), "Realtime websocket open");
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl RealtimeTransport for WsTransport {
    async fn send(&mut self, frame: String) -> Result<(), RealtimeError> {
        self.stream
            .send(Message::Text(frame))
            .await
            .map_err(|e| RealtimeError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<String, RealtimeError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(RealtimeError::Receive(e.to_string()))),
            };

            match message {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => trace!("Ignoring non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    debug!(?frame, "Realtime websocket closed by peer");
                    return None;
                }
                // Pongs are queued by tungstenite itself
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_websocket_url_from_https() {
        assert_eq!(
            websocket_url("https://abc.supabase.co", "anon").unwrap(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon"
        );
    }

    #[test]
    fn test_websocket_url_from_http_with_port() {
        assert_eq!(
            websocket_url("http://localhost:54321/", "k").unwrap(),
            "ws://localhost:54321/realtime/v1/websocket?apikey=k"
        );
    }

    #[test]
    fn test_websocket_url_rejects_other_schemes() {
        assert!(websocket_url("ftp://example.com", "k").is_err());
        assert!(websocket_url("not a url", "k").is_err());
    }

    #[test]
    fn test_from_settings_requires_url_and_key() {
        let mut settings = RealtimeSettings::default();
        assert!(WsConnector::from_settings(&settings).is_err());
        settings.url = Some("https://abc.supabase.co".into());
        assert!(WsConnector::from_settings(&settings).is_err());
        settings.api_key = Some("anon".into());
        assert!(WsConnector::from_settings(&settings).is_ok());
    }
}
