//! Native WebSocket transport using tokio-tungstenite.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use mission_control_shared::{ConnectionError, ABNORMAL_CLOSE_CODE};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

use super::transport::{Frame, Socket, Transport};

const PROTOCOL_HEADER: &str = "Sec-WebSocket-Protocol";
/// Close code tungstenite reports when the close frame had no status.
const NO_STATUS_CODE: u16 = 1005;

#[derive(Debug, Clone, Copy, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl Transport for TungsteniteTransport {
    async fn connect(
        &self,
        url: &Url,
        protocol: Option<&str>,
    ) -> Result<Box<dyn Socket>, ConnectionError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        if let Some(protocol) = protocol {
            let value = HeaderValue::from_str(protocol)
                .map_err(|e| ConnectionError::Handshake(format!("bad subprotocol: {e}")))?;
            request.headers_mut().insert(PROTOCOL_HEADER, value);
        }

        let (stream, response) = connect_async(request)
            .await
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
        let protocol = response
            .headers()
            .get(PROTOCOL_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        crate::log_debug!("WebSocket handshake with {} complete", url);
        Ok(Box::new(TungsteniteSocket { stream, protocol }))
    }
}

struct TungsteniteSocket {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    protocol: Option<String>,
}

#[async_trait]
impl Socket for TungsteniteSocket {
    async fn send(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let message = match frame {
            Frame::Text(text) => Message::Text(text.into()),
            Frame::Binary(data) => Message::Binary(data.into()),
            Frame::Ping(data) => Message::Ping(data.into()),
            Frame::Pong(data) => Message::Pong(data.into()),
            Frame::Close { code, reason } => Message::Close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.into(),
            })),
        };
        self.stream
            .send(message)
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    async fn recv(&mut self) -> Option<Result<Frame, ConnectionError>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => {
                    return Some(Err(ConnectionError::Closed {
                        code: ABNORMAL_CLOSE_CODE,
                        reason: e.to_string(),
                    }))
                }
            };
            let frame = match message {
                Message::Text(text) => Frame::Text(text.to_string()),
                Message::Binary(data) => Frame::Binary(data.to_vec()),
                Message::Ping(data) => Frame::Ping(data.to_vec()),
                Message::Pong(data) => Frame::Pong(data.to_vec()),
                Message::Close(close) => match close {
                    Some(close) => Frame::Close {
                        code: u16::from(close.code),
                        reason: close.reason.to_string(),
                    },
                    None => Frame::Close {
                        code: NO_STATUS_CODE,
                        reason: String::new(),
                    },
                },
                // Raw frames only show up when writing, never when reading.
                Message::Frame(_) => continue,
            };
            return Some(Ok(frame));
        }
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), ConnectionError> {
        self.stream
            .close(Some(CloseFrame {
                code: CloseCode::from(code),
                reason: reason.to_string().into(),
            }))
            .await
            .map_err(|e| ConnectionError::Send(e.to_string()))
    }

    fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }
}
