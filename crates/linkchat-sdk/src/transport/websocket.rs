//! 基于 tokio-tungstenite 的 WebSocket 传输
//!
//! token 与 user_id 放在握手请求头里；服务端以 401/403 拒绝握手时视为认证失败。

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use super::{Frame, FrameSink, FrameStream, Link, OpenRequest, Transport};
use crate::error::{LinkchatSDKError, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const USER_ID_HEADER: &str = "x-user-id";

#[derive(Debug, Default, Clone)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|e| LinkchatSDKError::InvalidArgument(format!("非法的请求头取值: {}", e)))
}

fn map_handshake_error(error: WsError) -> LinkchatSDKError {
    match error {
        WsError::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            LinkchatSDKError::Auth(format!("握手被拒绝: {}", response.status()))
        }
        WsError::Http(response) => {
            LinkchatSDKError::Network(format!("握手失败: {}", response.status()))
        }
        WsError::Url(e) => LinkchatSDKError::Config(format!("服务端地址无效: {}", e)),
        other => LinkchatSDKError::Network(other.to_string()),
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: &OpenRequest) -> Result<Link> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| LinkchatSDKError::Config(format!("服务端地址无效: {}", e)))?;
        let headers = ws_request.headers_mut();
        headers.insert(
            "authorization",
            header_value(&format!("Bearer {}", request.token))?,
        );
        headers.insert(USER_ID_HEADER, header_value(&request.user_id)?);

        debug!("[WebSocket] 正在连接: {}", request.url);
        let (ws, response) = tokio::time::timeout(request.timeout, connect_async(ws_request))
            .await
            .map_err(|_| LinkchatSDKError::Network(format!("连接超时: {}", request.url)))?
            .map_err(map_handshake_error)?;
        debug!("[WebSocket] 握手完成: status={}", response.status());

        let (sink, stream) = ws.split();
        Ok(Link {
            sink: Box::new(WsSink { inner: sink }),
            stream: Box::new(WsFrameStream { inner: stream }),
        })
    }
}

struct WsSink {
    inner: SplitSink<WsStream, Message>,
}

#[async_trait]
impl FrameSink for WsSink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let text = frame.encode()?;
        self.inner
            .send(Message::Text(text.into()))
            .await
            .map_err(|e| LinkchatSDKError::Network(format!("发送失败: {}", e)))
    }

    async fn close(&mut self) -> Result<()> {
        self.inner
            .close()
            .await
            .map_err(|e| LinkchatSDKError::Network(format!("关闭连接失败: {}", e)))
    }
}

struct WsFrameStream {
    inner: SplitStream<WsStream>,
}

#[async_trait]
impl FrameStream for WsFrameStream {
    async fn next(&mut self) -> Option<Result<Frame>> {
        loop {
            let message = match self.inner.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(LinkchatSDKError::Network(e.to_string()))),
            };
            match message {
                Message::Text(text) => {
                    return Some(Frame::decode(text.as_str()).map_err(Into::into));
                }
                Message::Binary(data) => {
                    let decoded = std::str::from_utf8(&data)
                        .map_err(|e| LinkchatSDKError::Protocol(format!("二进制帧不是 UTF-8: {}", e)))
                        .and_then(|text| Frame::decode(text).map_err(Into::into));
                    return Some(decoded);
                }
                Message::Close(reason) => {
                    debug!("[WebSocket] 服务端关闭连接: {:?}", reason);
                    return None;
                }
                // ping/pong 由 tungstenite 自动处理
                Message::Ping(_) | Message::Pong(_) => continue,
                Message::Frame(_) => {
                    warn!("[WebSocket] 收到原始帧，忽略");
                    continue;
                }
            }
        }
    }
}
