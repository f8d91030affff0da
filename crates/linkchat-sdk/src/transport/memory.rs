//! 进程内传输
//!
//! 客户端与服务端之间通过 channel 传递 JSON 文本，和 WebSocket 走同一套编解码，
//! 用于在不依赖网络的情况下驱动完整的通道逻辑（应用层集成测试同样可用）。

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot};

use super::{Frame, FrameSink, FrameStream, Link, OpenRequest, Transport};
use crate::error::{LinkchatSDKError, Result};

/// 客户端侧：实现 [`Transport`]
#[derive(Debug, Clone)]
pub struct MemoryTransport {
    connector: mpsc::UnboundedSender<PendingConnection>,
}

/// 服务端侧：接收新连接
#[derive(Debug)]
pub struct MemoryListener {
    incoming: mpsc::UnboundedReceiver<PendingConnection>,
}

pub fn memory_transport() -> (MemoryTransport, MemoryListener) {
    let (connector, incoming) = mpsc::unbounded_channel();
    (MemoryTransport { connector }, MemoryListener { incoming })
}

impl MemoryListener {
    /// 等待下一个连接请求；所有 [`MemoryTransport`] 都被释放后返回 None
    pub async fn accept(&mut self) -> Option<PendingConnection> {
        self.incoming.recv().await
    }
}

/// 尚未决定接受或拒绝的连接
#[derive(Debug)]
pub struct PendingConnection {
    pub request: OpenRequest,
    decision: oneshot::Sender<Result<()>>,
    connection: ServerConnection,
}

impl PendingConnection {
    pub fn accept(self) -> ServerConnection {
        let _ = self.decision.send(Ok(()));
        self.connection
    }

    /// 拒绝握手，客户端的 `open` 返回该错误
    pub fn reject(self, error: LinkchatSDKError) {
        let _ = self.decision.send(Err(error));
    }
}

/// 服务端持有的一条连接
#[derive(Debug)]
pub struct ServerConnection {
    pub user_id: String,
    from_client: mpsc::UnboundedReceiver<String>,
    to_client: mpsc::UnboundedSender<String>,
}

impl ServerConnection {
    /// 下一个客户端帧；客户端关闭后返回 None
    pub async fn recv(&mut self) -> Option<Result<Frame>> {
        let text = self.from_client.recv().await?;
        Some(Frame::decode(&text).map_err(Into::into))
    }

    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.send_raw(frame.encode()?)
    }

    /// 直接发送原始文本（可以构造无法解析的帧）
    pub fn send_raw(&self, text: String) -> Result<()> {
        self.to_client
            .send(text)
            .map_err(|_| LinkchatSDKError::Network("客户端已断开".to_string()))
    }

    pub fn sender(&self) -> ServerSender {
        ServerSender {
            to_client: self.to_client.clone(),
        }
    }
}

/// 可克隆的服务端发送端，用于在连接之外推送广播
#[derive(Debug, Clone)]
pub struct ServerSender {
    to_client: mpsc::UnboundedSender<String>,
}

impl ServerSender {
    pub fn send(&self, frame: &Frame) -> Result<()> {
        self.send_raw(frame.encode()?)
    }

    pub fn send_raw(&self, text: String) -> Result<()> {
        self.to_client
            .send(text)
            .map_err(|_| LinkchatSDKError::Network("客户端已断开".to_string()))
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn open(&self, request: &OpenRequest) -> Result<Link> {
        let (client_tx, from_client) = mpsc::unbounded_channel();
        let (to_client, client_rx) = mpsc::unbounded_channel();
        let (decision, decided) = oneshot::channel();

        let pending = PendingConnection {
            request: request.clone(),
            decision,
            connection: ServerConnection {
                user_id: request.user_id.clone(),
                from_client,
                to_client,
            },
        };
        self.connector
            .send(pending)
            .map_err(|_| LinkchatSDKError::Network("服务端不可达".to_string()))?;

        tokio::time::timeout(request.timeout, decided)
            .await
            .map_err(|_| LinkchatSDKError::Network("连接超时".to_string()))?
            .map_err(|_| LinkchatSDKError::Network("服务端不可达".to_string()))??;

        Ok(Link {
            sink: Box::new(MemorySink {
                tx: Some(client_tx),
            }),
            stream: Box::new(MemoryStream { rx: client_rx }),
        })
    }
}

struct MemorySink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

#[async_trait]
impl FrameSink for MemorySink {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let text = frame.encode()?;
        match &self.tx {
            Some(tx) => tx
                .send(text)
                .map_err(|_| LinkchatSDKError::Network("连接已断开".to_string())),
            None => Err(LinkchatSDKError::Network("连接已关闭".to_string())),
        }
    }

    async fn close(&mut self) -> Result<()> {
        self.tx = None;
        Ok(())
    }
}

struct MemoryStream {
    rx: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
impl FrameStream for MemoryStream {
    async fn next(&mut self) -> Option<Result<Frame>> {
        let text = self.rx.recv().await?;
        Some(Frame::decode(&text).map_err(Into::into))
    }
}
