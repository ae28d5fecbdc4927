use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::Arc;

use bytes::Bytes;
use socket2::SockRef;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::context::{IoContext, SessionId};
use crate::error::{RECEIVE, ReactorError, SEND, map_io_error};
use crate::gate::AdmissionPermit;
use crate::handler::ReceiveHandler;
use crate::pool::ResourcePool;
use crate::signal::ShutdownSignal;
use crate::tracker::ConnectionGuard;

/// 会话状态。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    /// 等待对端数据。
    Receiving,
    /// 调用处理器生成响应。
    Handling,
    /// 回写响应。
    Sending,
    /// 正在回收资源。
    Closing,
    /// 终态。
    Closed,
}

/// 会话进入 `Closing` 的原因。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端关闭（接收到 0 字节）。
    PeerClosed,
    /// 接收失败。
    ReceiveFailed,
    /// 发送失败。
    SendFailed,
    /// 响应超过缓冲容量，未发送任何字节。
    ProtocolOverflow,
    /// 在收发前观察到关闭信号，已半关闭写方向。
    Shutdown,
    /// 资源池释放触发的强制关闭。
    Forced,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer_closed",
            CloseReason::ReceiveFailed => "receive_failed",
            CloseReason::SendFailed => "send_failed",
            CloseReason::ProtocolOverflow => "protocol_overflow",
            CloseReason::Shutdown => "shutdown",
            CloseReason::Forced => "forced",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 会话关闭后的摘要。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionReport {
    pub id: SessionId,
    pub peer: SocketAddr,
    pub reason: CloseReason,
    /// 完整完成的“收-处理-发”轮次。
    pub exchanges: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    /// 导致关闭的错误码（若有）。
    pub error_code: Option<&'static str>,
}

/// 会话构造所需的全部资源，由监听器在 accept 成功后组装。
pub(crate) struct SessionParts {
    pub id: SessionId,
    pub stream: TcpStream,
    pub peer: SocketAddr,
    pub receive: IoContext,
    pub send: IoContext,
    pub receive_pool: ResourcePool,
    pub send_pool: ResourcePool,
    pub handler: Arc<dyn ReceiveHandler>,
    pub shutdown: ShutdownSignal,
    pub force: ShutdownSignal,
    pub permit: AdmissionPermit,
    pub guard: ConnectionGuard,
}

/// 单个连接的显式状态机。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 把“收-处理-发”循环表达为可检查的状态值，而不是散落在回调里的隐式流程；
/// - 让连接级失败只影响本连接：任何错误都只会把本会话推向 `Closing`，不会向监听器传播。
///
/// ## 逻辑 (How)
/// - `run` 反复调用 `step` 推进状态，直到进入 `Closing`，随后由 `close` 消费自身完成回收；
/// - 收/发前检查共享关闭信号：已触发则只关闭写方向并进入 `Closing`；
/// - 进行中的收/发与会话私有的强制关闭信号竞争，后者由资源池释放时触发，立即中断 IO；
///   资源池释放同时直接关闭套接字，处理器卡住的会话也会在其返回后走到 `Closing`。
///
/// ## 契约 (What)
/// - **独占**：会话独占一个接收上下文与一个发送上下文，关闭时二者各归还一次；
/// - **拷贝语义**：交给处理器的帧是接收缓冲中有效字节的独立拷贝，池化缓冲不外泄；
/// - **恰好一次**：活跃计数递减与准入名额归还都只发生在 `close` 中，且各一次。
///
/// ## 注意事项 (Trade-offs)
/// - 处理器同步执行，耗时处理会延迟本连接的下一次接收；
/// - 一次接收完成即视为一个逻辑单元，不做分帧。
pub struct ConnectionSession {
    id: SessionId,
    peer: SocketAddr,
    stream: TcpStream,
    state: SessionState,
    receive: IoContext,
    send: IoContext,
    receive_pool: ResourcePool,
    send_pool: ResourcePool,
    handler: Arc<dyn ReceiveHandler>,
    shutdown: ShutdownSignal,
    force: ShutdownSignal,
    permit: AdmissionPermit,
    guard: ConnectionGuard,
    frame: Bytes,
    reason: Option<CloseReason>,
    error_code: Option<&'static str>,
    exchanges: u64,
    bytes_received: u64,
    bytes_sent: u64,
}

enum IoOutcome<T> {
    Done(std::io::Result<T>),
    Forced,
}

impl ConnectionSession {
    pub(crate) fn new(parts: SessionParts) -> Self {
        Self {
            id: parts.id,
            peer: parts.peer,
            stream: parts.stream,
            state: SessionState::Receiving,
            receive: parts.receive,
            send: parts.send,
            receive_pool: parts.receive_pool,
            send_pool: parts.send_pool,
            handler: parts.handler,
            shutdown: parts.shutdown,
            force: parts.force,
            permit: parts.permit,
            guard: parts.guard,
            frame: Bytes::new(),
            reason: None,
            error_code: None,
            exchanges: 0,
            bytes_received: 0,
            bytes_sent: 0,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// 驱动会话直至关闭，返回关闭摘要。
    pub async fn run(mut self) -> SessionReport {
        tracing::debug!(session = %self.id, peer = %self.peer, "session started");
        while self.state != SessionState::Closing {
            let next = self.step().await;
            tracing::trace!(session = %self.id, from = ?self.state, to = ?next, "session transition");
            self.state = next;
        }
        self.close()
    }

    async fn step(&mut self) -> SessionState {
        match self.state {
            SessionState::Receiving => self.receive().await,
            SessionState::Handling => self.handle(),
            SessionState::Sending => self.send().await,
            SessionState::Closing | SessionState::Closed => SessionState::Closing,
        }
    }

    async fn receive(&mut self) -> SessionState {
        if self.shutdown.is_triggered() {
            return self.half_close().await;
        }

        let buffer = self.receive.prepare_receive();
        let outcome = tokio::select! {
            biased;
            _ = self.force.triggered() => IoOutcome::Forced,
            result = self.stream.read_buf(buffer) => IoOutcome::Done(result),
        };

        match outcome {
            IoOutcome::Forced => self.begin_close(CloseReason::Forced, None),
            IoOutcome::Done(Ok(0)) => self.begin_close(CloseReason::PeerClosed, None),
            IoOutcome::Done(Ok(read)) => {
                self.bytes_received += read as u64;
                self.frame = self.receive.copy_frame();
                SessionState::Handling
            }
            IoOutcome::Done(Err(error)) => {
                let error = map_io_error(RECEIVE, error);
                tracing::debug!(session = %self.id, peer = %self.peer, error = %error, "receive failed");
                self.begin_close(CloseReason::ReceiveFailed, Some(&error))
            }
        }
    }

    fn handle(&mut self) -> SessionState {
        let frame = std::mem::take(&mut self.frame);
        let response = self.handler.handle(frame);
        match self.send.load(&response) {
            Ok(()) => SessionState::Sending,
            Err(error) => {
                tracing::warn!(
                    session = %self.id,
                    peer = %self.peer,
                    code = error.code(),
                    error = %error,
                    "handler response exceeds buffer, closing connection"
                );
                self.begin_close(CloseReason::ProtocolOverflow, Some(&error))
            }
        }
    }

    async fn send(&mut self) -> SessionState {
        if self.shutdown.is_triggered() {
            return self.half_close().await;
        }

        let payload = self.send.filled();
        let outcome = tokio::select! {
            biased;
            _ = self.force.triggered() => IoOutcome::Forced,
            result = self.stream.write_all(payload) => IoOutcome::Done(result),
        };

        match outcome {
            IoOutcome::Forced => self.begin_close(CloseReason::Forced, None),
            IoOutcome::Done(Ok(())) => {
                self.bytes_sent += self.send.filled().len() as u64;
                self.exchanges += 1;
                SessionState::Receiving
            }
            IoOutcome::Done(Err(error)) => {
                let error = map_io_error(SEND, error);
                tracing::debug!(session = %self.id, peer = %self.peer, error = %error, "send failed");
                self.begin_close(CloseReason::SendFailed, Some(&error))
            }
        }
    }

    async fn half_close(&mut self) -> SessionState {
        if let Err(error) = self.stream.shutdown().await {
            tracing::trace!(session = %self.id, error = %error, "outbound shutdown failed");
        }
        self.begin_close(CloseReason::Shutdown, None)
    }

    fn begin_close(&mut self, reason: CloseReason, error: Option<&ReactorError>) -> SessionState {
        self.reason = Some(reason);
        self.error_code = error.map(ReactorError::code);
        SessionState::Closing
    }

    /// 回收全部资源并进入终态。
    ///
    /// 顺序：关闭套接字两个方向并释放 → 归还接收/发送上下文 → 活跃计数减一 → 归还准入名额。
    fn close(self) -> SessionReport {
        let Self {
            id,
            peer,
            stream,
            receive,
            send,
            receive_pool,
            send_pool,
            permit,
            guard,
            reason,
            error_code,
            exchanges,
            bytes_received,
            bytes_sent,
            ..
        } = self;

        if let Err(error) = SockRef::from(&stream).shutdown(Shutdown::Both) {
            tracing::trace!(session = %id, error = %error, "socket shutdown failed");
        }
        drop(stream);

        for (pool, ctx) in [(&receive_pool, receive), (&send_pool, send)] {
            if let Err(error) = pool.push(ctx) {
                tracing::debug!(session = %id, error = %error, "context dropped on retired pool");
            }
        }

        drop(guard);
        permit.release();

        let reason = reason.unwrap_or(CloseReason::Shutdown);
        tracing::debug!(
            session = %id,
            peer = %peer,
            reason = %reason,
            exchanges,
            bytes_received,
            bytes_sent,
            state = ?SessionState::Closed,
            "session closed"
        );
        SessionReport {
            id,
            peer,
            reason,
            exchanges,
            bytes_received,
            bytes_sent,
            error_code,
        }
    }
}

impl fmt::Debug for ConnectionSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSession")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish()
    }
}
