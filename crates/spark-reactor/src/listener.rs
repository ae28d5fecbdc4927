use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;

use crate::config::ListenerConfig;
use crate::context::{IoContext, PoolRole, SessionId, SocketBinding};
use crate::error::{
    ACCEPT, AcceptFailure, BIND, LISTEN, ReactorError, classify_accept_error, map_io_error,
};
use crate::gate::{AdmissionGate, AdmissionPermit};
use crate::handler::ReceiveHandler;
use crate::pool::{DisposeSummary, PoolStats, ResourcePool};
use crate::session::{ConnectionSession, SessionParts};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::signal::{ForceCloser, ShutdownSignal};
use crate::tracker::ActiveConnections;

/// 反应器持有的三个独立资源池。
#[derive(Clone, Debug)]
pub(crate) struct ReactorPools {
    pub accept: ResourcePool,
    pub receive: ResourcePool,
    pub send: ResourcePool,
}

impl ReactorPools {
    fn from_config(config: &ListenerConfig) -> Self {
        Self {
            accept: ResourcePool::fixed(PoolRole::Accept, config.max_simultaneous_accept_ops(), 0),
            receive: ResourcePool::growable(
                PoolRole::Receive,
                config.receive_pool_capacity(),
                config.buffer_size(),
            ),
            send: ResourcePool::growable(
                PoolRole::Send,
                config.send_pool_capacity(),
                config.buffer_size(),
            ),
        }
    }

    pub(crate) fn dispose_all(&self) -> PoolsDisposal {
        PoolsDisposal {
            accept: self.accept.dispose_all(),
            receive: self.receive.dispose_all(),
            send: self.send.dispose_all(),
        }
    }

    fn stats(&self) -> ReactorStats {
        ReactorStats {
            accept: self.accept.stats(),
            receive: self.receive.stats(),
            send: self.send.stats(),
        }
    }
}

/// 三个资源池的释放结果。
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct PoolsDisposal {
    pub accept: DisposeSummary,
    pub receive: DisposeSummary,
    pub send: DisposeSummary,
}

impl PoolsDisposal {
    /// 被强制关闭的会话数。
    ///
    /// 接收与发送上下文登记的是同一会话的同一信号，取两者较大值，避免重复计数。
    pub(crate) fn force_closed_sessions(&self) -> usize {
        self.receive.force_closed.max(self.send.force_closed)
    }

    /// 三个池释放的空闲上下文总数。
    pub(crate) fn released_idle(&self) -> usize {
        self.accept.released_idle + self.receive.released_idle + self.send.released_idle
    }
}

/// 三个资源池的统计快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReactorStats {
    pub accept: PoolStats,
    pub receive: PoolStats,
    pub send: PoolStats,
}

/// 已绑定但尚未开始接入的监听器。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将“创建套接字 → 绑定 → 监听”与“启动 accept 循环”拆成两个阶段：
///   启动错误（端口占用、权限不足）在 [`bind`](Self::bind) 中同步返回，
///   调用方可以在任何连接被接入之前决定是否退出；
/// - 绑定阶段不依赖异步运行时，便于在 `main` 中先完成配置校验再进入运行时。
///
/// ## 逻辑 (How)
/// - 通过 `socket2` 构造套接字，开启 `SO_REUSEADDR` 后绑定并以配置的 backlog 监听；
/// - 设置非阻塞后转换为标准库监听器，`start` 时再交给 Tokio 注册到反应器。
///
/// ## 契约 (What)
/// - **前置条件**：`start` 必须在 Tokio 运行时上下文中调用；
/// - **后置条件**：`start` 返回的 [`ListenerHandle`] 拥有三个资源池与准入闸门，
///   直至关闭流程结束。
pub struct Listener {
    config: ListenerConfig,
    socket: std::net::TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn ReceiveHandler>,
    signal: ShutdownSignal,
}

impl Listener {
    /// 创建、绑定并监听套接字。
    pub fn bind(
        config: ListenerConfig,
        handler: impl ReceiveHandler,
        signal: ShutdownSignal,
    ) -> Result<Self, ReactorError> {
        Self::bind_shared(config, Arc::new(handler), signal)
    }

    /// 与 [`bind`](Self::bind) 相同，但接受已共享的处理器。
    pub fn bind_shared(
        config: ListenerConfig,
        handler: Arc<dyn ReceiveHandler>,
        signal: ShutdownSignal,
    ) -> Result<Self, ReactorError> {
        let endpoint = config.endpoint();
        let socket = Socket::new(Domain::for_address(endpoint), Type::STREAM, Some(Protocol::TCP))
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .set_reuse_address(true)
            .map_err(|err| map_io_error(BIND, err))?;
        socket
            .bind(&endpoint.into())
            .map_err(|err| map_io_error(BIND, err))?;
        // backlog 已在配置校验中限制在 i32 范围内。
        let backlog = i32::try_from(config.backlog()).unwrap_or(i32::MAX);
        socket
            .listen(backlog)
            .map_err(|err| map_io_error(LISTEN, err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| map_io_error(LISTEN, err))?;

        let socket: std::net::TcpListener = socket.into();
        let local_addr = socket.local_addr().map_err(|err| map_io_error(BIND, err))?;
        tracing::info!(
            endpoint = %local_addr,
            backlog,
            max_connections = config.max_connections(),
            accept_ops = config.max_simultaneous_accept_ops(),
            buffer_size = config.buffer_size(),
            "listener bound"
        );

        Ok(Self {
            config,
            socket,
            local_addr,
            handler,
            signal,
        })
    }

    /// 实际绑定的本地地址。
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    /// 启动 accept 工作者并返回运行句柄。
    pub fn start(self) -> Result<ListenerHandle, ReactorError> {
        let listener = TcpListener::from_std(self.socket).map_err(|err| map_io_error(LISTEN, err))?;
        let listener = Arc::new(listener);

        let pools = ReactorPools::from_config(&self.config);
        let connections = ActiveConnections::new();
        let acceptors = ActiveConnections::new();
        let shared = Arc::new(AcceptShared {
            pools: pools.clone(),
            gate: AdmissionGate::new(self.config.max_connections()),
            connections: connections.clone(),
            handler: self.handler,
            signal: self.signal.clone(),
            halt: ShutdownSignal::new(),
            next_session: AtomicU64::new(1),
        });

        let mut workers = JoinSet::new();
        for worker in 0..self.config.max_simultaneous_accept_ops() {
            let shared = Arc::clone(&shared);
            let listener = Arc::clone(&listener);
            let guard = acceptors.enter();
            workers.spawn(async move {
                let _guard = guard;
                accept_loop(worker, shared, listener).await
            });
        }
        // 监听套接字只由工作者持有，最后一个工作者退出时关闭。
        drop(listener);

        tracing::info!(
            endpoint = %self.local_addr,
            workers = self.config.max_simultaneous_accept_ops(),
            "listener started"
        );

        let coordinator =
            ShutdownCoordinator::new(self.signal, acceptors, connections, pools);
        Ok(ListenerHandle {
            local_addr: self.local_addr,
            shared,
            coordinator,
            workers,
        })
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .finish()
    }
}

/// 运行中的监听器句柄。
///
/// 句柄持有全部 accept 工作者，被丢弃时工作者随之中止；已派发的会话不受影响。
#[derive(Debug)]
pub struct ListenerHandle {
    local_addr: SocketAddr,
    shared: Arc<AcceptShared>,
    coordinator: ShutdownCoordinator,
    workers: JoinSet<Result<(), ReactorError>>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// 当前活跃连接数。
    pub fn active_connections(&self) -> usize {
        self.shared.connections.active()
    }

    /// 当前剩余的准入名额。
    pub fn available_admissions(&self) -> usize {
        self.shared.gate.available()
    }

    /// 三个资源池的统计快照。
    pub fn stats(&self) -> ReactorStats {
        self.shared.pools.stats()
    }

    /// 返回可跨任务共享的关闭协调器。
    pub fn coordinator(&self) -> ShutdownCoordinator {
        self.coordinator.clone()
    }

    /// 执行有界关闭，等价于 `self.coordinator().shutdown(timeout)`。
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.coordinator.shutdown(timeout).await
    }

    /// 等待全部 accept 工作者退出。
    ///
    /// 关闭流程中的退出返回 `Ok(())`；非关闭阶段监听套接字失效或出现不可恢复错误时，
    /// 其余工作者随之停止，并返回首个错误。
    pub async fn join(mut self) -> Result<(), ReactorError> {
        let mut first_error = None;
        while let Some(joined) = self.workers.join_next().await {
            let outcome = joined.map_err(ReactorError::AcceptLoop).and_then(|result| result);
            if let Err(error) = outcome {
                self.shared.halt.trigger();
                first_error.get_or_insert(error);
            }
        }
        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// accept 工作者之间共享的状态。
struct AcceptShared {
    pools: ReactorPools,
    gate: AdmissionGate,
    connections: ActiveConnections,
    handler: Arc<dyn ReceiveHandler>,
    signal: ShutdownSignal,
    /// 某个工作者遇到不可恢复错误时用于停止其余工作者。
    halt: ShutdownSignal,
    next_session: AtomicU64,
}

impl std::fmt::Debug for AcceptShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AcceptShared")
            .field("gate", &self.gate)
            .field("active", &self.connections.active())
            .finish()
    }
}

enum AcceptStep {
    Accepted(std::io::Result<(TcpStream, SocketAddr)>),
    Stop,
}

/// 单个 accept 工作者的主循环。
///
/// 每轮：占用一个准入名额 → 取出 accept 上下文 → 等待 accept。
/// 暂时性失败回收上下文并释放名额后退避重试；成功则组装会话并派发到独立任务。
async fn accept_loop(
    worker: usize,
    shared: Arc<AcceptShared>,
    listener: Arc<TcpListener>,
) -> Result<(), ReactorError> {
    loop {
        let permit = tokio::select! {
            biased;
            _ = shared.halt.triggered() => return Ok(()),
            permit = shared.gate.acquire(&shared.signal) => match permit {
                Ok(permit) => permit,
                Err(_) => return Ok(()),
            },
        };

        // 每个工作者恰好对应一个预热的 accept 上下文，池只会在退役后拒绝。
        let accept_ctx = match shared.pools.accept.pop() {
            Ok(Some(ctx)) => ctx,
            Ok(None) | Err(_) => {
                tracing::debug!(worker, "accept pool unavailable, worker exiting");
                return Ok(());
            }
        };

        let step = tokio::select! {
            biased;
            _ = shared.signal.triggered() => AcceptStep::Stop,
            _ = shared.halt.triggered() => AcceptStep::Stop,
            accepted = listener.accept() => AcceptStep::Accepted(accepted),
        };

        if let Err(error) = shared.pools.accept.push(accept_ctx) {
            tracing::trace!(worker, error = %error, "accept context dropped on retired pool");
        }

        match step {
            AcceptStep::Stop => return Ok(()),
            AcceptStep::Accepted(Ok((stream, peer))) => shared.dispatch(stream, peer, permit),
            AcceptStep::Accepted(Err(error)) => {
                drop(permit);
                match classify_accept_error(&error) {
                    AcceptFailure::Transient(after) => {
                        tracing::warn!(
                            worker,
                            error = %error,
                            backoff_ms = after.as_millis() as u64,
                            "transient accept failure, retrying"
                        );
                        if shared.backoff(after).await {
                            return Ok(());
                        }
                    }
                    AcceptFailure::Disposed if shared.signal.is_triggered() => {
                        tracing::debug!(worker, "listening socket closed during shutdown");
                        return Ok(());
                    }
                    AcceptFailure::Disposed => {
                        tracing::error!(worker, error = %error, "listening socket disposed outside of shutdown");
                        shared.halt.trigger();
                        return Err(ReactorError::ListenerDisposed { source: error });
                    }
                    AcceptFailure::Fatal => {
                        tracing::error!(worker, error = %error, "fatal accept failure");
                        shared.halt.trigger();
                        return Err(map_io_error(ACCEPT, error));
                    }
                }
            }
        }
    }
}

impl AcceptShared {
    /// 退避等待；期间观察到关闭或停止信号时返回 `true`。
    async fn backoff(&self, after: Duration) -> bool {
        tokio::select! {
            _ = self.signal.triggered() => true,
            _ = self.halt.triggered() => true,
            _ = tokio::time::sleep(after) => false,
        }
    }

    /// 为新连接取出收发上下文、登记绑定并派发会话任务。
    ///
    /// 任何一步失败都只丢弃这一个连接：套接字被关闭，名额与计数随守卫析构归还。
    fn dispatch(&self, stream: TcpStream, peer: SocketAddr, permit: AdmissionPermit) {
        let guard = self.connections.enter();
        let id = SessionId::new(self.next_session.fetch_add(1, Ordering::Relaxed));

        let local = match stream.local_addr() {
            Ok(local) => local,
            Err(error) => {
                tracing::warn!(session = %id, peer = %peer, error = %error, "accepted socket has no local address");
                return;
            }
        };
        let binding = SocketBinding {
            session: id,
            peer,
            local,
        };
        let force = ShutdownSignal::new();
        let closer = match ForceCloser::for_stream(force.clone(), &stream) {
            Ok(closer) => closer,
            Err(error) => {
                tracing::warn!(session = %id, peer = %peer, error = %error, "failed to duplicate accepted socket, dropping connection");
                return;
            }
        };

        let mut receive = match self.pools.receive.pop() {
            Ok(Some(ctx)) => ctx,
            Ok(None) | Err(_) => {
                tracing::debug!(session = %id, peer = %peer, "receive pool unavailable, dropping connection");
                return;
            }
        };
        let mut send = match self.pools.send.pop() {
            Ok(Some(ctx)) => ctx,
            Ok(None) | Err(_) => {
                tracing::debug!(session = %id, peer = %peer, "send pool unavailable, dropping connection");
                Self::recycle(id, &self.pools.receive, receive);
                return;
            }
        };

        let bound = self
            .pools
            .receive
            .bind(&mut receive, binding, &closer)
            .and_then(|()| self.pools.send.bind(&mut send, binding, &closer));
        if let Err(error) = bound {
            tracing::debug!(session = %id, peer = %peer, error = %error, "context binding failed, dropping connection");
            Self::recycle(id, &self.pools.receive, receive);
            Self::recycle(id, &self.pools.send, send);
            return;
        }

        tracing::debug!(session = %id, peer = %peer, "connection accepted");
        let session = ConnectionSession::new(SessionParts {
            id,
            stream,
            peer,
            receive,
            send,
            receive_pool: self.pools.receive.clone(),
            send_pool: self.pools.send.clone(),
            handler: Arc::clone(&self.handler),
            shutdown: self.signal.clone(),
            force,
            permit,
            guard,
        });
        tokio::spawn(session.run());
    }

    fn recycle(id: SessionId, pool: &ResourcePool, ctx: IoContext) {
        if let Err(error) = pool.push(ctx) {
            tracing::debug!(session = %id, error = %error, "context dropped on retired pool");
        }
    }
}
