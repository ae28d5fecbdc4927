use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use socket2::{SockRef, Socket};
use tokio::net::TcpStream;
use tokio::sync::Notify;

/// 显式传递的关闭信号。
///
/// # 设计背景（Why）
/// - 反应器内所有组件（accept 循环、每个会话、准入闸门）都需要感知“正在关闭”，
///   但不允许读取进程级全局可变状态；信号必须经由构造函数或调用参数逐层传入。
/// - 同一类型也作为单个会话的强制关闭信号，由 [`ForceCloser`] 包装后登记到资源池。
///
/// # 逻辑解析（How）
/// - 内部以 [`AtomicBool`] 记录是否已触发，供热路径无锁查询；
/// - 借助 [`Notify`] 唤醒所有在 [`triggered`](Self::triggered) 上等待的任务；
/// - `trigger` 仅在首次成功置位时返回 `true`，重复调用不会重复唤醒。
///
/// # 契约说明（What）
/// - **前置条件**：无，默认处于“未触发”状态；
/// - **后置条件**：一旦触发，`is_triggered` 对所有克隆体立即可见，且不可撤销。
///
/// # 设计取舍与风险（Trade-offs）
/// - 信号只阻止“下一次”操作被调度，不会强行打断正在执行的同步代码；
///   调用方需要在自然挂起点（下一次收/发之前）检查。
#[derive(Clone, Debug, Default)]
pub struct ShutdownSignal {
    inner: Arc<SignalState>,
}

#[derive(Debug, Default)]
struct SignalState {
    flag: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    /// 创建处于“未触发”状态的信号。
    pub fn new() -> Self {
        Self::default()
    }

    /// 查询信号是否已触发。
    pub fn is_triggered(&self) -> bool {
        self.inner.flag.load(Ordering::Acquire)
    }

    /// 触发信号并唤醒全部等待者。
    ///
    /// 返回值为 `true` 表示本次调用首次触发。
    pub fn trigger(&self) -> bool {
        let first = self
            .inner
            .flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if first {
            self.inner.notify.notify_waiters();
        }
        first
    }

    /// 等待信号被触发；若已触发则立即返回。
    pub async fn triggered(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // 先登记等待再检查标志位，避免错过检查与挂起之间的 `notify_waiters`。
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

/// 单个会话的强制关闭句柄。
///
/// - 持有会话私有的强制关闭信号，唤醒阻塞在收/发上的会话；
/// - 同时持有已接入套接字的复制句柄，[`close`](Self::close) 直接对其执行双向 `shutdown`，
///   因此即便会话任务卡在处理器中、永远到不了下一个挂起点，连接也会在调用返回前失效；
/// - 复制句柄随最后一个克隆体析构而释放，不影响会话持有的原始套接字。
#[derive(Clone, Debug)]
pub struct ForceCloser {
    signal: ShutdownSignal,
    socket: Option<Arc<Socket>>,
}

impl ForceCloser {
    /// 仅包含信号、不持有套接字的句柄。
    pub fn new(signal: ShutdownSignal) -> Self {
        Self {
            signal,
            socket: None,
        }
    }

    /// 为已接入的连接创建句柄，复制其套接字描述符。
    pub fn for_stream(signal: ShutdownSignal, stream: &TcpStream) -> io::Result<Self> {
        let socket = SockRef::from(stream).try_clone()?;
        Ok(Self {
            signal,
            socket: Some(Arc::new(socket)),
        })
    }

    pub fn signal(&self) -> &ShutdownSignal {
        &self.signal
    }

    /// 触发信号，并立即关闭套接字的两个方向。
    ///
    /// 可重复调用；对已关闭套接字的 `shutdown` 失败只记录 trace 事件。
    pub fn close(&self) {
        self.signal.trigger();
        if let Some(socket) = &self.socket
            && let Err(error) = socket.shutdown(Shutdown::Both)
        {
            tracing::trace!(error = %error, "force-close shutdown failed");
        }
    }
}
