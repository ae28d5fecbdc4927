use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::{Instant, timeout_at};

use crate::listener::ReactorPools;
use crate::signal::ShutdownSignal;
use crate::tracker::ActiveConnections;

/// 关闭流程所处阶段。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPhase {
    /// 正常运行。
    Running,
    /// 已停止接入，等待活跃连接自然结束。
    Draining,
    /// 等待超时，剩余连接的套接字已被强制关闭，会话任务尚在回收。
    ForceClosing,
    /// 全部会话均已完成回收。
    Stopped,
}

impl ShutdownPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => ShutdownPhase::Running,
            1 => ShutdownPhase::Draining,
            2 => ShutdownPhase::ForceClosing,
            _ => ShutdownPhase::Stopped,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ShutdownPhase::Running => 0,
            ShutdownPhase::Draining => 1,
            ShutdownPhase::ForceClosing => 2,
            ShutdownPhase::Stopped => 3,
        }
    }
}

impl fmt::Display for ShutdownPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ShutdownPhase::Running => "running",
            ShutdownPhase::Draining => "draining",
            ShutdownPhase::ForceClosing => "force_closing",
            ShutdownPhase::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// 一次关闭流程的结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ShutdownReport {
    /// 在等待窗口内自然结束的连接数。
    pub drained: usize,
    /// 被资源池释放强制关闭的连接数。
    pub forced: usize,
    /// 返回时套接字已被关闭、但会话任务尚未完成回收的连接数（例如处理器仍在执行）。
    pub remaining: usize,
    /// 流程总耗时。
    pub elapsed: Duration,
    /// 流程结束时所处阶段：全部回收为 `Stopped`，否则为 `ForceClosing`。
    pub phase: ShutdownPhase,
}

impl ShutdownReport {
    /// 是否所有连接都在等待窗口内自然结束。
    pub fn is_graceful(&self) -> bool {
        self.forced == 0 && self.remaining == 0
    }
}

/// 有界优雅关闭的协调者。
///
/// # 教案式注解
/// - **问题动机 (Why)**：关闭必须有上界。空闲连接可能永远不再发送数据，
///   单纯等待活跃计数归零会让进程无法退出；
/// - **协作方式 (How)**：
///   1. 触发共享关闭信号：准入闸门拒绝新的名额，会话在下一次收/发前半关闭；
///   2. 等待全部 accept 工作者退出，监听套接字随最后一个引用释放而关闭；
///   3. 在 `timeout` 内异步等待活跃连接归零；
///   4. 无论是否超时都释放三个资源池：仍持有上下文的会话，其套接字在释放调用内被直接关闭；
///   5. 立即返回，不再等待被强制关闭的会话任务完成回收。
///
/// # 契约说明 (What)
/// - **后置条件**：`shutdown` 的耗时不超过 `timeout`（加调度抖动）；返回时所有已接入连接的
///   套接字均已关闭，尚未完成回收的会话计入 [`ShutdownReport::remaining`]；
/// - 之后 [`phase`](Self::phase) 在活跃计数归零时自动报告 `Stopped`；
/// - 重复调用是安全的：后续调用等待首次调用完成并返回同一份报告。
///
/// # 风险提示 (Trade-offs)
/// - 活跃计数只有一个等待者，协调器内部以互斥锁串行化整个流程来满足这一点。
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<CoordinatorInner>,
}

struct CoordinatorInner {
    signal: ShutdownSignal,
    acceptors: ActiveConnections,
    connections: ActiveConnections,
    pools: ReactorPools,
    phase: AtomicU8,
    disposed: AtomicBool,
    outcome: AsyncMutex<Option<ShutdownReport>>,
}

impl ShutdownCoordinator {
    pub(crate) fn new(
        signal: ShutdownSignal,
        acceptors: ActiveConnections,
        connections: ActiveConnections,
        pools: ReactorPools,
    ) -> Self {
        Self {
            inner: Arc::new(CoordinatorInner {
                signal,
                acceptors,
                connections,
                pools,
                phase: AtomicU8::new(ShutdownPhase::Running.as_u8()),
                disposed: AtomicBool::new(false),
                outcome: AsyncMutex::new(None),
            }),
        }
    }

    /// 当前阶段。
    ///
    /// 资源池释放之后，活跃计数一旦归零即报告 `Stopped`。
    pub fn phase(&self) -> ShutdownPhase {
        let phase = ShutdownPhase::from_u8(self.inner.phase.load(Ordering::Acquire));
        if phase == ShutdownPhase::ForceClosing
            && self.inner.disposed.load(Ordering::Acquire)
            && self.inner.connections.active() == 0
        {
            return ShutdownPhase::Stopped;
        }
        phase
    }

    /// 执行有界关闭。
    pub async fn shutdown(&self, timeout_after: Duration) -> ShutdownReport {
        let mut outcome = self.inner.outcome.lock().await;
        if let Some(report) = *outcome {
            return report;
        }

        let started = Instant::now();
        let deadline = started + timeout_after;
        let connections = &self.inner.connections;
        let active_at_start = connections.active();

        tracing::info!(
            timeout_ms = timeout_after.as_millis() as u64,
            active = active_at_start,
            "reactor shutdown initiated"
        );
        self.inner.signal.trigger();
        self.enter(ShutdownPhase::Draining);

        if timeout_at(deadline, self.inner.acceptors.wait_for_idle())
            .await
            .is_err()
        {
            tracing::warn!("accept workers did not stop before the shutdown deadline");
        }

        let drained_in_time = timeout_at(deadline, connections.wait_for_idle())
            .await
            .is_ok();
        let pending = connections.active();
        let drained = active_at_start.saturating_sub(pending);

        if !drained_in_time {
            self.enter(ShutdownPhase::ForceClosing);
            tracing::warn!(
                remaining = pending,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "shutdown timeout elapsed, force-closing remaining connections"
            );
        }

        let summary = self.inner.pools.dispose_all();
        self.inner.disposed.store(true, Ordering::Release);
        let forced = summary.force_closed_sessions();
        tracing::debug!(
            released_idle = summary.released_idle(),
            forced,
            "resource pools disposed"
        );

        let remaining = connections.active();
        let phase = if remaining == 0 {
            ShutdownPhase::Stopped
        } else {
            ShutdownPhase::ForceClosing
        };
        self.enter(phase);

        let report = ShutdownReport {
            drained,
            forced,
            remaining,
            elapsed: started.elapsed(),
            phase,
        };
        tracing::info!(
            drained = report.drained,
            forced = report.forced,
            remaining = report.remaining,
            elapsed_ms = report.elapsed.as_millis() as u64,
            phase = %report.phase,
            "reactor shutdown finished"
        );
        *outcome = Some(report);
        report
    }

    fn enter(&self, phase: ShutdownPhase) {
        self.inner.phase.store(phase.as_u8(), Ordering::Release);
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &self.phase())
            .field("active", &self.inner.connections.active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::PoolRole;
    use crate::pool::ResourcePool;

    fn pools() -> ReactorPools {
        ReactorPools {
            accept: ResourcePool::fixed(PoolRole::Accept, 1, 0),
            receive: ResourcePool::growable(PoolRole::Receive, 2, 16),
            send: ResourcePool::growable(PoolRole::Send, 2, 16),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn idle_reactor_stops_immediately() {
        let coordinator = ShutdownCoordinator::new(
            ShutdownSignal::new(),
            ActiveConnections::new(),
            ActiveConnections::new(),
            pools(),
        );
        assert_eq!(coordinator.phase(), ShutdownPhase::Running);

        let report = coordinator.shutdown(Duration::from_secs(5)).await;
        assert!(report.is_graceful());
        assert_eq!(report.phase, ShutdownPhase::Stopped);
        assert!(report.elapsed < Duration::from_secs(1));
        assert_eq!(coordinator.phase(), ShutdownPhase::Stopped);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stuck_connection_is_bounded_by_timeout() {
        let connections = ActiveConnections::new();
        let stuck = connections.enter();
        let coordinator = ShutdownCoordinator::new(
            ShutdownSignal::new(),
            ActiveConnections::new(),
            connections.clone(),
            pools(),
        );

        let report = coordinator.shutdown(Duration::from_millis(50)).await;
        assert!(report.elapsed < Duration::from_millis(50) + Duration::from_millis(100));
        assert_eq!(report.remaining, 1, "未登记上下文的连接无法被强制关闭");
        assert_eq!(report.phase, ShutdownPhase::ForceClosing);

        let again = coordinator.shutdown(Duration::from_secs(5)).await;
        assert_eq!(again, report, "重复调用返回首次的报告");
        assert_eq!(coordinator.phase(), ShutdownPhase::ForceClosing);
        drop(stuck);
        assert_eq!(coordinator.phase(), ShutdownPhase::Stopped, "回收完成后报告 Stopped");
    }
}
