use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::Poll;

use futures_util::{future::poll_fn, task::AtomicWaker};

/// 活跃连接计数器，为关闭协调器提供 WaitGroup 语义。
///
/// # 教案级注释
/// - **意图 (Why)**：会话以独立任务运行且从不被 `join`，关闭阶段需要一个无需持有句柄的
///   “仍有多少连接未关闭”的视图，并能异步等待其归零。
/// - **设计与逻辑 (How)**：
///   - 原子计数 + [`AtomicWaker`]，计数由 [`ConnectionGuard`] 的构造与析构维护；
///   - `wait_for_idle` 基于 `poll_fn`，先检查、再注册、再检查，避免错过归零唤醒。
/// - **契约 (What)**：
///   - **后置条件**：每个守卫恰好使计数加一、减一，即使会话任务 panic 也会在析构时递减；
///   - `wait_for_idle` 返回时计数为 0。
/// - **风险与权衡 (Trade-offs & Gotchas)**：
///   - `AtomicWaker` 只保存一个等待者；反应器中唯一的等待方是关闭协调器，
///     并发调用 `wait_for_idle` 的后注册者会覆盖先注册者。
#[derive(Clone, Debug, Default)]
pub struct ActiveConnections {
    inner: Arc<TrackerInner>,
}

#[derive(Debug, Default)]
struct TrackerInner {
    counter: AtomicUsize,
    waker: AtomicWaker,
}

impl ActiveConnections {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个新连接，返回在析构时递减计数的守卫。
    pub fn enter(&self) -> ConnectionGuard {
        self.inner.counter.fetch_add(1, Ordering::Release);
        ConnectionGuard {
            tracker: self.clone(),
        }
    }

    /// 当前活跃连接数。
    pub fn active(&self) -> usize {
        self.inner.counter.load(Ordering::Acquire)
    }

    /// 等待活跃连接数归零。
    pub async fn wait_for_idle(&self) {
        poll_fn(|cx| {
            if self.active() == 0 {
                return Poll::Ready(());
            }
            self.inner.waker.register(cx.waker());
            if self.active() == 0 {
                Poll::Ready(())
            } else {
                Poll::Pending
            }
        })
        .await
    }
}

/// 单个连接的计数守卫。
#[derive(Debug)]
pub struct ConnectionGuard {
    tracker: ActiveConnections,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.tracker.inner.counter.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.tracker.inner.waker.wake();
        }
    }
}
