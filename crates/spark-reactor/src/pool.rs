use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::context::{IoContext, PoolRole, SlotId, SocketBinding};
use crate::error::ReactorError;
use crate::signal::ForceCloser;

/// 池在空闲集合耗尽时的行为。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolGrowth {
    /// 构造时预热全部上下文，耗尽时 `pop` 返回 `None`，由调用方等待或重试。
    Fixed,
    /// 惰性创建，耗尽时直接分配新的上下文；归还时超出容量的部分被丢弃。
    Growable,
}

/// 资源池的统计快照。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PoolStats {
    pub role: PoolRole,
    pub capacity: usize,
    /// 当前空闲上下文数量，恒不超过 `capacity`。
    pub idle: usize,
    /// 当前被会话或 accept 工作者持有的上下文数量。
    pub leased: usize,
    /// 累计创建的上下文数量。
    pub created: u64,
    /// 因超出容量或池已退役而被丢弃的上下文数量。
    pub discarded: u64,
    /// 固定池在空闲集合为空时的未命中次数。
    pub misses: u64,
    pub retired: bool,
}

/// `dispose_all` 的执行结果。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DisposeSummary {
    /// 被释放的空闲上下文数量。
    pub released_idle: usize,
    /// 被强制关闭的、仍由会话持有的已绑定上下文数量。
    pub force_closed: usize,
}

/// 固定逻辑容量的 I/O 上下文池。
///
/// # 模块角色（Why）
/// - 反应器使用三个独立实例（accept / receive / send），让连接接入与收发复用预分配的上下文，
///   避免在高并发下反复分配缓冲；
/// - 追踪每个外借上下文绑定的会话，使关闭阶段能够经由 [`dispose_all`](Self::dispose_all)
///   直接关闭仍被占用的套接字，不依赖会话任务的配合。
///
/// # 核心机制（How）
/// - 单把 `parking_lot::Mutex` 串行化全部簿记：空闲栈、外借表、退役标志；
///   锁内只做指针级别的交换，缓冲分配与释放都在锁外完成，绝不跨越 IO 持锁；
/// - 外借表以 [`SlotId`] 为键，记录该槽位绑定会话的 [`ForceCloser`]（信号 + 套接字复制句柄）；
/// - `PoolMetrics` 以原子计数累积创建、丢弃与未命中次数，支撑 [`stats`](Self::stats) 快照。
///
/// # 契约说明（What）
/// - **容量不变式**：空闲数量恒 `<= capacity`，多余的上下文在 `push` 时被丢弃而非保留；
/// - **复位不变式**：进入空闲集合的上下文已清空绑定与缓冲，不残留前一任会话的任何引用；
/// - **退役语义**：`dispose_all` 之后 `pop`/`push`/`bind` 一律返回 [`ReactorError::PoolRetired`]。
///
/// # 设计权衡（Trade-offs）
/// - 空闲集合采用 LIFO 栈，最近归还的上下文最先复用，缓存更热；
/// - 外借表使用 `HashMap` 而非固定数组，因为可增长池的槽位编号没有上界。
#[derive(Clone)]
pub struct ResourcePool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    role: PoolRole,
    capacity: usize,
    buffer_size: usize,
    growth: PoolGrowth,
    state: Mutex<PoolState>,
    metrics: PoolMetrics,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<IoContext>,
    leases: HashMap<SlotId, Lease>,
    next_slot: u64,
    retired: bool,
}

#[derive(Default)]
struct Lease {
    closer: Option<ForceCloser>,
}

impl ResourcePool {
    /// 创建固定容量池，并预热 `capacity` 个上下文。
    pub fn fixed(role: PoolRole, capacity: usize, buffer_size: usize) -> Self {
        let pool = Self::with_growth(role, capacity, buffer_size, PoolGrowth::Fixed);
        let buffer_size = pool.inner.buffer_size;
        let warmed: Vec<IoContext> = (0..capacity as u64)
            .map(|raw| IoContext::new(SlotId::new(raw), role, buffer_size))
            .collect();
        {
            let mut state = pool.inner.state.lock();
            state.next_slot = capacity as u64;
            state.idle = warmed;
        }
        pool.inner.metrics.created(capacity as u64);
        pool
    }

    /// 创建可增长池，上下文在首次需要时才分配。
    pub fn growable(role: PoolRole, capacity: usize, buffer_size: usize) -> Self {
        Self::with_growth(role, capacity, buffer_size, PoolGrowth::Growable)
    }

    fn with_growth(
        role: PoolRole,
        capacity: usize,
        buffer_size: usize,
        growth: PoolGrowth,
    ) -> Self {
        let buffer_size = if role == PoolRole::Accept {
            0
        } else {
            buffer_size
        };
        Self {
            inner: Arc::new(PoolInner {
                role,
                capacity,
                buffer_size,
                growth,
                state: Mutex::new(PoolState::default()),
                metrics: PoolMetrics::default(),
            }),
        }
    }

    pub fn role(&self) -> PoolRole {
        self.inner.role
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn growth(&self) -> PoolGrowth {
        self.inner.growth
    }

    /// 当前空闲数量。
    pub fn idle_count(&self) -> usize {
        self.inner.state.lock().idle.len()
    }

    /// 取出一个上下文。
    ///
    /// - 有空闲上下文时直接返回；
    /// - 固定池耗尽时返回 `Ok(None)`，调用方需等待或重试；
    /// - 可增长池耗尽时在锁外分配新上下文。
    pub fn pop(&self) -> Result<Option<IoContext>, ReactorError> {
        let fresh_slot = {
            let mut state = self.inner.state.lock();
            if state.retired {
                return Err(self.retired("pop"));
            }
            if let Some(ctx) = state.idle.pop() {
                state.leases.insert(ctx.slot(), Lease::default());
                return Ok(Some(ctx));
            }
            match self.inner.growth {
                PoolGrowth::Fixed => {
                    self.inner.metrics.missed();
                    return Ok(None);
                }
                PoolGrowth::Growable => {
                    let slot = SlotId::new(state.next_slot);
                    state.next_slot += 1;
                    state.leases.insert(slot, Lease::default());
                    slot
                }
            }
        };

        self.inner.metrics.created(1);
        Ok(Some(IoContext::new(
            fresh_slot,
            self.inner.role,
            self.inner.buffer_size,
        )))
    }

    /// 将上下文绑定到会话，并登记该会话的强制关闭句柄。
    ///
    /// 池退役时，所有仍处于外借状态且已登记句柄的会话都会被强制关闭。
    pub fn bind(
        &self,
        ctx: &mut IoContext,
        binding: SocketBinding,
        closer: &ForceCloser,
    ) -> Result<(), ReactorError> {
        let mut state = self.inner.state.lock();
        if state.retired {
            return Err(self.retired("bind"));
        }
        state.leases.entry(ctx.slot()).or_default().closer = Some(closer.clone());
        ctx.set_binding(binding);
        Ok(())
    }

    /// 归还上下文。
    ///
    /// 上下文先被复位（清空绑定与缓冲），随后在空闲数量未达容量时入栈，否则被丢弃。
    /// 池已退役时上下文同样被丢弃，并返回 [`ReactorError::PoolRetired`]。
    pub fn push(&self, mut ctx: IoContext) -> Result<(), ReactorError> {
        debug_assert_eq!(ctx.role(), self.inner.role, "context pushed to foreign pool");
        ctx.reset();

        let overflow = {
            let mut state = self.inner.state.lock();
            if state.retired {
                None
            } else {
                state.leases.remove(&ctx.slot());
                if state.idle.len() < self.inner.capacity {
                    state.idle.push(ctx);
                    return Ok(());
                }
                Some(ctx)
            }
        };

        self.inner.metrics.discarded();
        match overflow {
            Some(ctx) => {
                drop(ctx);
                Ok(())
            }
            None => Err(self.retired("push")),
        }
    }

    /// 退役并释放整个池。
    ///
    /// - 释放全部空闲上下文；
    /// - 对仍外借且已绑定会话的上下文执行 [`ForceCloser::close`]：套接字在本调用返回前
    ///   即被双向关闭，会话任务随后在下一个挂起点完成回收；
    /// - 重复调用是幂等的，第二次起返回全零的摘要。
    pub fn dispose_all(&self) -> DisposeSummary {
        let (idle, leases) = {
            let mut state = self.inner.state.lock();
            if state.retired {
                return DisposeSummary::default();
            }
            state.retired = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.leases),
            )
        };

        let released_idle = idle.len();
        drop(idle);

        let mut force_closed = 0;
        for lease in leases.into_values() {
            if let Some(closer) = lease.closer {
                closer.close();
                force_closed += 1;
            }
        }

        tracing::debug!(
            pool = %self.inner.role,
            released_idle,
            force_closed,
            "resource pool disposed"
        );
        DisposeSummary {
            released_idle,
            force_closed,
        }
    }

    /// 读取统计快照。
    pub fn stats(&self) -> PoolStats {
        let (idle, leased, retired) = {
            let state = self.inner.state.lock();
            (state.idle.len(), state.leases.len(), state.retired)
        };
        PoolStats {
            role: self.inner.role,
            capacity: self.inner.capacity,
            idle,
            leased,
            created: self.inner.metrics.created.load(Ordering::Relaxed),
            discarded: self.inner.metrics.discarded.load(Ordering::Relaxed),
            misses: self.inner.metrics.misses.load(Ordering::Relaxed),
            retired,
        }
    }

    fn retired(&self, operation: &'static str) -> ReactorError {
        ReactorError::PoolRetired {
            role: self.inner.role,
            operation,
        }
    }
}

impl std::fmt::Debug for ResourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("role", &self.inner.role)
            .field("capacity", &self.inner.capacity)
            .field("growth", &self.inner.growth)
            .finish()
    }
}

#[derive(Default)]
struct PoolMetrics {
    created: AtomicU64,
    discarded: AtomicU64,
    misses: AtomicU64,
}

impl PoolMetrics {
    fn created(&self, count: u64) {
        self.created.fetch_add(count, Ordering::Relaxed);
    }

    fn discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    fn missed(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }
}
