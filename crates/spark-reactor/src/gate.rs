use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{ADMISSION, ReactorError, cancelled_error};
use crate::signal::ShutdownSignal;

/// 限定并发连接数量的准入闸门。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 在 accept 之前先占用名额，使“已接入但尚未关闭”的连接数恒不超过 `max_connections`；
/// - 资源枯竭时由闸门自然节流：名额耗尽后 accept 工作者停在 `acquire` 上，
///   不会再向内核索取新的连接。
///
/// ## 逻辑 (How)
/// - 以 `tokio::sync::Semaphore` 计数，`acquire_owned` 取得的许可随 [`AdmissionPermit`] 移动；
/// - `acquire` 与 [`ShutdownSignal::triggered`] 竞争，关闭信号先到则返回取消错误。
///
/// ## 契约 (What)
/// - **前置条件**：`capacity > 0`，由配置校验保证；
/// - **后置条件**：每个成功返回的许可恰好归还一个名额，归还在 `Drop` 中完成，
///   重复释放在类型层面不可表达。
#[derive(Clone, Debug)]
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// 等待一个准入名额，或在关闭信号触发后放弃。
    pub async fn acquire(&self, signal: &ShutdownSignal) -> Result<AdmissionPermit, ReactorError> {
        if signal.is_triggered() {
            return Err(cancelled_error(ADMISSION));
        }
        tokio::select! {
            biased;
            _ = signal.triggered() => Err(cancelled_error(ADMISSION)),
            permit = Arc::clone(&self.semaphore).acquire_owned() => match permit {
                Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
                // 信号量只会在闸门被关闭时报错，语义等同于关闭。
                Err(_) => Err(cancelled_error(ADMISSION)),
            },
        }
    }

    /// 当前剩余名额。
    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 已被占用的名额。
    pub fn in_use(&self) -> usize {
        self.capacity.saturating_sub(self.available())
    }
}

/// 一个已占用的准入名额，`Drop` 时归还。
#[derive(Debug)]
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

impl AdmissionPermit {
    /// 显式归还名额，等价于 `drop(permit)`。
    pub fn release(self) {}
}
