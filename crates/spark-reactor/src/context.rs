use std::fmt;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};

use crate::error::ReactorError;

/// 上下文所属池的角色。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PoolRole {
    /// 承载 accept 操作，不持有缓冲。
    Accept,
    /// 承载接收操作。
    Receive,
    /// 承载发送操作。
    Send,
}

impl fmt::Display for PoolRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolRole::Accept => f.write_str("accept"),
            PoolRole::Receive => f.write_str("receive"),
            PoolRole::Send => f.write_str("send"),
        }
    }
}

/// 会话唯一标识，由监听器单调分配。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// 返回原始数值。
    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session-{}", self.0)
    }
}

/// 上下文在所属池内的稳定槽位编号。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(u64);

impl SlotId {
    pub(crate) const fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// 上下文与具体连接之间的绑定元数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SocketBinding {
    /// 拥有该上下文的会话。
    pub session: SessionId,
    /// 对端地址。
    pub peer: SocketAddr,
    /// 本地地址。
    pub local: SocketAddr,
}

/// 可复用的 I/O 上下文：固定容量缓冲 + 归属元数据。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 让接收与发送复用预先分配的缓冲，避免每个请求都触发一次堆分配；
/// - 通过“值所有权”表达独占：上下文要么躺在池的空闲集合里，要么被恰好一个会话持有，
///   编译器保证不会被两个会话同时引用。
///
/// ## 逻辑 (How)
/// - `buffer` 的容量在构造时确定，之后所有写入都先做容量检查，绝不触发扩容；
/// - `binding` 记录当前归属的会话与套接字地址，归还池时由 [`reset`](Self::reset) 清空。
///
/// ## 契约 (What)
/// - **前置条件**：`Accept` 角色的上下文容量为 0，不参与收发；
/// - **后置条件**：`reset` 之后 `binding()` 为 `None` 且 `filled()` 为空切片。
#[derive(Debug)]
pub struct IoContext {
    slot: SlotId,
    role: PoolRole,
    capacity: usize,
    buffer: BytesMut,
    binding: Option<SocketBinding>,
}

impl IoContext {
    pub(crate) fn new(slot: SlotId, role: PoolRole, capacity: usize) -> Self {
        Self {
            slot,
            role,
            capacity,
            buffer: BytesMut::with_capacity(capacity),
            binding: None,
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn role(&self) -> PoolRole {
        self.role
    }

    /// 缓冲的固定容量。
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// 当前绑定信息。
    pub fn binding(&self) -> Option<&SocketBinding> {
        self.binding.as_ref()
    }

    /// 当前缓冲中的有效字节。
    pub fn filled(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn set_binding(&mut self, binding: SocketBinding) {
        self.binding = Some(binding);
    }

    /// 为下一次接收准备缓冲：清空旧数据并返回可直接交给 `read_buf` 的 `BytesMut`。
    ///
    /// 清空后 `len == 0`，`read_buf` 最多写入 `capacity` 字节，不会扩容。
    pub(crate) fn prepare_receive(&mut self) -> &mut BytesMut {
        self.buffer.clear();
        &mut self.buffer
    }

    /// 将缓冲中已接收的字节拷贝为会话私有的帧。
    ///
    /// 池化缓冲会在下一次接收时被覆写，因此绝不能以引用形式外泄。
    pub(crate) fn copy_frame(&self) -> Bytes {
        Bytes::copy_from_slice(&self.buffer)
    }

    /// 将响应载入发送缓冲。
    ///
    /// 响应超过容量时返回 [`ReactorError::ProtocolOverflow`]，缓冲保持清空状态。
    pub(crate) fn load(&mut self, payload: &[u8]) -> Result<(), ReactorError> {
        self.buffer.clear();
        if payload.len() > self.capacity {
            return Err(ReactorError::ProtocolOverflow {
                len: payload.len(),
                capacity: self.capacity,
            });
        }
        self.buffer.extend_from_slice(payload);
        Ok(())
    }

    /// 清除归属与缓冲内容，供归还池时调用。
    pub(crate) fn reset(&mut self) {
        self.binding = None;
        self.buffer.clear();
    }
}
