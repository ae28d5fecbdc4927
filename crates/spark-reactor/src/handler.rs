use bytes::Bytes;

/// 应用层处理器：每次接收完成调用一次，输入本次收到的字节，返回要回写的响应。
///
/// # 教案式注释
/// - **意图 (Why)**：反应器只负责连接与资源管理，协议语义全部交给处理器实现；
/// - **契约 (What)**：
///   - `frame` 恰好是一次接收完成所读到的字节，不做任何分帧，处理器需自行应对半包/粘包；
///   - 返回值长度不得超过配置的 `buffer_size`，否则该连接以协议溢出关闭，不发送任何字节；
///   - 调用发生在会话任务内部，同一连接内严格串行，不同连接之间并发；
/// - **风险 (Trade-offs)**：调用是同步的，耗时处理会占用运行时工作线程，
///   反应器不为处理器施加超时。
pub trait ReceiveHandler: Send + Sync + 'static {
    fn handle(&self, frame: Bytes) -> Bytes;
}

impl<F> ReceiveHandler for F
where
    F: Fn(Bytes) -> Bytes + Send + Sync + 'static,
{
    fn handle(&self, frame: Bytes) -> Bytes {
        self(frame)
    }
}

/// 原样回写的处理器。
#[derive(Clone, Copy, Debug, Default)]
pub struct EchoHandler;

impl ReceiveHandler for EchoHandler {
    fn handle(&self, frame: Bytes) -> Bytes {
        frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closures_are_handlers() {
        let upper = |frame: Bytes| Bytes::from(frame.to_ascii_uppercase());
        assert_eq!(upper.handle(Bytes::from_static(b"ping")).as_ref(), b"PING");
        assert_eq!(EchoHandler.handle(Bytes::from_static(b"x")).as_ref(), b"x");
    }
}
