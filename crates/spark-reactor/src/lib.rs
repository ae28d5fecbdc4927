#![doc = r#"
# spark-reactor

## 设计动机（Why）
- **定位**：该 crate 提供 Spark 在 Tokio 运行时上的 TCP 服务端反应器：
  监听、准入控制、I/O 上下文复用与有界优雅关闭。
- **架构角色**：位于传输实现层之上、应用协议之下，只负责连接与资源管理；
  协议语义全部交给可插拔的 [`ReceiveHandler`]。
- **设计理念**：强调“显式信号传递”与“资源所有权转移”：关闭信号经由参数逐层传入，
  I/O 上下文以值的形式在池与会话之间移动，任何时刻只被一个持有者引用。

## 核心契约（What）
- **准入上限**：已接入且未关闭的连接数恒不超过 `max_connections`；
- **池容量**：每个资源池的空闲上下文数量恒不超过其容量，归还的上下文不残留前一会话的数据；
- **恰好一次**：每个会话关闭时活跃计数递减一次、准入名额归还一次；
- **有界关闭**：[`ShutdownCoordinator::shutdown`] 阻塞调用方的时间不超过 `timeout`，返回时全部连接的套接字均已关闭；
- **故障隔离**：单个连接的收发失败或协议溢出只关闭该连接，不影响监听器。

## 实现策略（How）
- **执行框架**：Tokio 多线程运行时，每个 accept 工作者与每个会话各占一个任务；
- **准入**：`tokio::sync::Semaphore` 与 RAII 许可；
- **资源池**：每个池一把 `parking_lot::Mutex`，锁内只做簿记，缓冲分配与 IO 均在锁外；
- **会话**：显式状态机 `Receiving → Handling → Sending → Receiving`，任意状态可进入 `Closing → Closed`。

## 风险与考量（Trade-offs）
- **分帧**：一次接收完成即视为一个逻辑单元，处理器需自行应对半包与粘包；
- **处理器耗时**：处理器同步执行，长耗时逻辑会占用运行时工作线程；
- **空闲连接**：关闭信号只在下一次收/发前生效，空闲连接需等待超时后由资源池释放强制关闭；
- **卡住的处理器**：强制关闭只作用于套接字，处理器返回前会话任务仍占用活跃计数。
"#]

mod config;
mod context;
mod error;
mod gate;
mod handler;
mod listener;
mod pool;
mod session;
mod shutdown;
mod signal;
mod tracker;

pub use config::{
    ConfigError, DEFAULT_BACKLOG, DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_SIMULTANEOUS_ACCEPT_OPS, DEFAULT_SENDERS_PER_CONNECTION, ListenerConfig,
    ListenerConfigBuilder,
};
pub use context::{IoContext, PoolRole, SessionId, SlotId, SocketBinding};
pub use error::{ErrorCategory, OperationKind, ReactorError};
pub use gate::{AdmissionGate, AdmissionPermit};
pub use handler::{EchoHandler, ReceiveHandler};
pub use listener::{Listener, ListenerHandle, ReactorStats};
pub use pool::{DisposeSummary, PoolGrowth, PoolStats, ResourcePool};
pub use session::{CloseReason, ConnectionSession, SessionReport, SessionState};
pub use shutdown::{ShutdownCoordinator, ShutdownPhase, ShutdownReport};
pub use signal::{ForceCloser, ShutdownSignal};
pub use tracker::{ActiveConnections, ConnectionGuard};
