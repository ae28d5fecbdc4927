use std::io;
use std::time::Duration;

use thiserror::Error;

use crate::config::ConfigError;
use crate::context::PoolRole;

/// 描述一次底层操作对应的稳定错误码与默认文案。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OperationKind {
    pub code: &'static str,
    pub message: &'static str,
}

pub(crate) const BIND: OperationKind = OperationKind {
    code: "spark.reactor.bind_failed",
    message: "tcp bind",
};
pub(crate) const LISTEN: OperationKind = OperationKind {
    code: "spark.reactor.listen_failed",
    message: "tcp listen",
};
pub(crate) const ACCEPT: OperationKind = OperationKind {
    code: "spark.reactor.accept_failed",
    message: "tcp accept",
};
pub(crate) const RECEIVE: OperationKind = OperationKind {
    code: "spark.reactor.receive_failed",
    message: "tcp receive",
};
pub(crate) const SEND: OperationKind = OperationKind {
    code: "spark.reactor.send_failed",
    message: "tcp send",
};
pub(crate) const ADMISSION: OperationKind = OperationKind {
    code: "spark.reactor.admission_failed",
    message: "admission acquire",
};

const CANCEL_CODE: &str = "spark.reactor.cancelled";
const POOL_RETIRED_CODE: &str = "spark.reactor.pool_retired";
const LISTENER_DISPOSED_CODE: &str = "spark.reactor.listener_disposed";
const PROTOCOL_OVERFLOW_CODE: &str = "spark.reactor.protocol_overflow";
const CONFIG_CODE: &str = "spark.reactor.invalid_config";
const ACCEPT_LOOP_CODE: &str = "spark.reactor.accept_loop_aborted";

/// 错误分类，决定调用方是否可以重试以及建议的退避窗口。
///
/// # 教案式注释
/// - **意图 (Why)**：与 TCP 传输层保持一致的“可重试/不可重试/取消/超时”四分法，
///   让 accept 循环只凭分类即可决定“回收上下文并重试”还是“终止监听”。
/// - **契约 (What)**：`Retryable` 携带建议退避时长；其余变体不携带额外数据。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCategory {
    /// 暂时性失败，建议在给定时长后重试。
    Retryable(Duration),
    /// 不可重试的失败。
    NonRetryable,
    /// 操作因关闭信号被取消。
    Cancelled,
    /// 操作超时。
    Timeout,
}

/// 反应器统一错误类型。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 将监听、接入、收发、资源池与配置阶段的失败归并为单一枚举，
///   便于宿主按 [`ReactorError::code`] 做稳定的告警聚合。
///
/// ## 契约 (What)
/// - 每个变体都提供稳定错误码（`spark.reactor.*`）与 [`ErrorCategory`]；
/// - `Io` 变体保留原始 [`io::Error`] 作为 `source`，不丢失系统错误码。
///
/// ## 注意事项 (Trade-offs)
/// - `ProtocolOverflow` 仅终止触发它的连接，永远不会经由 `ListenerHandle::join` 向上传播；
///   它出现在 [`SessionReport`](crate::SessionReport) 的关闭原因中。
#[derive(Debug, Error)]
pub enum ReactorError {
    /// 底层套接字 IO 失败。
    #[error("{}: {source}", kind.message)]
    Io {
        kind: OperationKind,
        #[source]
        source: io::Error,
    },
    /// 操作在观察到关闭信号后放弃执行。
    #[error("{} cancelled", kind.message)]
    Cancelled { kind: OperationKind },
    /// 资源池已在关闭阶段被整体释放，之后的 `pop`/`push` 均快速失败。
    #[error("{operation} on retired {role} pool")]
    PoolRetired {
        role: PoolRole,
        operation: &'static str,
    },
    /// 监听套接字在非关闭阶段被释放，属于生命周期违例。
    #[error("listening socket disposed outside of shutdown: {source}")]
    ListenerDisposed {
        #[source]
        source: io::Error,
    },
    /// Handler 返回的响应超过缓冲容量。
    #[error("response of {len} bytes exceeds buffer capacity of {capacity} bytes")]
    ProtocolOverflow { len: usize, capacity: usize },
    /// 配置非法。
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// accept 工作任务异常退出（panic 或被中止）。
    #[error("accept worker aborted: {0}")]
    AcceptLoop(#[source] tokio::task::JoinError),
}

impl ReactorError {
    /// 返回稳定错误码。
    pub fn code(&self) -> &'static str {
        match self {
            ReactorError::Io { kind, .. } => kind.code,
            ReactorError::Cancelled { .. } => CANCEL_CODE,
            ReactorError::PoolRetired { .. } => POOL_RETIRED_CODE,
            ReactorError::ListenerDisposed { .. } => LISTENER_DISPOSED_CODE,
            ReactorError::ProtocolOverflow { .. } => PROTOCOL_OVERFLOW_CODE,
            ReactorError::Config(_) => CONFIG_CODE,
            ReactorError::AcceptLoop(_) => ACCEPT_LOOP_CODE,
        }
    }

    /// 返回错误分类。
    pub fn category(&self) -> ErrorCategory {
        match self {
            ReactorError::Io { source, .. } => categorize_io_error(source),
            ReactorError::Cancelled { .. } => ErrorCategory::Cancelled,
            _ => ErrorCategory::NonRetryable,
        }
    }

    /// 是否为可重试的暂时性失败。
    pub fn is_transient(&self) -> bool {
        matches!(self.category(), ErrorCategory::Retryable(_))
    }
}

/// 将 IO 错误映射为反应器错误。
pub(crate) fn map_io_error(kind: OperationKind, error: io::Error) -> ReactorError {
    ReactorError::Io {
        kind,
        source: error,
    }
}

/// 构造取消错误。
pub(crate) fn cancelled_error(kind: OperationKind) -> ReactorError {
    ReactorError::Cancelled { kind }
}

/// accept 失败的三种处置方式。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AcceptFailure {
    /// 回收上下文、释放准入名额后按建议时长重试。
    Transient(Duration),
    /// 监听套接字已被释放。
    Disposed,
    /// 其它不可恢复错误。
    Fatal,
}

/// 判定一次 accept 失败应如何处置。
///
/// - 监听套接字被关闭后，内核通常返回 `EBADF`/`EINVAL`，统一视为 `Disposed`；
/// - 权限与不支持类错误属于配置问题，重试无意义；
/// - 其余错误（含 `EMFILE` 等资源枯竭）一律按暂时性失败处理，由退避吸收抖动。
pub(crate) fn classify_accept_error(error: &io::Error) -> AcceptFailure {
    if is_disposed(error) {
        return AcceptFailure::Disposed;
    }
    match error.kind() {
        io::ErrorKind::PermissionDenied | io::ErrorKind::Unsupported => AcceptFailure::Fatal,
        _ => match categorize_io_error(error) {
            ErrorCategory::Retryable(after) => AcceptFailure::Transient(after),
            _ => AcceptFailure::Transient(Duration::from_millis(RESOURCE_BACKOFF_MS)),
        },
    }
}

fn is_disposed(error: &io::Error) -> bool {
    is_bad_descriptor(error) || matches!(error.kind(), io::ErrorKind::InvalidInput)
}

#[cfg(unix)]
fn is_bad_descriptor(error: &io::Error) -> bool {
    const EBADF: i32 = 9;
    error.raw_os_error() == Some(EBADF)
}

#[cfg(not(unix))]
fn is_bad_descriptor(_error: &io::Error) -> bool {
    false
}

fn categorize_io_error(error: &io::Error) -> ErrorCategory {
    use io::ErrorKind;
    match error.kind() {
        ErrorKind::TimedOut => ErrorCategory::Timeout,
        ErrorKind::WouldBlock | ErrorKind::Interrupted => {
            ErrorCategory::Retryable(Duration::from_millis(5))
        }
        ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::AddrInUse
        | ErrorKind::AddrNotAvailable
        | ErrorKind::BrokenPipe => ErrorCategory::Retryable(Duration::from_millis(50)),
        ErrorKind::WriteZero => ErrorCategory::Retryable(Duration::from_millis(10)),
        _ => ErrorCategory::NonRetryable,
    }
}

const RESOURCE_BACKOFF_MS: u64 = 100;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_reset_is_transient_accept_failure() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(
            classify_accept_error(&err),
            AcceptFailure::Transient(Duration::from_millis(50))
        );
    }

    #[test]
    fn invalid_input_is_treated_as_disposed_listener() {
        let err = io::Error::from(io::ErrorKind::InvalidInput);
        assert_eq!(classify_accept_error(&err), AcceptFailure::Disposed);
    }

    #[cfg(unix)]
    #[test]
    fn bad_descriptor_is_treated_as_disposed_listener() {
        let err = io::Error::from_raw_os_error(9);
        assert_eq!(classify_accept_error(&err), AcceptFailure::Disposed);
    }

    #[test]
    fn permission_denied_is_fatal() {
        let err = io::Error::from(io::ErrorKind::PermissionDenied);
        assert_eq!(classify_accept_error(&err), AcceptFailure::Fatal);
    }

    #[test]
    fn unknown_errors_back_off_as_resource_exhaustion() {
        let err = io::Error::other("too many open files");
        assert_eq!(
            classify_accept_error(&err),
            AcceptFailure::Transient(Duration::from_millis(RESOURCE_BACKOFF_MS))
        );
    }

    #[test]
    fn codes_are_stable() {
        let overflow = ReactorError::ProtocolOverflow {
            len: 9,
            capacity: 8,
        };
        assert_eq!(overflow.code(), "spark.reactor.protocol_overflow");
        assert_eq!(overflow.category(), ErrorCategory::NonRetryable);

        let cancelled = cancelled_error(ADMISSION);
        assert_eq!(cancelled.code(), "spark.reactor.cancelled");
        assert_eq!(cancelled.category(), ErrorCategory::Cancelled);
        assert_eq!(cancelled.to_string(), "admission acquire cancelled");

        let io = map_io_error(RECEIVE, io::Error::from(io::ErrorKind::BrokenPipe));
        assert_eq!(io.code(), "spark.reactor.receive_failed");
        assert!(io.is_transient());
    }
}
