use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// 默认监听队列长度。
pub const DEFAULT_BACKLOG: u32 = 100;
/// 默认同时挂起的 accept 操作数量，同时也是 accept 上下文池容量。
pub const DEFAULT_MAX_SIMULTANEOUS_ACCEPT_OPS: usize = 10;
/// 默认最大并发连接数。
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;
/// 默认收发缓冲容量（64 KiB）。
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;
/// 默认每连接发送上下文倍数。
pub const DEFAULT_SENDERS_PER_CONNECTION: usize = 3;

/// 配置阶段的错误。
#[derive(Debug, Error)]
pub enum ConfigError {
    /// 某个数值型字段必须为正数。
    #[error("`{field}` must be greater than zero")]
    Zero { field: &'static str },
    /// 字段超过允许的上限。
    #[error("`{field}` = {value} exceeds the supported maximum of {max}")]
    TooLarge {
        field: &'static str,
        value: usize,
        max: usize,
    },
    /// TOML 解析失败。
    #[error("invalid listener configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// 读取配置文件失败。
    #[error("failed to read configuration file `{path}`: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// 监听器配置，构造后不可变。
///
/// # 教案式注释
///
/// ## 意图 (Why)
/// - 集中描述监听端点、队列长度、三类上下文池的容量与缓冲大小，
///   让 [`Listener`](crate::Listener) 在启动前一次性完成全部资源预算。
///
/// ## 契约 (What)
/// - `endpoint`：监听地址，端口为 0 时由内核分配；
/// - `backlog`：内核半连接/全连接队列长度；
/// - `max_simultaneous_accept_ops`：同时挂起的 accept 数量，即 accept 池容量；
/// - `max_connections`：准入闸门容量，也是接收池容量；
/// - `buffer_size`：每个接收/发送上下文的缓冲容量，同时是单次响应的上限；
/// - `senders_per_connection`：发送池容量 = `max_connections × senders_per_connection`。
///
/// ## 注意事项 (Trade-offs)
/// - 所有字段在 [`ListenerConfigBuilder::build`] 中统一校验，之后只读；
/// - 接收/发送池为惰性增长，`buffer_size × max_connections` 仅是峰值内存上界，
///   不会在启动时一次性分配。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListenerConfig {
    endpoint: SocketAddr,
    backlog: u32,
    max_simultaneous_accept_ops: usize,
    max_connections: usize,
    buffer_size: usize,
    senders_per_connection: usize,
}

impl ListenerConfig {
    /// 以监听地址创建 Builder，其余字段取默认值。
    pub fn builder(endpoint: SocketAddr) -> ListenerConfigBuilder {
        ListenerConfigBuilder::new(endpoint)
    }

    /// 从 TOML 文本解析配置。
    ///
    /// 缺省字段回落到默认值；`endpoint` 必填。
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let file: ListenerConfigFile = toml::from_str(input)?;
        file.into_builder().build()
    }

    /// 从 TOML 文件读取配置。
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let input = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&input)
    }

    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    pub fn backlog(&self) -> u32 {
        self.backlog
    }

    pub fn max_simultaneous_accept_ops(&self) -> usize {
        self.max_simultaneous_accept_ops
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn senders_per_connection(&self) -> usize {
        self.senders_per_connection
    }

    /// 接收上下文池容量。
    pub fn receive_pool_capacity(&self) -> usize {
        self.max_connections
    }

    /// 发送上下文池容量。
    pub fn send_pool_capacity(&self) -> usize {
        self.max_connections
            .saturating_mul(self.senders_per_connection)
    }
}

/// [`ListenerConfig`] 的建造器。
#[derive(Clone, Debug)]
pub struct ListenerConfigBuilder {
    endpoint: SocketAddr,
    backlog: u32,
    max_simultaneous_accept_ops: usize,
    max_connections: usize,
    buffer_size: usize,
    senders_per_connection: usize,
}

impl ListenerConfigBuilder {
    fn new(endpoint: SocketAddr) -> Self {
        Self {
            endpoint,
            backlog: DEFAULT_BACKLOG,
            max_simultaneous_accept_ops: DEFAULT_MAX_SIMULTANEOUS_ACCEPT_OPS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            buffer_size: DEFAULT_BUFFER_SIZE,
            senders_per_connection: DEFAULT_SENDERS_PER_CONNECTION,
        }
    }

    pub fn backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn max_simultaneous_accept_ops(mut self, ops: usize) -> Self {
        self.max_simultaneous_accept_ops = ops;
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    pub fn senders_per_connection(mut self, senders: usize) -> Self {
        self.senders_per_connection = senders;
        self
    }

    /// 校验并生成不可变配置。
    ///
    /// - 所有容量字段必须为正；
    /// - `backlog` 不得超过 `i32::MAX`（`listen(2)` 的参数类型）；
    /// - `max_connections` 不得超过 Tokio 信号量的许可上限。
    pub fn build(self) -> Result<ListenerConfig, ConfigError> {
        non_zero("backlog", self.backlog as usize)?;
        non_zero(
            "max_simultaneous_accept_ops",
            self.max_simultaneous_accept_ops,
        )?;
        non_zero("max_connections", self.max_connections)?;
        non_zero("buffer_size", self.buffer_size)?;
        non_zero("senders_per_connection", self.senders_per_connection)?;
        at_most("backlog", self.backlog as usize, i32::MAX as usize)?;
        at_most(
            "max_connections",
            self.max_connections,
            tokio::sync::Semaphore::MAX_PERMITS,
        )?;

        Ok(ListenerConfig {
            endpoint: self.endpoint,
            backlog: self.backlog,
            max_simultaneous_accept_ops: self.max_simultaneous_accept_ops,
            max_connections: self.max_connections,
            buffer_size: self.buffer_size,
            senders_per_connection: self.senders_per_connection,
        })
    }
}

fn non_zero(field: &'static str, value: usize) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::Zero { field });
    }
    Ok(())
}

fn at_most(field: &'static str, value: usize, max: usize) -> Result<(), ConfigError> {
    if value > max {
        return Err(ConfigError::TooLarge { field, value, max });
    }
    Ok(())
}

/// 配置文件的反序列化形态，缺省字段回落到 Builder 默认值。
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListenerConfigFile {
    endpoint: SocketAddr,
    backlog: Option<u32>,
    max_simultaneous_accept_ops: Option<usize>,
    max_connections: Option<usize>,
    buffer_size: Option<usize>,
    senders_per_connection: Option<usize>,
}

impl ListenerConfigFile {
    fn into_builder(self) -> ListenerConfigBuilder {
        let mut builder = ListenerConfigBuilder::new(self.endpoint);
        if let Some(backlog) = self.backlog {
            builder = builder.backlog(backlog);
        }
        if let Some(ops) = self.max_simultaneous_accept_ops {
            builder = builder.max_simultaneous_accept_ops(ops);
        }
        if let Some(max) = self.max_connections {
            builder = builder.max_connections(max);
        }
        if let Some(size) = self.buffer_size {
            builder = builder.buffer_size(size);
        }
        if let Some(senders) = self.senders_per_connection {
            builder = builder.senders_per_connection(senders);
        }
        builder
    }
}
