//! 回显服务：以 `EchoHandler` 运行反应器，收到 Ctrl-C 后执行有界关闭。
//!
//! # 使用方法
//! ```bash
//! cargo run --bin spark-reactor-echo -- --listen 127.0.0.1:7878
//! cargo run --bin spark-reactor-echo -- --config reactor.toml --shutdown-timeout-ms 3000
//! ```
//! - `--listen`：监听地址，其余配置取默认值；
//! - `--config`：TOML 配置文件，与 `--listen` 同时出现时以 `--listen` 覆盖其中的 `endpoint`；
//! - `--shutdown-timeout-ms`：优雅关闭等待上限，默认 5000。
//!
//! 日志级别通过 `RUST_LOG` 控制，缺省为 `info`。

use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use spark_reactor::{EchoHandler, Listener, ListenerConfig, ShutdownSignal};
use tracing_subscriber::EnvFilter;

const DEFAULT_ENDPOINT: &str = "127.0.0.1:7878";
const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

struct Args {
    config: Option<PathBuf>,
    listen: Option<SocketAddr>,
    shutdown_timeout: Duration,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config = load_config(&args)?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("构建 Tokio 运行时失败")?;
    runtime.block_on(serve(config, args.shutdown_timeout))
}

async fn serve(config: ListenerConfig, shutdown_timeout: Duration) -> anyhow::Result<()> {
    let signal = ShutdownSignal::new();
    let listener = Listener::bind(config, EchoHandler, signal).context("监听器绑定失败")?;
    let handle = listener.start().context("监听器启动失败")?;
    tracing::info!(endpoint = %handle.local_addr(), "echo reactor ready");

    let coordinator = handle.coordinator();
    let stopper = tokio::spawn(async move {
        if let Err(error) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %error, "failed to listen for ctrl-c, shutting down");
        }
        coordinator.shutdown(shutdown_timeout).await
    });

    handle.join().await.context("accept 循环异常终止")?;
    let report = stopper.await.context("关闭任务异常退出")?;
    if !report.is_graceful() {
        tracing::warn!(
            forced = report.forced,
            remaining = report.remaining,
            "shutdown completed with forced connections"
        );
    }
    Ok(())
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = env::args().skip(1);
    let mut parsed = Args {
        config: None,
        listen: None,
        shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
    };

    while let Some(flag) = args.next() {
        let mut value = |name: &str| {
            args.next()
                .ok_or_else(|| anyhow!("{name} 之后必须提供取值"))
        };
        match flag.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--listen" => {
                let raw = value("--listen")?;
                parsed.listen = Some(
                    raw.parse()
                        .with_context(|| format!("无法解析监听地址: {raw}"))?,
                );
            }
            "--shutdown-timeout-ms" => {
                let raw = value("--shutdown-timeout-ms")?;
                let millis: u64 = raw
                    .parse()
                    .with_context(|| format!("无法解析关闭超时: {raw}"))?;
                parsed.shutdown_timeout = Duration::from_millis(millis);
            }
            unknown => bail!(
                "未知参数: {unknown}\n用法: spark-reactor-echo [--config <path>] [--listen <addr>] [--shutdown-timeout-ms <ms>]"
            ),
        }
    }
    Ok(parsed)
}

fn load_config(args: &Args) -> anyhow::Result<ListenerConfig> {
    let config = match (&args.config, args.listen) {
        (Some(path), listen) => {
            let loaded = ListenerConfig::from_toml_file(path)
                .with_context(|| format!("读取配置失败: {}", path.display()))?;
            match listen {
                Some(endpoint) => rebuild_with_endpoint(&loaded, endpoint)?,
                None => loaded,
            }
        }
        (None, listen) => {
            let endpoint = match listen {
                Some(endpoint) => endpoint,
                None => DEFAULT_ENDPOINT.parse().context("默认监听地址非法")?,
            };
            ListenerConfig::builder(endpoint).build()?
        }
    };
    Ok(config)
}

fn rebuild_with_endpoint(
    loaded: &ListenerConfig,
    endpoint: SocketAddr,
) -> anyhow::Result<ListenerConfig> {
    Ok(ListenerConfig::builder(endpoint)
        .backlog(loaded.backlog())
        .max_simultaneous_accept_ops(loaded.max_simultaneous_accept_ops())
        .max_connections(loaded.max_connections())
        .buffer_size(loaded.buffer_size())
        .senders_per_connection(loaded.senders_per_connection())
        .build()?)
}
