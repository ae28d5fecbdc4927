//! 反应器端到端契约：准入上限、协议溢出隔离、有界关闭与并发会话隔离。
//!
//! # 教案式说明
//! - **Why**：监听器、准入闸门、资源池与会话状态机只有组合在一起才能体现“恰好一次释放”与
//!   “关闭有上界”这类跨组件不变式，单元测试无法覆盖；
//! - **How**：每个用例在回环地址上启动真实的反应器，以 Tokio `TcpStream` 扮演客户端；
//! - **What**：断言失败时 panic，并附带期望行为的中文说明。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use proptest::prelude::*;
use proptest::test_runner::{Config as ProptestConfig, TestCaseError, TestRunner};
use spark_reactor::{
    EchoHandler, Listener, ListenerConfig, ListenerHandle, ReceiveHandler, ShutdownPhase,
    ShutdownSignal,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

const IO_TIMEOUT: Duration = Duration::from_secs(3);
/// 关闭耗时相对 `timeout` 允许的调度抖动。
const SCHEDULING_SLACK: Duration = Duration::from_millis(100);

fn start(
    config: ListenerConfig,
    handler: Arc<dyn ReceiveHandler>,
) -> anyhow::Result<ListenerHandle> {
    let listener = Listener::bind_shared(config, handler, ShutdownSignal::new())
        .context("绑定回环地址")?;
    Ok(listener.start()?)
}

fn loopback_config() -> spark_reactor::ListenerConfigBuilder {
    ListenerConfig::builder("127.0.0.1:0".parse().expect("loopback"))
}

async fn exchange(client: &mut TcpStream, payload: &[u8]) -> anyhow::Result<Vec<u8>> {
    client.write_all(payload).await?;
    let mut reply = vec![0u8; payload.len()];
    tokio::time::timeout(IO_TIMEOUT, client.read_exact(&mut reply))
        .await
        .context("等待回显超时")??;
    Ok(reply)
}

async fn wait_for_active(handle: &ListenerHandle, expected: usize) -> anyhow::Result<()> {
    tokio::time::timeout(IO_TIMEOUT, async {
        while handle.active_connections() != expected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .with_context(|| {
        format!(
            "活跃连接数未收敛到 {expected}，当前为 {}",
            handle.active_connections()
        )
    })
}

/// 读到对端关闭为止，返回期间收到的全部字节；连接被重置视为关闭。
async fn drain_until_closed(client: &mut TcpStream) -> anyhow::Result<Vec<u8>> {
    let mut received = Vec::new();
    let read = tokio::time::timeout(IO_TIMEOUT, client.read_to_end(&mut received))
        .await
        .context("服务端未关闭连接")?;
    if let Err(error) = read {
        anyhow::ensure!(
            matches!(
                error.kind(),
                std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::ConnectionAborted
            ),
            "非预期的读取错误: {error}"
        );
    }
    Ok(received)
}

#[tokio::test(flavor = "multi_thread")]
async fn echo_round_trip_and_peer_close() -> anyhow::Result<()> {
    let handle = start(loopback_config().build()?, Arc::new(EchoHandler))?;
    let mut client = TcpStream::connect(handle.local_addr()).await?;

    assert_eq!(exchange(&mut client, b"hello reactor").await?, b"hello reactor");
    assert_eq!(exchange(&mut client, b"again").await?, b"again");
    wait_for_active(&handle, 1).await?;

    drop(client);
    wait_for_active(&handle, 0).await?;
    let stats = handle.stats();
    assert_eq!(stats.receive.leased, 0, "关闭后接收上下文必须归还");
    assert_eq!(stats.send.leased, 0, "关闭后发送上下文必须归还");
    assert_eq!(stats.receive.idle, 1);

    let report = handle.shutdown(Duration::from_secs(1)).await;
    assert!(report.is_graceful());
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn admission_gate_defers_connection_beyond_limit() -> anyhow::Result<()> {
    let config = loopback_config()
        .max_connections(2)
        .max_simultaneous_accept_ops(4)
        .build()?;
    let handle = start(config, Arc::new(EchoHandler))?;

    let mut first = TcpStream::connect(handle.local_addr()).await?;
    let mut second = TcpStream::connect(handle.local_addr()).await?;
    assert_eq!(exchange(&mut first, b"one").await?, b"one");
    assert_eq!(exchange(&mut second, b"two").await?, b"two");
    wait_for_active(&handle, 2).await?;

    let mut third = TcpStream::connect(handle.local_addr()).await?;
    third.write_all(b"three").await?;
    let mut reply = [0u8; 5];
    let early = tokio::time::timeout(Duration::from_millis(200), third.read_exact(&mut reply)).await;
    assert!(early.is_err(), "名额耗尽时第 M+1 个连接不得被服务");
    assert_eq!(handle.active_connections(), 2);

    drop(first);
    tokio::time::timeout(IO_TIMEOUT, third.read_exact(&mut reply))
        .await
        .context("释放名额后第三个连接应被接入")??;
    assert_eq!(&reply, b"three");
    assert!(handle.active_connections() <= 2);
    let accept = handle.stats().accept;
    assert_eq!(accept.capacity, 4, "accept 池与工作者数量一致");
    assert_eq!(accept.misses, 0, "每个工作者都有专属的 accept 上下文");

    handle.shutdown(Duration::from_millis(100)).await;
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn protocol_overflow_closes_only_offending_connection() -> anyhow::Result<()> {
    let config = loopback_config().buffer_size(16).build()?;
    let handler = |frame: Bytes| {
        if frame.starts_with(b"big") {
            Bytes::from(vec![b'#'; 32])
        } else {
            frame
        }
    };
    let handle = start(config, Arc::new(handler))?;

    let mut healthy = TcpStream::connect(handle.local_addr()).await?;
    let mut offender = TcpStream::connect(handle.local_addr()).await?;
    assert_eq!(exchange(&mut healthy, b"ok").await?, b"ok");
    wait_for_active(&handle, 2).await?;

    offender.write_all(b"big please").await?;
    let received = drain_until_closed(&mut offender).await?;
    assert!(received.is_empty(), "溢出的响应不得发送任何字节");

    wait_for_active(&handle, 1).await?;
    assert_eq!(exchange(&mut healthy, b"still ok").await?, b"still ok");
    assert_eq!(handle.active_connections(), 1, "活跃计数只应递减一次");

    handle.shutdown(Duration::from_millis(100)).await;
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_is_bounded_with_idle_connections() -> anyhow::Result<()> {
    let handle = start(loopback_config().build()?, Arc::new(EchoHandler))?;
    let mut idle = TcpStream::connect(handle.local_addr()).await?;
    assert_eq!(exchange(&mut idle, b"warmup").await?, b"warmup");
    wait_for_active(&handle, 1).await?;

    let timeout = Duration::from_millis(150);
    let report = handle.shutdown(timeout).await;
    assert!(
        report.elapsed < timeout + SCHEDULING_SLACK,
        "关闭耗时 {:?} 超出上界",
        report.elapsed
    );
    assert_eq!(report.drained, 0);
    assert_eq!(report.forced, 1, "空闲连接应被强制关闭");
    assert!(report.remaining <= 1);

    let leftover = drain_until_closed(&mut idle).await?;
    assert!(leftover.is_empty());
    assert!(handle.stats().receive.retired);
    wait_for_active(&handle, 0).await?;
    assert_eq!(handle.coordinator().phase(), ShutdownPhase::Stopped);

    let refused = TcpStream::connect(handle.local_addr()).await;
    assert!(refused.is_err(), "关闭后监听套接字必须已释放");
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn shutdown_closes_socket_of_stalled_handler_within_timeout() -> anyhow::Result<()> {
    let entered = Arc::new(AtomicBool::new(false));
    let handler = {
        let entered = Arc::clone(&entered);
        move |frame: Bytes| {
            entered.store(true, Ordering::Release);
            std::thread::sleep(Duration::from_secs(2));
            frame
        }
    };
    let handle = start(loopback_config().build()?, Arc::new(handler))?;
    let mut client = TcpStream::connect(handle.local_addr()).await?;
    client.write_all(b"x").await?;
    tokio::time::timeout(IO_TIMEOUT, async {
        while !entered.load(Ordering::Acquire) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .context("处理器未被调用")?;

    let timeout = Duration::from_millis(100);
    let report = handle.shutdown(timeout).await;
    assert!(
        report.elapsed < timeout + SCHEDULING_SLACK,
        "处理器卡住时关闭耗时 {:?} 超出上界",
        report.elapsed
    );
    assert_eq!(report.forced, 1);
    assert_eq!(report.remaining, 1, "处理器仍在执行，会话尚未回收");
    assert_eq!(report.phase, ShutdownPhase::ForceClosing);

    // 处理器还要睡眠一秒以上，连接必须在此之前已被关闭。
    let mut received = Vec::new();
    let read = tokio::time::timeout(Duration::from_millis(500), client.read_to_end(&mut received))
        .await
        .context("关闭返回后客户端套接字仍未失效")?;
    assert!(read.map_or(true, |n| n == 0));
    assert!(received.is_empty());

    wait_for_active(&handle, 0).await?;
    assert_eq!(handle.coordinator().phase(), ShutdownPhase::Stopped);
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_observed_before_send_half_closes() -> anyhow::Result<()> {
    let handle = start(loopback_config().build()?, Arc::new(EchoHandler))?;
    let mut client = TcpStream::connect(handle.local_addr()).await?;
    assert_eq!(exchange(&mut client, b"first").await?, b"first");
    wait_for_active(&handle, 1).await?;

    let coordinator = handle.coordinator();
    let shutdown = tokio::spawn(async move { coordinator.shutdown(Duration::from_secs(2)).await });
    tokio::time::timeout(IO_TIMEOUT, async {
        while handle.coordinator().phase() == ShutdownPhase::Running {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .context("关闭流程未启动")?;

    // 会话可能已先一步半关闭，写入失败同样可以接受。
    let _ = client.write_all(b"late").await;
    let received = drain_until_closed(&mut client).await?;
    assert!(received.is_empty(), "观察到关闭信号后不得再回写");

    let report = shutdown.await?;
    assert_eq!(report.drained, 1);
    assert_eq!(report.forced, 0);
    assert!(report.is_graceful());
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_sessions_never_observe_foreign_bytes() -> anyhow::Result<()> {
    const CLIENTS: usize = 16;
    const ROUNDS: usize = 25;

    let config = loopback_config().max_connections(CLIENTS).buffer_size(256).build()?;
    let handle = start(config, Arc::new(EchoHandler))?;
    let addr = handle.local_addr();

    let mut tasks = tokio::task::JoinSet::new();
    for client_id in 0..CLIENTS {
        tasks.spawn(async move {
            let mut client = TcpStream::connect(addr).await?;
            for round in 0..ROUNDS {
                let payload = format!("client-{client_id:02}-round-{round:03}");
                let reply = exchange(&mut client, payload.as_bytes()).await?;
                anyhow::ensure!(
                    reply == payload.as_bytes(),
                    "会话 {client_id} 第 {round} 轮收到了不属于自己的数据"
                );
            }
            anyhow::Ok(())
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined??;
    }

    wait_for_active(&handle, 0).await?;
    let stats = handle.stats();
    assert!(stats.receive.idle <= stats.receive.capacity);
    assert!(stats.send.idle <= stats.send.capacity);
    assert_eq!(stats.receive.leased, 0);
    assert_eq!(stats.send.leased, 0);

    let report = handle.shutdown(Duration::from_secs(1)).await;
    assert!(report.is_graceful());
    handle.join().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn payload_filling_whole_buffer_echoes_intact() -> anyhow::Result<()> {
    const BUFFER: usize = 1024;
    let handle = start(
        loopback_config().buffer_size(BUFFER).build()?,
        Arc::new(EchoHandler),
    )?;
    let mut client = TcpStream::connect(handle.local_addr()).await?;

    let payload: Vec<u8> = (0..BUFFER).map(|i| (i % 251) as u8).collect();
    assert_eq!(exchange(&mut client, &payload).await?, payload);
    assert_eq!(exchange(&mut client, &payload[..1]).await?, &payload[..1]);

    drop(client);
    wait_for_active(&handle, 0).await?;
    let report = handle.shutdown(Duration::from_secs(1)).await;
    assert!(report.is_graceful());
    handle.join().await?;
    Ok(())
}

/// 任意字节、长度不超过缓冲容量的载荷都应原样回显。
#[test]
fn arbitrary_payloads_within_buffer_echo_intact() -> anyhow::Result<()> {
    const BUFFER: usize = 512;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()?;
    let handle = runtime.block_on(async {
        start(
            loopback_config().buffer_size(BUFFER).build()?,
            Arc::new(EchoHandler),
        )
    })?;
    let addr = handle.local_addr();

    let mut runner = TestRunner::new(ProptestConfig::with_cases(48));
    runner
        .run(
            &proptest::collection::vec(any::<u8>(), 1..=BUFFER),
            |payload| {
                let reply = runtime
                    .block_on(async {
                        let mut client = TcpStream::connect(addr).await?;
                        exchange(&mut client, &payload).await
                    })
                    .map_err(|error| TestCaseError::fail(format!("{error:#}")))?;
                prop_assert_eq!(reply, payload);
                Ok(())
            },
        )
        .map_err(|error| anyhow::anyhow!("{error}"))?;

    let report = runtime.block_on(async {
        wait_for_active(&handle, 0).await?;
        anyhow::Ok(handle.shutdown(Duration::from_secs(1)).await)
    })?;
    assert!(report.is_graceful());
    runtime.block_on(handle.join())?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread")]
async fn bind_conflict_is_reported_synchronously() -> anyhow::Result<()> {
    let occupied = std::net::TcpListener::bind("127.0.0.1:0")?;
    let config = ListenerConfig::builder(occupied.local_addr()?).build()?;
    let err = Listener::bind(config, EchoHandler, ShutdownSignal::new())
        .expect_err("端口已被占用时绑定必须失败");
    assert_eq!(err.code(), "spark.reactor.bind_failed");
    Ok(())
}
