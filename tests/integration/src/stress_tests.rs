//! Stress Tests - Concurrency on Shared Channels and Proxies
//!
//! These tests exercise race conditions by:
//! - Issuing many calls in parallel over one channel
//! - Racing AddRef/Release and QueryInterface on one proxy
//! - Churning client connections against a Communicator
//! - Fanning callbacks out to many subscribers under load
//! - Releasing a callback while its AddRef is still on the wire
//! - Keeping one caller's calls in order on a single worker

mod common;

use comrpc::{
    AnnounceHandler, ChannelConfig, ClassRegistry, Communicator, CommunicatorClient, CommunicatorConfig,
    InterfacePtr, Unknown,
};
use common::*;
use futures::future::join_all;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Barrier;

/// Test: Many tasks calling through one proxy at once
/// Replies must reach the caller that sent the request
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_parallel_calls_shared_proxy() {
    init_logging();

    const TASKS: u32 = 20;
    const CALLS_PER_TASK: u32 = 50;

    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    let barrier = Arc::new(Barrier::new(TASKS as usize));
    let failures = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..TASKS)
        .map(|task| {
            let proxy = proxy.clone();
            let barrier = barrier.clone();
            let failures = failures.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                for call in 0..CALLS_PER_TASK {
                    match proxy.add(task * 1000, call).await {
                        Ok(sum) if sum == task * 1000 + call => {}
                        Ok(sum) => {
                            eprintln!("Task {} call {}: wrong sum {}", task, call, sum);
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            eprintln!("Task {} call {} failed: {}", task, call, e);
                            failures.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();

    for result in join_all(handles).await {
        result.unwrap();
    }

    let elapsed = start.elapsed();
    println!(
        "{} calls in {:?} ({:.0} calls/sec)",
        TASKS * CALLS_PER_TASK,
        elapsed,
        (TASKS * CALLS_PER_TASK) as f64 / elapsed.as_secs_f64()
    );

    assert_eq!(failures.load(Ordering::Relaxed), 0);
    assert_eq!(lb.requests_sent_by_client(), u64::from(TASKS * CALLS_PER_TASK));
    assert_eq!(lb.client.pending_calls(), 0);
}

/// Test: AddRef/Release races on a proxy that never reaches zero
/// No Release may go out while another reference is still held
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_add_ref_release_race() {
    init_logging();

    const TASKS: usize = 16;
    const ROUNDS: usize = 200;

    let lb = Loopback::new();
    let calculator = CalculatorImpl::new();
    let proxy = lb.lend(&calculator.ptr());
    let core = lb.client_admin.find_proxy(&proxy).unwrap();
    let barrier = Arc::new(Barrier::new(TASKS));

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let proxy = proxy.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                for _ in 0..ROUNDS {
                    proxy.add_ref();
                    tokio::task::yield_now().await;
                    proxy.release().await;
                }
            })
        })
        .collect();

    for result in join_all(handles).await {
        result.unwrap();
    }

    assert_eq!(core.local_refs(), 1);
    assert_eq!(core.remote_refs(), 1);
    assert_eq!(lb.requests_sent_by_client(), 0);

    let instance = lb.server_admin.register_instance(&calculator.ptr());
    assert_eq!(
        lb.server_admin.external_count(lb.server.id(), instance, ID_CALCULATOR),
        1
    );
}

/// Test: Concurrent QueryInterface for the same remote interface
/// Every caller ends up with the same proxy and all references go home
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_concurrent_query_interface() {
    init_logging();

    const TASKS: usize = 16;

    let lb = Loopback::new();
    let calculator = CalculatorImpl::new();
    let proxy = lb.lend(&calculator.ptr());
    let barrier = Arc::new(Barrier::new(TASKS));

    let handles: Vec<_> = (0..TASKS)
        .map(|_| {
            let proxy = proxy.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                proxy.query_interface(ID_SINK).await
            })
        })
        .collect();

    let sinks: Vec<InterfacePtr> = join_all(handles)
        .await
        .into_iter()
        .map(|result| result.unwrap().expect("calculator is a sink"))
        .collect();

    for sink in &sinks[1..] {
        assert!(sink.same_object(&sinks[0]));
    }
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 2);

    for sink in &sinks {
        sink.release().await;
    }
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 1);

    let instance = lb.server_admin.register_instance(&calculator.ptr());
    assert_eq!(lb.server_admin.external_count(lb.server.id(), instance, ID_SINK), 0);
    assert_eq!(
        lb.server_admin.external_count(lb.server.id(), instance, ID_CALCULATOR),
        1
    );
}

/// Test: Clients connecting, calling and leaving in parallel
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_connection_churn() {
    init_logging();

    const CLIENTS: usize = 20;

    let registry = ClassRegistry::new();
    registry.register("Calculator", |interface, _| {
        (interface == ID_CALCULATOR).then(|| CalculatorImpl::new().ptr())
    });
    let handler: Arc<dyn AnnounceHandler> = Arc::new(registry);
    let config = CommunicatorConfig::new("127.0.0.1:0".parse().unwrap());
    let server = Communicator::open(config, administrator(), handler).await.unwrap();
    let endpoint = server.endpoint().clone();
    let barrier = Arc::new(Barrier::new(CLIENTS));

    let handles: Vec<_> = (0..CLIENTS as u32)
        .map(|id| {
            let endpoint = endpoint.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                let client = CommunicatorClient::new(endpoint, administrator());
                let calculator = client
                    .open_acquire(TEST_TIMEOUT, "Calculator", ID_CALCULATOR, 0)
                    .await
                    .unwrap()
                    .unwrap()
                    .query::<dyn Calculator>()
                    .unwrap();
                assert_eq!(calculator.add(id, id).await.unwrap(), id * 2);
                calculator.release().await;
                client.close().await;
            })
        })
        .collect();

    for result in join_all(handles).await {
        result.unwrap();
    }

    assert!(wait_until(Duration::from_secs(5), || server.connection_count() == 0).await);
    let stats = server.stats().snapshot();
    assert_eq!(stats.connections_accepted, CLIENTS as u64);
    assert_eq!(stats.connections_rejected, 0);
}

/// Test: Every call fans out to every subscriber
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_callback_fan_out_under_load() {
    init_logging();

    const SUBSCRIBERS: usize = 8;
    const CALLS: u32 = 100;

    let lb = Loopback::new();
    let (calculator, proxy) = lb.calculator();
    let recorders: Vec<_> = (0..SUBSCRIBERS).map(|_| Recorder::new()).collect();

    let subscriptions = recorders.iter().map(|recorder| {
        let proxy = proxy.clone();
        let sink: Arc<dyn Sink> = recorder.clone();
        async move { proxy.subscribe(Some(sink)).await }
    });
    for result in join_all(subscriptions).await {
        result.unwrap();
    }
    assert_eq!(calculator.subscriber_count(), SUBSCRIBERS);

    let calls = (0..CALLS).map(|value| {
        let proxy = proxy.clone();
        async move { proxy.add(value, 0).await }
    });
    for result in within(join_all(calls)).await {
        result.unwrap();
    }

    let expected: u32 = (0..CALLS).sum();
    for recorder in &recorders {
        assert_eq!(recorder.values().len(), CALLS as usize);
        assert_eq!(recorder.values().iter().sum::<u32>(), expected);
        assert_eq!(recorder.refs(), 2);
    }

    assert_eq!(within(proxy.unsubscribe()).await.unwrap(), SUBSCRIBERS as u32);
    for recorder in &recorders {
        assert_eq!(recorder.refs(), 1);
    }
}

/// Test: A kept callback released before the subscribe reply is written
/// The Release must never overtake the piggybacked AddRef it undoes
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_release_never_overtakes_add_ref() {
    init_logging();

    const ROUNDS: usize = 200;

    let lb = Loopback::new();
    let (calculator, proxy) = lb.calculator();

    for round in 0..ROUNDS {
        let recorder = Recorder::new();
        let unsubscriber = tokio::spawn({
            let calculator = calculator.clone();
            async move {
                while calculator.subscriber_count() == 0 {
                    tokio::task::yield_now().await;
                }
                calculator.unsubscribe().await
            }
        });

        let sink: Arc<dyn Sink> = recorder.clone();
        within(proxy.subscribe(Some(sink))).await.unwrap();
        assert_eq!(within(unsubscriber).await.unwrap().unwrap(), 1);

        let settled = wait_until(Duration::from_secs(5), || {
            recorder.refs() == 1 && lb.client_admin.external_references(lb.client.id()) == 0
        })
        .await;
        assert!(
            settled,
            "round {}: {} refs, {} lent",
            round,
            recorder.refs(),
            lb.client_admin.external_references(lb.client.id())
        );
    }
    assert!(wait_until(Duration::from_secs(5), || lb.server_admin.proxy_count(lb.server.id()) == 0).await);
}

/// Test: One worker serves a caller's pipelined calls in arrival order
#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn test_single_worker_keeps_call_order() {
    init_logging();

    const CALLS: u32 = 20;

    let lb = Loopback::with_configs(
        ChannelConfig::default().with_worker_threads(1),
        ChannelConfig::default(),
    );
    let recorder = Recorder::new();
    let sink = lb.lend(&recorder.ptr()).query::<dyn Sink>().unwrap();

    let calls = (0..CALLS).map(|value| {
        let sink = sink.clone();
        async move { sink.report(value).await }
    });
    for result in within(join_all(calls)).await {
        result.unwrap();
    }

    assert_eq!(recorder.values(), (0..CALLS).collect::<Vec<_>>());
}
