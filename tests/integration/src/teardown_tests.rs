//! Channel Teardown Tests
//!
//! When a channel goes away every proxy over it dies, every reference the
//! peer held is returned exactly once, and calls in flight fail instead of
//! hanging.

mod common;

use comrpc::{ChannelConfig, ChannelState, Error, ErrorCode, Unknown};
use common::*;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_close_returns_lent_references() {
    init_logging();
    let lb = Loopback::new();
    let (calculator, proxy) = lb.calculator();
    let first = Recorder::new();
    let second = Recorder::new();

    let sink: Arc<dyn Sink> = first.clone();
    within(proxy.subscribe(Some(sink))).await.unwrap();
    let sink: Arc<dyn Sink> = second.clone();
    within(proxy.subscribe(Some(sink))).await.unwrap();
    assert_eq!(first.refs(), 2);
    assert_eq!(second.refs(), 2);
    assert_eq!(lb.client_admin.external_references(lb.client.id()), 2);

    within(lb.server.close()).await;
    within(lb.client.closed()).await;

    assert_eq!(lb.client.state(), ChannelState::Closed);
    assert_eq!(first.refs(), 1);
    assert_eq!(second.refs(), 1);
    assert_eq!(lb.client_admin.external_references(lb.client.id()), 0);
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 0);
    assert_eq!(lb.server_admin.proxy_count(lb.server.id()), 0);
    assert_eq!(lb.server_admin.external_references(lb.server.id()), 0);

    // The server's kept proxies are dead: releasing them sends nothing
    let sent = lb.requests_sent_by_server();
    assert_eq!(within(calculator.unsubscribe()).await.unwrap(), 2);
    assert_eq!(lb.requests_sent_by_server(), sent);
    assert_eq!(first.refs(), 1);
}

#[tokio::test]
async fn test_calls_on_dead_proxy_fail() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    assert_eq!(within(proxy.add(1, 1)).await.unwrap(), 2);

    within(lb.client.close()).await;

    let result = proxy.add(1, 1).await;
    assert!(matches!(result, Err(Error::ChannelClosed(_))));
    assert_eq!(proxy.release().await, ErrorCode::DestructionSucceeded);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_pending_call_fails_on_close() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    let stall = Stall::new();

    let sink: Arc<dyn Sink> = stall.clone();
    let call = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.report_to(Some(sink), 1).await }
    });
    within(stall.entered.notified()).await;
    assert!(lb.client.pending_calls() >= 1);

    within(lb.client.close()).await;
    let result = within(call).await.unwrap();
    assert!(matches!(result, Err(Error::ChannelClosed(_))));
    assert_eq!(lb.client.pending_calls(), 0);

    stall.release.notify_one();
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_clears_timed_out_call() {
    init_logging();
    let lb = Loopback::with_configs(
        ChannelConfig::default(),
        ChannelConfig::default().with_call_timeout(Duration::from_millis(200)),
    );
    let (_calculator, proxy) = lb.calculator();
    let stall = Stall::new();

    let sink: Arc<dyn Sink> = stall.clone();
    let stalled = tokio::spawn({
        let proxy = proxy.clone();
        async move { proxy.report_to(Some(sink), 1).await }
    });
    stall.entered.notified().await;

    // The caller gave up, but the call is still registered
    let result = stalled.await.unwrap();
    assert!(matches!(result, Err(Error::Timeout)));
    assert_eq!(lb.client.pending_calls(), 1);
    assert_eq!(lb.client.stats().snapshot().timeouts, 1);

    stall.release.notify_one();
    assert!(wait_until(Duration::from_secs(1), || lb.client.pending_calls() == 0).await);
    assert_eq!(proxy.add(2, 2).await.unwrap(), 4);
}

#[tokio::test]
async fn test_close_is_idempotent() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, _proxy) = lb.calculator();

    within(lb.server.close()).await;
    within(lb.server.close()).await;
    within(lb.client.closed()).await;

    assert!(lb.server.is_closed());
    assert_eq!(lb.server.state(), ChannelState::Closed);
    assert_eq!(lb.server_admin.external_references(lb.server.id()), 0);
}
