//! Reference Counting Tests
//!
//! Verify that references crossing a channel are accounted exactly:
//! - Borrowed callbacks cost no extra traffic
//! - Kept callbacks piggyback their AddRef on the response
//! - Releases issued while serving a call ride on its response
//! - One proxy per (channel, instance, interface)
//! - An instance is reachable only over the channel it was lent on

mod common;

use comrpc::{method, ErrorCode, Error, InterfacePtr, ProxyState, RemoteIterator, Unknown};
use common::*;
use std::sync::Arc;

#[tokio::test]
async fn test_borrowed_callback_costs_nothing() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    let recorder = Recorder::new();

    let sink: Arc<dyn Sink> = recorder.clone();
    within(proxy.report_to(Some(sink), 7)).await.unwrap();

    assert_eq!(recorder.values(), vec![7]);
    assert_eq!(recorder.refs(), 1);
    assert_eq!(lb.server_admin.proxy_count(lb.server.id()), 0);
    assert_eq!(lb.client_admin.external_references(lb.client.id()), 0);
    // One call out, one callback in, nothing else
    assert_eq!(lb.requests_sent_by_client(), 1);
    assert_eq!(lb.requests_sent_by_server(), 1);
}

#[tokio::test]
async fn test_kept_callback_piggybacks_add_ref() {
    init_logging();
    let lb = Loopback::new();
    let (calculator, proxy) = lb.calculator();
    let recorder = Recorder::new();

    let sink: Arc<dyn Sink> = recorder.clone();
    within(proxy.subscribe(Some(sink))).await.unwrap();

    let instance = lb.client_admin.register_instance(&recorder.ptr());
    assert_eq!(calculator.subscriber_count(), 1);
    assert_eq!(recorder.refs(), 2);
    assert_eq!(lb.client_admin.external_count(lb.client.id(), instance, ID_SINK), 1);
    assert_eq!(lb.server_admin.proxy_count(lb.server.id()), 1);
    assert_eq!(lb.requests_sent_by_client(), 1);
    assert_eq!(lb.requests_sent_by_server(), 0);

    assert_eq!(within(proxy.add(2, 3)).await.unwrap(), 5);
    assert_eq!(recorder.values(), vec![5]);

    // The Release is issued while serving unsubscribe and rides on its response
    assert_eq!(within(proxy.unsubscribe()).await.unwrap(), 1);
    assert_eq!(recorder.refs(), 1);
    assert_eq!(lb.client_admin.external_count(lb.client.id(), instance, ID_SINK), 0);
    assert_eq!(lb.server_admin.proxy_count(lb.server.id()), 0);
    assert_eq!(lb.requests_sent_by_client(), 3);
    // Only the report callback during add
    assert_eq!(lb.requests_sent_by_server(), 1);
}

#[tokio::test]
async fn test_echo_returns_own_object() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    let recorder = Recorder::new();

    let sink: Arc<dyn Sink> = recorder.clone();
    let echoed = within(proxy.echo(Some(sink))).await.unwrap().unwrap();

    let echoed = InterfacePtr::new::<dyn Sink>(echoed);
    assert!(echoed.same_object(&recorder.ptr()));
    assert!(lb.client_admin.find_proxy(&echoed).is_none());
    assert_eq!(recorder.refs(), 2);
    assert_eq!(lb.server_admin.proxy_count(lb.server.id()), 0);

    echoed.release().await;
    assert_eq!(recorder.refs(), 1);
}

#[tokio::test]
async fn test_returned_object_released_remotely() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    assert_eq!(lb.server_admin.external_references(lb.server.id()), 1);

    let sink = within(proxy.create_sink()).await.unwrap().unwrap();
    assert_eq!(lb.server_admin.external_references(lb.server.id()), 2);

    within(sink.report(3)).await.unwrap();
    within(sink.report(4)).await.unwrap();
    assert_eq!(within(sink.total()).await.unwrap(), 7);

    let core = lb
        .client_admin
        .find_proxy(&InterfacePtr::new::<dyn Sink>(sink.clone()))
        .unwrap();
    assert_eq!(core.state(), ProxyState::Steady);
    assert_eq!(core.remote_refs(), 1);

    assert_eq!(sink.release().await, ErrorCode::DestructionSucceeded);
    assert_eq!(core.state(), ProxyState::Destroyed);
    assert_eq!(lb.server_admin.external_references(lb.server.id()), 1);
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 1);

    // A destroyed proxy refuses further calls
    assert!(matches!(sink.total().await, Err(Error::UnknownInstance(_))));
}

#[tokio::test]
async fn test_single_proxy_per_instance() {
    init_logging();
    let lb = Loopback::new();
    let calculator = CalculatorImpl::new();

    let first = lb.lend(&calculator.ptr());
    let second = lb.lend(&calculator.ptr());

    assert!(first.same_object(&second));
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 1);

    let core = lb.client_admin.find_proxy(&first).unwrap();
    assert_eq!(core.local_refs(), 2);
    assert_eq!(core.remote_refs(), 2);

    let instance = lb.server_admin.register_instance(&calculator.ptr());
    assert_eq!(
        lb.server_admin.external_count(lb.server.id(), instance, ID_CALCULATOR),
        2
    );

    // Both references go back with a single Release
    first.release().await;
    let sent = lb.requests_sent_by_client();
    second.release().await;
    assert_eq!(lb.requests_sent_by_client(), sent + 1);
    assert_eq!(
        lb.server_admin.external_count(lb.server.id(), instance, ID_CALCULATOR),
        0
    );
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 0);
}

#[tokio::test]
async fn test_query_interface_reuses_existing_proxy() {
    init_logging();
    let lb = Loopback::new();
    let calculator = CalculatorImpl::new();
    let proxy = lb.lend(&calculator.ptr());

    // Same interface: answered locally
    let same = within(proxy.query_interface(ID_CALCULATOR)).await.unwrap();
    assert!(same.same_object(&proxy));
    assert_eq!(lb.requests_sent_by_client(), 0);

    let sink = within(proxy.query_interface(ID_SINK)).await.unwrap();
    assert_eq!(sink.id(), ID_SINK);
    assert_eq!(lb.requests_sent_by_client(), 1);
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 2);

    // Second query finds the proxy created by the first
    let again = within(proxy.query_interface(ID_SINK)).await.unwrap();
    assert!(again.same_object(&sink));
    assert_eq!(lb.requests_sent_by_client(), 1);

    let typed = sink.query::<dyn Sink>().unwrap();
    within(typed.report(9)).await.unwrap();
    assert_eq!(within(typed.total()).await.unwrap(), 9);

    // Not implemented by the remote object
    assert!(within(proxy.query_interface(0x0fff)).await.is_none());

    again.release().await;
    sink.release().await;
    assert_eq!(lb.client_admin.proxy_count(lb.client.id()), 1);
}

#[tokio::test]
async fn test_remote_iterator() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();

    within(proxy.add(1, 2)).await.unwrap();
    within(proxy.add(3, 4)).await.unwrap();

    let history: Arc<dyn RemoteIterator<u32>> = within(proxy.history()).await.unwrap().unwrap();
    assert_eq!(within(history.count()).await.unwrap(), 2);
    assert!(!within(history.is_valid()).await.unwrap());
    assert_eq!(within(history.next()).await.unwrap(), Some(3));
    assert_eq!(within(history.next()).await.unwrap(), Some(7));
    assert_eq!(within(history.next()).await.unwrap(), None);
    within(history.reset(1)).await.unwrap();
    assert_eq!(within(history.current()).await.unwrap(), Some(3));

    assert_eq!(history.release().await, ErrorCode::DestructionSucceeded);
    assert_eq!(lb.server_admin.external_references(lb.server.id()), 1);
}

#[tokio::test]
async fn test_unknown_interface_and_method_are_safe() {
    init_logging();
    let lb = Loopback::new();
    let (calculator, proxy) = lb.calculator();
    let instance = lb.server_admin.register_instance(&calculator.ptr());

    // Server has no stub for the interface
    lb.server_admin.unregister_interface(ID_SINK);
    let sink = lb
        .client_admin
        .obtain_proxy(&lb.client, instance, ID_SINK, false, true)
        .unwrap();
    let core = lb.client_admin.find_proxy(&sink).unwrap();
    let result = within(core.call(method::FIRST).send()).await;
    assert!(matches!(result, Err(Error::Remote(ErrorCode::UnknownKey))));

    // Method index outside the table
    let calc_core = lb
        .client_admin
        .find_proxy(&InterfacePtr::new::<dyn Calculator>(proxy.clone()))
        .unwrap();
    let result = within(calc_core.call(method::FIRST + 100).send()).await;
    assert!(matches!(result, Err(Error::Remote(ErrorCode::UnknownKey))));

    // The channel survived both
    assert!(!lb.client.is_closed());
    assert_eq!(within(proxy.add(20, 22)).await.unwrap(), 42);
}

#[tokio::test]
async fn test_over_release_is_clamped() {
    init_logging();
    let lb = Loopback::new();
    let calculator = CalculatorImpl::new();
    let instance = lb.server_admin.register_external(&lb.server, &calculator.ptr());

    let code = lb.client.release_remote(instance, ID_CALCULATOR, 5).await;
    assert_eq!(code, ErrorCode::DestructionSucceeded);
    assert_eq!(
        lb.server_admin.external_count(lb.server.id(), instance, ID_CALCULATOR),
        0
    );

    let code = lb.client.release_remote(instance, ID_CALCULATOR, 1).await;
    assert_eq!(code, ErrorCode::UnknownKey);
}

#[tokio::test]
async fn test_instance_unreachable_from_other_channel() {
    init_logging();
    let server_admin = administrator();
    let client_admin = administrator();
    let other_admin = administrator();
    let (server, client) = connect(&server_admin, &client_admin);
    let (_other_server, other) = connect(&server_admin, &other_admin);

    let calculator = CalculatorImpl::new();
    let proxy = lend_over(&server_admin, &server, &client_admin, &client, &calculator.ptr())
        .query::<dyn Calculator>()
        .unwrap();
    let instance = server_admin.register_instance(&calculator.ptr());

    // Same instance id, but nothing was lent on this channel
    let guessed = other_admin
        .obtain_proxy(&other, instance, ID_CALCULATOR, true, false)
        .unwrap()
        .query::<dyn Calculator>()
        .unwrap();
    let result = within(guessed.add(1, 2)).await;
    assert!(matches!(result, Err(Error::Remote(ErrorCode::UnknownKey))));

    assert_eq!(within(proxy.add(1, 2)).await.unwrap(), 3);
    assert_eq!(calculator.subscriber_count(), 0);
}

#[tokio::test]
async fn test_borrowed_parameter_unreachable_after_call() {
    init_logging();
    let lb = Loopback::new();
    let (_calculator, proxy) = lb.calculator();
    let recorder = Recorder::new();

    let sink: Arc<dyn Sink> = recorder.clone();
    within(proxy.report_to(Some(sink), 7)).await.unwrap();
    assert_eq!(recorder.values(), vec![7]);
    assert_eq!(lb.client_admin.loaned(lb.client.id()), 0);

    // The call is over, so the server side can no longer reach the sink
    let instance = lb.client_admin.register_instance(&recorder.ptr());
    let stale = lb
        .server_admin
        .obtain_proxy(&lb.server, instance, ID_SINK, true, false)
        .unwrap()
        .query::<dyn Sink>()
        .unwrap();
    let result = within(stale.report(8)).await;
    assert!(matches!(result, Err(Error::Remote(ErrorCode::UnknownKey))));
    assert_eq!(recorder.values(), vec![7]);
}
