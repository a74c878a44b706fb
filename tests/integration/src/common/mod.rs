//! Common test utilities for integration tests
//!
//! Provides two test interfaces with hand-written proxy/stub pairs:
//!
//! - `Calculator`: arithmetic plus calls that take, keep, return and
//!   create `Sink` callbacks
//! - `Sink`: a callback receiving reported values
//!
//! and helpers to wire two administrators together over a loopback
//! channel.

#![allow(dead_code)]

use async_trait::async_trait;
use comrpc::{
    method, Administrator, CallContext, Channel, ChannelConfig, Error, ErrorCode, Frame,
    InterfaceId, InterfacePtr, InterfaceType, MethodIndex, ProxyCore, RemoteIterator, Result, Stub,
    Unknown, VecIterator, FIRST_USER_INTERFACE,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::time::Instant;
use tracing_subscriber::EnvFilter;

pub const ID_CALCULATOR: InterfaceId = FIRST_USER_INTERFACE + 1;
pub const ID_SINK: InterfaceId = FIRST_USER_INTERFACE + 2;

/// Default timeout for test operations
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

static INIT: Once = Once::new();

/// Initialize test logging; `RUST_LOG` overrides the default filter
pub fn init_logging() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Poll `condition` until it holds or `timeout` expires
pub async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Await `future`, failing the test if it takes longer than [`TEST_TIMEOUT`]
pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TEST_TIMEOUT, future)
        .await
        .expect("operation did not complete in time")
}

// ============================================================================
// Sink
// ============================================================================

const SINK_REPORT: MethodIndex = method::FIRST;
const SINK_TOTAL: MethodIndex = method::FIRST + 1;

#[async_trait]
pub trait Sink: Unknown {
    async fn report(&self, value: u32) -> Result<()>;

    async fn total(&self) -> Result<u32>;
}

impl InterfaceType for dyn Sink {
    const ID: InterfaceId = ID_SINK;
    const NAME: &'static str = "Sink";
}

/// Sink recording every value, with a visible reference count
///
/// Starts with the creator's reference.
pub struct Recorder {
    values: Mutex<Vec<u32>>,
    refs: AtomicU32,
}

impl Recorder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            values: Mutex::new(Vec::new()),
            refs: AtomicU32::new(1),
        })
    }

    pub fn values(&self) -> Vec<u32> {
        self.values.lock().clone()
    }

    pub fn refs(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn ptr(self: &Arc<Self>) -> InterfacePtr {
        InterfacePtr::new::<dyn Sink>(self.clone())
    }
}

#[async_trait]
impl Unknown for Recorder {
    fn add_ref(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    async fn release(&self) -> ErrorCode {
        let previous = self
            .refs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |refs| refs.checked_sub(1))
            .unwrap_or(0);
        if previous == 1 {
            ErrorCode::DestructionSucceeded
        } else {
            ErrorCode::None
        }
    }
}

#[async_trait]
impl Sink for Recorder {
    async fn report(&self, value: u32) -> Result<()> {
        self.values.lock().push(value);
        Ok(())
    }

    async fn total(&self) -> Result<u32> {
        Ok(self.values.lock().iter().sum())
    }
}

/// Sink whose `report` never returns until released
pub struct Stall {
    pub entered: tokio::sync::Notify,
    pub release: tokio::sync::Notify,
}

impl Stall {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entered: tokio::sync::Notify::new(),
            release: tokio::sync::Notify::new(),
        })
    }
}

impl Unknown for Stall {}

#[async_trait]
impl Sink for Stall {
    async fn report(&self, _value: u32) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }

    async fn total(&self) -> Result<u32> {
        Ok(0)
    }
}

pub struct SinkStub;

#[async_trait]
impl Stub for SinkStub {
    async fn handle(
        &self,
        method: MethodIndex,
        target: &InterfacePtr,
        _context: &mut CallContext,
        params: Frame,
    ) -> Result<Frame> {
        let sink = target
            .query::<dyn Sink>()
            .ok_or(Error::UnknownInterface(ID_SINK))?;
        let mut result = Frame::new();
        match method {
            SINK_REPORT => sink.report(params.reader().number()?).await?,
            SINK_TOTAL => {
                result.push_number(sink.total().await?);
            }
            _ => {
                return Err(Error::UnknownMethod {
                    interface: ID_SINK,
                    method,
                })
            }
        }
        Ok(result)
    }
}

pub struct SinkProxy {
    core: Arc<ProxyCore>,
}

comrpc::proxy_unknown!(SinkProxy, dyn Sink);

#[async_trait]
impl Sink for SinkProxy {
    async fn report(&self, value: u32) -> Result<()> {
        let mut call = self.core.call(SINK_REPORT);
        call.number(value);
        call.send().await?;
        Ok(())
    }

    async fn total(&self) -> Result<u32> {
        let reply = self.core.call(SINK_TOTAL).send().await?;
        Ok(reply.reader().number()?)
    }
}

// ============================================================================
// Calculator
// ============================================================================

const CALC_ADD: MethodIndex = method::FIRST;
const CALC_SUBSCRIBE: MethodIndex = method::FIRST + 1;
const CALC_UNSUBSCRIBE: MethodIndex = method::FIRST + 2;
const CALC_REPORT_TO: MethodIndex = method::FIRST + 3;
const CALC_ECHO: MethodIndex = method::FIRST + 4;
const CALC_CREATE_SINK: MethodIndex = method::FIRST + 5;
const CALC_HISTORY: MethodIndex = method::FIRST + 6;

#[async_trait]
pub trait Calculator: Unknown {
    /// Sum, also reported to every subscribed sink
    async fn add(&self, a: u32, b: u32) -> Result<u32>;

    /// Keep `sink` until `unsubscribe`
    async fn subscribe(&self, sink: Option<Arc<dyn Sink>>) -> Result<()>;

    /// Drop every kept sink; returns how many there were
    async fn unsubscribe(&self) -> Result<u32>;

    /// Report `value` to `sink` without keeping it
    async fn report_to(&self, sink: Option<Arc<dyn Sink>>, value: u32) -> Result<()>;

    /// Hand `sink` straight back
    async fn echo(&self, sink: Option<Arc<dyn Sink>>) -> Result<Option<Arc<dyn Sink>>>;

    /// New sink living next to the calculator
    async fn create_sink(&self) -> Result<Option<Arc<dyn Sink>>>;

    /// Iterator over every sum computed so far
    async fn history(&self) -> Result<Option<Arc<dyn RemoteIterator<u32>>>>;
}

impl InterfaceType for dyn Calculator {
    const ID: InterfaceId = ID_CALCULATOR;
    const NAME: &'static str = "Calculator";
}

/// Calculator that is also a `Sink` accumulating what is reported to it
pub struct CalculatorImpl {
    subscribers: Mutex<Vec<Arc<dyn Sink>>>,
    history: Mutex<Vec<u32>>,
    accumulated: AtomicU32,
}

impl CalculatorImpl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            subscribers: Mutex::new(Vec::new()),
            history: Mutex::new(Vec::new()),
            accumulated: AtomicU32::new(0),
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    pub fn ptr(self: &Arc<Self>) -> InterfacePtr {
        InterfacePtr::new::<dyn Calculator>(self.clone())
    }
}

#[async_trait]
impl Unknown for CalculatorImpl {
    fn query_interface(self: Arc<Self>, interface: InterfaceId) -> BoxFuture<'static, Option<InterfacePtr>> {
        let found = match interface {
            ID_CALCULATOR => Some(InterfacePtr::new::<dyn Calculator>(self)),
            ID_SINK => Some(InterfacePtr::new::<dyn Sink>(self)),
            _ => None,
        };
        Box::pin(async move { found })
    }
}

#[async_trait]
impl Calculator for CalculatorImpl {
    async fn add(&self, a: u32, b: u32) -> Result<u32> {
        let sum = a.wrapping_add(b);
        self.history.lock().push(sum);
        let subscribers = self.subscribers.lock().clone();
        for sink in subscribers {
            if let Err(e) = sink.report(sum).await {
                tracing::warn!("Subscriber failed: {}", e);
            }
        }
        Ok(sum)
    }

    async fn subscribe(&self, sink: Option<Arc<dyn Sink>>) -> Result<()> {
        let sink = sink.ok_or(Error::Remote(ErrorCode::BadRequest))?;
        sink.add_ref();
        self.subscribers.lock().push(sink);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<u32> {
        let subscribers = std::mem::take(&mut *self.subscribers.lock());
        let count = subscribers.len() as u32;
        for sink in subscribers {
            sink.release().await;
        }
        Ok(count)
    }

    async fn report_to(&self, sink: Option<Arc<dyn Sink>>, value: u32) -> Result<()> {
        match sink {
            Some(sink) => sink.report(value).await,
            None => Ok(()),
        }
    }

    async fn echo(&self, sink: Option<Arc<dyn Sink>>) -> Result<Option<Arc<dyn Sink>>> {
        if let Some(sink) = &sink {
            sink.add_ref();
        }
        Ok(sink)
    }

    async fn create_sink(&self) -> Result<Option<Arc<dyn Sink>>> {
        let sink: Arc<dyn Sink> = Recorder::new();
        Ok(Some(sink))
    }

    async fn history(&self) -> Result<Option<Arc<dyn RemoteIterator<u32>>>> {
        let iterator: Arc<dyn RemoteIterator<u32>> = VecIterator::new(self.history.lock().clone());
        Ok(Some(iterator))
    }
}

#[async_trait]
impl Sink for CalculatorImpl {
    async fn report(&self, value: u32) -> Result<()> {
        self.accumulated.fetch_add(value, Ordering::SeqCst);
        Ok(())
    }

    async fn total(&self) -> Result<u32> {
        Ok(self.accumulated.load(Ordering::SeqCst))
    }
}

pub struct CalculatorStub;

#[async_trait]
impl Stub for CalculatorStub {
    async fn handle(
        &self,
        method: MethodIndex,
        target: &InterfacePtr,
        context: &mut CallContext,
        params: Frame,
    ) -> Result<Frame> {
        let calculator = target
            .query::<dyn Calculator>()
            .ok_or(Error::UnknownInterface(ID_CALCULATOR))?;
        let mut reader = params.reader();
        let mut result = Frame::new();
        match method {
            CALC_ADD => {
                let a: u32 = reader.number()?;
                let b: u32 = reader.number()?;
                result.push_number(calculator.add(a, b).await?);
            }
            CALC_SUBSCRIBE => {
                let sink = context.import_as::<dyn Sink>(&mut reader).await?;
                calculator.subscribe(sink).await?;
            }
            CALC_UNSUBSCRIBE => {
                result.push_number(calculator.unsubscribe().await?);
            }
            CALC_REPORT_TO => {
                let sink = context.import_as::<dyn Sink>(&mut reader).await?;
                let value: u32 = reader.number()?;
                calculator.report_to(sink, value).await?;
            }
            CALC_ECHO => {
                let sink = context.import_as::<dyn Sink>(&mut reader).await?;
                let echoed = calculator.echo(sink).await?;
                context.export_as::<dyn Sink>(&mut result, echoed).await;
            }
            CALC_CREATE_SINK => {
                let created = calculator.create_sink().await?;
                context.export_as::<dyn Sink>(&mut result, created).await;
            }
            CALC_HISTORY => {
                let history = calculator.history().await?;
                context
                    .export_as::<dyn RemoteIterator<u32>>(&mut result, history)
                    .await;
            }
            _ => {
                return Err(Error::UnknownMethod {
                    interface: ID_CALCULATOR,
                    method,
                })
            }
        }
        Ok(result)
    }
}

pub struct CalculatorProxy {
    core: Arc<ProxyCore>,
}

comrpc::proxy_unknown!(CalculatorProxy, dyn Calculator);

#[async_trait]
impl Calculator for CalculatorProxy {
    async fn add(&self, a: u32, b: u32) -> Result<u32> {
        let mut call = self.core.call(CALC_ADD);
        call.number(a).number(b);
        let reply = call.send().await?;
        Ok(reply.reader().number()?)
    }

    async fn subscribe(&self, sink: Option<Arc<dyn Sink>>) -> Result<()> {
        let mut call = self.core.call(CALC_SUBSCRIBE);
        call.interface_as::<dyn Sink>(sink.as_ref())?;
        call.send().await?;
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<u32> {
        let reply = self.core.call(CALC_UNSUBSCRIBE).send().await?;
        Ok(reply.reader().number()?)
    }

    async fn report_to(&self, sink: Option<Arc<dyn Sink>>, value: u32) -> Result<()> {
        let mut call = self.core.call(CALC_REPORT_TO);
        call.interface_as::<dyn Sink>(sink.as_ref())?.number(value);
        call.send().await?;
        Ok(())
    }

    async fn echo(&self, sink: Option<Arc<dyn Sink>>) -> Result<Option<Arc<dyn Sink>>> {
        let mut call = self.core.call(CALC_ECHO);
        call.interface_as::<dyn Sink>(sink.as_ref())?;
        let reply = call.send().await?;
        self.core.import_as::<dyn Sink>(&mut reply.reader()).await
    }

    async fn create_sink(&self) -> Result<Option<Arc<dyn Sink>>> {
        let reply = self.core.call(CALC_CREATE_SINK).send().await?;
        self.core.import_as::<dyn Sink>(&mut reply.reader()).await
    }

    async fn history(&self) -> Result<Option<Arc<dyn RemoteIterator<u32>>>> {
        let reply = self.core.call(CALC_HISTORY).send().await?;
        self.core
            .import_as::<dyn RemoteIterator<u32>>(&mut reply.reader())
            .await
    }
}

// ============================================================================
// Wiring
// ============================================================================

/// Register the test interfaces with `admin`
pub fn register_interfaces(admin: &Administrator) {
    admin.register_interface::<dyn Calculator, _, _>(CalculatorStub, |core| {
        InterfacePtr::new::<dyn Calculator>(Arc::new(CalculatorProxy { core }))
    });
    admin.register_interface::<dyn Sink, _, _>(SinkStub, |core| {
        InterfacePtr::new::<dyn Sink>(Arc::new(SinkProxy { core }))
    });
}

/// Administrator with the test interfaces registered
pub fn administrator() -> Arc<Administrator> {
    let admin = Administrator::new();
    register_interfaces(&admin);
    admin
}

/// Two administrators joined by an in-memory channel
pub struct Loopback {
    pub server_admin: Arc<Administrator>,
    pub client_admin: Arc<Administrator>,
    pub server: Arc<Channel>,
    pub client: Arc<Channel>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::default())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        Self::with_configs(config.clone(), config)
    }

    pub fn with_configs(server_config: ChannelConfig, client_config: ChannelConfig) -> Self {
        let server_admin = administrator();
        let client_admin = administrator();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let server = Channel::open(Box::new(a), "client", server_admin.clone(), None, server_config);
        let client = Channel::open(Box::new(b), "server", client_admin.clone(), None, client_config);
        Self {
            server_admin,
            client_admin,
            server,
            client,
        }
    }

    /// Lend `ptr` from the server side and return the client's proxy for it
    pub fn lend(&self, ptr: &InterfacePtr) -> InterfacePtr {
        let instance = self.server_admin.register_external(&self.server, ptr);
        self.client_admin
            .obtain_proxy(&self.client, instance, ptr.id(), true, false)
            .expect("proxy factory registered")
    }

    /// Lend a fresh calculator; returns the object and the client's proxy
    pub fn calculator(&self) -> (Arc<CalculatorImpl>, Arc<dyn Calculator>) {
        let calculator = CalculatorImpl::new();
        let proxy = self
            .lend(&calculator.ptr())
            .query::<dyn Calculator>()
            .expect("calculator proxy");
        (calculator, proxy)
    }

    pub fn requests_sent_by_client(&self) -> u64 {
        self.client.stats().snapshot().requests_sent
    }

    pub fn requests_sent_by_server(&self) -> u64 {
        self.server.stats().snapshot().requests_sent
    }
}

/// Join two administrators that already exist
pub fn connect(
    server_admin: &Arc<Administrator>,
    client_admin: &Arc<Administrator>,
) -> (Arc<Channel>, Arc<Channel>) {
    Channel::loopback(server_admin.clone(), client_admin.clone(), ChannelConfig::default())
}

/// Lend `ptr` over `server` and proxy it on `client`
pub fn lend_over(
    server_admin: &Administrator,
    server: &Channel,
    client_admin: &Administrator,
    client: &Arc<Channel>,
    ptr: &InterfacePtr,
) -> InterfacePtr {
    let instance = server_admin.register_external(server, ptr);
    client_admin
        .obtain_proxy(client, instance, ptr.id(), true, false)
        .expect("proxy factory registered")
}
