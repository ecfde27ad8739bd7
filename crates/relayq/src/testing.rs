//! In-memory doubles for the transport, discovery and compensation
//! seams. Used by the crate's own tests; not part of the public API.

use crate::connection::Connection;
use crate::dispatch::CompensationPublisher;
use crate::error::{Error, Result};
use crate::flow::ConsumeInfo;
use crate::lookup::{Discovery, ShardingKey};
use crate::reconcile::DeliverySink;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use relayq_protocol::{
    Address, BrokerError, Command, Connector, Frame, Message, MessageId, Topic, Transport,
};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport double recording every command it is asked to carry.
pub struct MemoryTransport {
    sent: Mutex<Vec<Command>>,
    connected: AtomicBool,
    fail_sends: AtomicBool,
    /// Error-frame text to answer the next `request` with.
    next_request_error: Mutex<Option<String>>,
}

impl MemoryTransport {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self {
            sent: Mutex::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            next_request_error: Mutex::new(None),
        })
    }

    pub fn sent(&self) -> Vec<Command> {
        self.sent.lock().clone()
    }

    pub fn sent_names(&self) -> Vec<&'static str> {
        self.sent.lock().iter().map(|c| c.name()).collect()
    }

    /// Last RDY count carried on this transport, if any.
    pub fn last_rdy(&self) -> Option<u32> {
        self.sent.lock().iter().rev().find_map(|c| match c {
            Command::Ready { count } => Some(*count),
            _ => None,
        })
    }

    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_request(&self, raw_error: &str) {
        *self.next_request_error.lock() = Some(raw_error.to_string());
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn send(&self, command: Command) -> io::Result<()> {
        if !self.connected.load(Ordering::SeqCst) || self.fail_sends.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        self.sent.lock().push(command);
        Ok(())
    }

    async fn request(&self, command: Command) -> io::Result<Frame> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "link down"));
        }
        self.sent.lock().push(command);
        if let Some(raw) = self.next_request_error.lock().take() {
            return Ok(Frame::Error(BrokerError::parse(&raw)));
        }
        Ok(Frame::Response(Bytes::from_static(b"OK")))
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }
}

/// One link handed out by [`MemoryConnector`].
pub struct MemoryLink {
    pub address: Address,
    pub transport: Arc<MemoryTransport>,
    pub frames: mpsc::Sender<Frame>,
}

/// Connector double producing [`MemoryTransport`] links on demand.
pub struct MemoryConnector {
    links: Mutex<Vec<MemoryLink>>,
    refused: Mutex<HashSet<Address>>,
    dial_count: AtomicUsize,
}

impl MemoryConnector {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self {
            links: Mutex::new(Vec::new()),
            refused: Mutex::new(HashSet::new()),
            dial_count: AtomicUsize::new(0),
        })
    }

    /// Make subsequent dials to `address` fail.
    pub fn refuse(&self, address: &Address) {
        self.refused.lock().insert(address.clone());
    }

    pub fn accept(&self, address: &Address) {
        self.refused.lock().remove(address);
    }

    pub fn dial_count(&self) -> usize {
        self.dial_count.load(Ordering::SeqCst)
    }

    pub fn link_count(&self) -> usize {
        self.links.lock().len()
    }

    pub fn transports_for(&self, address: &Address) -> Vec<Arc<MemoryTransport>> {
        self.links
            .lock()
            .iter()
            .filter(|l| &l.address == address)
            .map(|l| l.transport.clone())
            .collect()
    }

    pub fn all_transports(&self) -> Vec<Arc<MemoryTransport>> {
        self.links.lock().iter().map(|l| l.transport.clone()).collect()
    }

    /// Push a frame into the newest link for `address`, as a broker
    /// would deliver it.
    pub async fn deliver(&self, address: &Address, frame: Frame) -> bool {
        let sender = {
            let links = self.links.lock();
            links
                .iter()
                .rev()
                .find(|l| &l.address == address)
                .map(|l| l.frames.clone())
        };
        match sender {
            Some(tx) => tx.send(frame).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        address: &Address,
    ) -> io::Result<(Arc<dyn Transport>, mpsc::Receiver<Frame>)> {
        self.dial_count.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().contains(address) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("refused: {address}"),
            ));
        }
        let transport = MemoryTransport::arc();
        let (tx, rx) = mpsc::channel(64);
        self.links.lock().push(MemoryLink {
            address: address.clone(),
            transport: transport.clone(),
            frames: tx,
        });
        Ok((transport, rx))
    }
}

/// Discovery double serving a scripted topic → address table.
pub struct StaticDiscovery {
    table: RwLock<HashMap<String, Vec<Address>>>,
    failing: Mutex<HashSet<String>>,
    invalidated: Mutex<Vec<String>>,
    resolve_calls: AtomicUsize,
}

impl StaticDiscovery {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self {
            table: RwLock::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            invalidated: Mutex::new(Vec::new()),
            resolve_calls: AtomicUsize::new(0),
        })
    }

    pub fn set_topic(&self, topic: &str, addresses: Vec<Address>) {
        self.table.write().insert(topic.to_string(), addresses);
    }

    pub fn fail_topic(&self, topic: &str, failing: bool) {
        if failing {
            self.failing.lock().insert(topic.to_string());
        } else {
            self.failing.lock().remove(topic);
        }
    }

    pub fn invalidations(&self) -> Vec<String> {
        self.invalidated.lock().clone()
    }

    pub fn resolve_calls(&self) -> usize {
        self.resolve_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Discovery for StaticDiscovery {
    async fn resolve(
        &self,
        topic: &Topic,
        _keys: &[ShardingKey],
        _for_write: bool,
    ) -> Result<Vec<Address>> {
        self.resolve_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().contains(&topic.name) {
            return Err(Error::Discovery(format!("scripted failure for {}", topic.name)));
        }
        Ok(self
            .table
            .read()
            .get(&topic.name)
            .cloned()
            .unwrap_or_default())
    }

    fn invalidate(&self, topic: &str) {
        self.invalidated.lock().push(topic.to_string());
    }
}

/// Compensation-publish double.
pub struct RecordingPublisher {
    published: Mutex<Vec<(Topic, Bytes)>>,
    fail: AtomicBool,
}

impl RecordingPublisher {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self {
            published: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        })
    }

    pub fn fail(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<(Topic, Bytes)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl CompensationPublisher for RecordingPublisher {
    async fn publish(&self, topic: &Topic, body: Bytes) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(Error::Connection("scripted compensation failure".into()));
        }
        self.published.lock().push((topic.clone(), body));
        Ok(())
    }
}

/// Delivery sink that keeps attached connections but ignores frames.
#[derive(Default)]
pub struct NullDelivery {
    attached: Mutex<Vec<Arc<Connection>>>,
}

impl NullDelivery {
    pub fn arc() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attached(&self) -> Vec<Arc<Connection>> {
        self.attached.lock().clone()
    }
}

impl DeliverySink for NullDelivery {
    fn attach(&self, conn: Arc<Connection>, _frames: mpsc::Receiver<Frame>) {
        self.attached.lock().push(conn);
    }
}

/// Scriptable load signals for driving redistribution in tests.
pub struct StaticLoad {
    load: Mutex<f32>,
    may_timeout: AtomicBool,
    rdy_per_connection: u32,
}

impl StaticLoad {
    pub fn arc(rdy_per_connection: u32) -> Arc<Self> {
        Arc::new(Self {
            load: Mutex::new(0.0),
            may_timeout: AtomicBool::new(false),
            rdy_per_connection,
        })
    }

    pub fn set_load(&self, load: f32) {
        *self.load.lock() = load;
    }

    pub fn set_may_timeout(&self, may_timeout: bool) {
        self.may_timeout.store(may_timeout, Ordering::SeqCst);
    }
}

impl ConsumeInfo for StaticLoad {
    fn load_factor(&self) -> f32 {
        *self.load.lock()
    }

    fn consumption_may_timeout(&self) -> bool {
        self.may_timeout.load(Ordering::SeqCst)
    }

    fn rdy_per_connection(&self) -> u32 {
        self.rdy_per_connection
    }
}

/// Shorthand for an unpartitioned broker address.
pub fn addr(host: &str, port: u16) -> Address {
    Address::new(host, port)
}

/// A message with recognizable id/body derived from `seed`.
pub fn message(seed: u8, attempts: u16) -> Message {
    let mut message = Message::new(
        MessageId([seed; 16]),
        attempts,
        1_700_000_000_000_000_000,
        Bytes::copy_from_slice(&[seed; 8]),
    );
    message.address = addr("10.0.0.1", 4150);
    message.connection_id = 1;
    message
}
