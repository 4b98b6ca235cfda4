//! In-process transport
//!
//! A [`MemoryNetwork`] routes dials to listeners registered under an
//! address string. Channels are linked pairs of unbounded queues, so a
//! whole set of pools can run inside one process.

use crate::network::channel::{
    ChannelError, ChannelFactory, InboundListener, PeerChannel, SharedChannel,
};
use crate::network::message::Message;
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::sync::mpsc;

/// First port handed out to dialing channels
const FIRST_EPHEMERAL_PORT: u16 = 40_000;

/// Buffer of accepted connections per listener subscription
const ACCEPT_BUFFER: usize = 64;

type Subscribers = Arc<Mutex<Vec<mpsc::Sender<SharedChannel>>>>;

struct Hub {
    listeners: HashMap<String, (SocketAddr, Subscribers)>,
    next_port: u16,
}

/// Registry of in-process listeners
#[derive(Clone)]
pub struct MemoryNetwork {
    hub: Arc<Mutex<Hub>>,
}

impl Default for MemoryNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Mutex::new(Hub {
                listeners: HashMap::new(),
                next_port: FIRST_EPHEMERAL_PORT,
            })),
        }
    }

    /// Register a listener under `address` (must be a socket address)
    pub fn listen(&self, address: &str) -> Result<MemoryListener, ChannelError> {
        let endpoint: SocketAddr = address
            .parse()
            .map_err(|_| ChannelError::ConnectionFailed(format!("bad address {}", address)))?;
        let mut hub = self.lock();
        if hub.listeners.contains_key(address) {
            return Err(ChannelError::ConnectionFailed(format!(
                "{} already in use",
                address
            )));
        }
        let subscribers: Subscribers = Arc::new(Mutex::new(Vec::new()));
        hub.listeners
            .insert(address.to_string(), (endpoint, subscribers.clone()));
        Ok(MemoryListener {
            network: self.clone(),
            address: address.to_string(),
            subscribers,
        })
    }

    /// Factory producing channels that dial through this network
    pub fn factory(&self) -> MemoryChannelFactory {
        MemoryChannelFactory {
            network: self.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Hub> {
        self.hub.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lookup(&self, address: &str) -> Option<(SocketAddr, Subscribers, SocketAddr)> {
        let mut hub = self.lock();
        let (endpoint, subscribers) = hub.listeners.get(address).cloned()?;
        let port = hub.next_port;
        hub.next_port = hub.next_port.wrapping_add(1).max(FIRST_EPHEMERAL_PORT);
        let local = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        Some((endpoint, subscribers, local))
    }

    fn unregister(&self, address: &str) {
        self.lock().listeners.remove(address);
    }
}

/// Listener side of a [`MemoryNetwork`] address
pub struct MemoryListener {
    network: MemoryNetwork,
    address: String,
    subscribers: Subscribers,
}

impl InboundListener for MemoryListener {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn subscribe(&self) -> mpsc::Receiver<SharedChannel> {
        let (tx, rx) = mpsc::channel(ACCEPT_BUFFER);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        self.network.unregister(&self.address);
    }
}

/// Produces [`MemoryChannel`]s
pub struct MemoryChannelFactory {
    network: MemoryNetwork,
}

impl ChannelFactory for MemoryChannelFactory {
    fn produce(&self) -> SharedChannel {
        Arc::new(MemoryChannel::new(self.network.clone()))
    }
}

/// One end of an in-process connection
pub struct MemoryChannel {
    network: Option<MemoryNetwork>,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rx: tokio::sync::Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    endpoints: OnceLock<(SocketAddr, SocketAddr)>,
    live: AtomicBool,
}

impl MemoryChannel {
    /// A fresh channel that can dial through `network`
    pub fn new(network: MemoryNetwork) -> Self {
        Self::unlinked(Some(network))
    }

    fn unlinked(network: Option<MemoryNetwork>) -> Self {
        Self {
            network,
            tx: Mutex::new(None),
            rx: tokio::sync::Mutex::new(None),
            endpoints: OnceLock::new(),
            live: AtomicBool::new(false),
        }
    }

    /// Two channels already connected to each other
    pub fn pair(a: SocketAddr, b: SocketAddr) -> (Arc<MemoryChannel>, Arc<MemoryChannel>) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        let left = Self::linked(a_tx, a_rx, (a, b));
        let right = Self::linked(b_tx, b_rx, (b, a));
        (Arc::new(left), Arc::new(right))
    }

    fn linked(
        tx: mpsc::UnboundedSender<Message>,
        rx: mpsc::UnboundedReceiver<Message>,
        endpoints: (SocketAddr, SocketAddr),
    ) -> Self {
        Self {
            network: None,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(Some(rx)),
            endpoints: OnceLock::from(endpoints),
            live: AtomicBool::new(true),
        }
    }

    fn sender(&self) -> Option<mpsc::UnboundedSender<Message>> {
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl PeerChannel for MemoryChannel {
    async fn connect(&self, address: &str) -> Result<(), ChannelError> {
        if self.endpoints.get().is_some() {
            return Err(ChannelError::AlreadyConnected);
        }
        let network = self
            .network
            .as_ref()
            .ok_or_else(|| ChannelError::ConnectionFailed("no network".into()))?;
        let (remote, subscribers, local) = network
            .lookup(address)
            .ok_or_else(|| ChannelError::ConnectionFailed(format!("{} unreachable", address)))?;

        let (pair_local, pair_remote) = MemoryChannel::pair(local, remote);
        let senders: Vec<_> = subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let accepted: SharedChannel = pair_remote;
        let mut delivered = false;
        for sender in senders {
            if sender.send(accepted.clone()).await.is_ok() {
                delivered = true;
                break;
            }
        }
        if !delivered {
            return Err(ChannelError::ConnectionFailed(format!(
                "{} refused connection",
                address
            )));
        }

        let tx = pair_local.sender();
        let rx = pair_local.rx.lock().await.take();
        *self.tx.lock().unwrap_or_else(|e| e.into_inner()) = tx;
        *self.rx.lock().await = rx;
        let _ = self.endpoints.set((local, remote));
        self.live.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
            && self.sender().map_or(false, |tx| !tx.is_closed())
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let tx = self.sender().ok_or(ChannelError::NotConnected)?;
        tx.send(message.clone()).map_err(|_| {
            self.live.store(false, Ordering::SeqCst);
            ChannelError::Closed
        })
    }

    async fn receive(&self) -> Result<Option<Message>, ChannelError> {
        let mut rx = self.rx.lock().await;
        let Some(rx) = rx.as_mut() else {
            if self.endpoints.get().is_none() {
                return Err(ChannelError::NotConnected);
            }
            return Ok(None);
        };
        match rx.recv().await {
            Some(message) => Ok(Some(message)),
            None => {
                self.live.store(false, Ordering::SeqCst);
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.live.store(false, Ordering::SeqCst);
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Ok(mut rx) = self.rx.try_lock() {
            rx.take();
        }
        Ok(())
    }

    fn local_endpoint(&self) -> Option<SocketAddr> {
        self.endpoints.get().map(|(local, _)| *local)
    }

    fn remote_endpoint(&self) -> Option<SocketAddr> {
        self.endpoints.get().map(|(_, remote)| *remote)
    }
}
