//! Connection pool
//!
//! Owns the set of known peers and keeps it alive:
//! - a periodic sweep dials seed peers that are new or dead
//! - a receive pump drains every attached channel and dispatches messages
//! - inbound connections from the listener are spliced into the set
//! - broadcast pushes a message to every connected peer
//!
//! The record list sits behind a single mutex that is only held while the
//! list is filtered or copied. All network I/O runs on private snapshots.

use crate::config::{PoolConfig, PoolTimings};
use crate::network::channel::{
    close_quietly, ChannelError, ChannelFactory, InboundListener, SharedChannel,
};
use crate::network::message::{Message, VersionInfo};
use crate::network::record::{
    ConnectionRecord, ConnectionStatus, PeerAddress, RecordHandle, RecordSnapshot,
};
use crate::node::{LocalNode, NodeId};
use futures::future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

/// Messages a dialed peer may send before answering the handshake
const HANDSHAKE_BACKLOG: usize = 64;

/// Pool lifecycle and pump errors
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Pool already started")]
    AlreadyStarted,
    #[error("Pool is shut down")]
    ShutDown,
    #[error("Receive from {peer} failed: {source}")]
    ReceiveFailed {
        peer: String,
        #[source]
        source: ChannelError,
    },
}

/// A message delivered to subscribers
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    /// Address of the record the message came from
    pub from: PeerAddress,
    pub remote: Option<SocketAddr>,
    /// Peer identity, if the handshake already resolved it
    pub node_id: Option<NodeId>,
    pub message: Message,
}

/// Outcome of a broadcast
#[derive(Debug, Default)]
pub struct BroadcastReport {
    /// Peers the message was handed to
    pub delivered: Vec<String>,
    /// Peers whose send failed
    pub failed: Vec<(String, ChannelError)>,
}

impl BroadcastReport {
    pub fn attempted(&self) -> usize {
        self.delivered.len() + self.failed.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

struct Workers {
    sweep: JoinHandle<()>,
    pump: JoinHandle<()>,
    inbound: JoinHandle<()>,
}

/// Peer connection manager
pub struct ConnectionPool {
    local: Arc<LocalNode>,
    magic: u32,
    timings: PoolTimings,
    records: Mutex<Vec<RecordHandle>>,
    factory: Arc<dyn ChannelFactory>,
    inbound: std::sync::Mutex<Option<mpsc::Receiver<SharedChannel>>>,
    messages: broadcast::Sender<ReceivedMessage>,
    cancel: CancellationToken,
    started: AtomicBool,
    receiving: AtomicBool,
    workers: Mutex<Option<Workers>>,
}

impl ConnectionPool {
    /// Create a pool with default timings
    pub fn new(
        local: Arc<LocalNode>,
        magic: u32,
        seeds: &[String],
        factory: Arc<dyn ChannelFactory>,
        listener: &dyn InboundListener,
    ) -> Arc<Self> {
        Self::with_timings(local, magic, seeds, factory, listener, PoolTimings::default())
    }

    pub fn from_config(
        local: Arc<LocalNode>,
        config: &PoolConfig,
        factory: Arc<dyn ChannelFactory>,
        listener: &dyn InboundListener,
    ) -> Arc<Self> {
        Self::with_timings(
            local,
            config.magic,
            &config.seeds,
            factory,
            listener,
            config.timings.clone(),
        )
    }

    /// Create a pool. Seeds equal to the listener's own address are skipped.
    pub fn with_timings(
        local: Arc<LocalNode>,
        magic: u32,
        seeds: &[String],
        factory: Arc<dyn ChannelFactory>,
        listener: &dyn InboundListener,
        timings: PoolTimings,
    ) -> Arc<Self> {
        let own_address = listener.address();
        let records = seeds
            .iter()
            .filter(|seed| **seed != own_address)
            .map(|seed| ConnectionRecord::new(seed.clone()).into_handle())
            .collect::<Vec<_>>();
        log::info!(
            "Connection pool for node {} with {} seed peer(s)",
            local.id(),
            records.len()
        );

        let (messages, _) = broadcast::channel(timings.message_buffer.max(1));

        Arc::new(Self {
            local,
            magic,
            timings,
            records: Mutex::new(records),
            factory,
            inbound: std::sync::Mutex::new(Some(listener.subscribe())),
            messages,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            receiving: AtomicBool::new(false),
            workers: Mutex::new(None),
        })
    }

    /// Start the reconnect sweep, the receive pump and inbound handling
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        let mut workers = self.workers.lock().await;
        if self.cancel.is_cancelled() {
            return Err(PoolError::ShutDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(PoolError::AlreadyStarted);
        }

        let inbound_rx = self
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        self.receiving.store(true, Ordering::SeqCst);
        *workers = Some(Workers {
            sweep: tokio::spawn(self.clone().run_sweeps()),
            pump: tokio::spawn(self.clone().run_pump()),
            inbound: tokio::spawn(self.clone().run_inbound(inbound_rx)),
        });

        log::info!("Connection pool started");
        Ok(())
    }

    /// Stop all activity and close every attached channel.
    ///
    /// Returns once the receive pump has exited. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        let mut slot = self.workers.lock().await;
        if self.cancel.is_cancelled() {
            return;
        }
        log::info!("Shutting down connection pool");
        self.cancel.cancel();

        let pump = match slot.take() {
            Some(Workers {
                sweep,
                pump,
                inbound,
            }) => {
                // The sweep task aborts its in-flight dials before exiting
                for (name, handle) in [("sweep", sweep), ("inbound", inbound)] {
                    if let Err(e) = handle.await {
                        log::warn!("{} task ended abnormally: {}", name, e);
                    }
                }
                Some(pump)
            }
            None => None,
        };

        self.close_all().await;

        if let Some(pump) = pump {
            if let Err(e) = pump.await {
                log::warn!("Receive pump ended abnormally: {}", e);
            }
        }
        log::info!("Connection pool stopped");
    }

    /// Receive every message the pump picks up
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.messages.subscribe()
    }

    /// Whether the receive pump is running
    pub fn is_receiving(&self) -> bool {
        self.receiving.load(Ordering::SeqCst)
    }

    /// Copy of every record, in insertion order
    pub async fn records(&self) -> Vec<RecordSnapshot> {
        let handles = self.records.lock().await.clone();
        let mut snapshots = Vec::with_capacity(handles.len());
        for handle in handles {
            snapshots.push(handle.read().await.snapshot());
        }
        snapshots
    }

    pub async fn record_count(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn connected_count(&self) -> usize {
        self.connected_channels().await.len()
    }

    /// Send `message` to every peer connected right now.
    ///
    /// Peers are served one after another; a failing or stalled peer is
    /// reported and skipped.
    pub async fn broadcast(&self, message: &Message) -> BroadcastReport {
        let targets = self.connected_channels().await;
        let mut report = BroadcastReport::default();

        for (label, channel) in targets {
            match self.send_to(&channel, &label, message).await {
                Ok(()) => report.delivered.push(label),
                Err(e) => {
                    log::warn!("Failed to send {} to {}: {}", message.type_name(), label, e);
                    report.failed.push((label, e));
                }
            }
        }

        log::debug!(
            "Broadcast {} to {} peer(s), {} failed",
            message.type_name(),
            report.attempted(),
            report.failed.len()
        );
        report
    }

    /// Adopt a connection accepted by the listener.
    ///
    /// A record already attached to the same `(local, remote)` endpoints is
    /// replaced.
    pub async fn accept_inbound(&self, channel: SharedChannel) {
        let limit = self.timings.send_timeout();
        if self.cancel.is_cancelled() {
            close_quietly(&channel, "inbound", limit).await;
            return;
        }

        let endpoints = channel.endpoints();
        let replaced = {
            let mut records = self.records.lock().await;
            // Shutdown may have emptied the set while we waited for the lock
            if self.cancel.is_cancelled() {
                None
            } else {
                Some(Self::splice_inbound(&mut records, &channel, endpoints).await)
            }
        };
        let Some(replaced) = replaced else {
            close_quietly(&channel, "inbound", limit).await;
            return;
        };

        match endpoints {
            Some((local, remote)) => log::info!("Inbound peer {} on {}", remote, local),
            None => log::info!("Inbound peer with unknown endpoints"),
        }

        if let Some(old) = replaced {
            let stale = old.write().await.channel.take();
            if let Some(stale) = stale {
                if !Arc::ptr_eq(&stale, &channel) {
                    log::debug!("Replaced stale record for the same connection");
                    close_quietly(&stale, "replaced peer", limit).await;
                }
            }
        }
    }

    /// Insert an inbound record, removing the one on the same endpoints
    async fn splice_inbound(
        records: &mut Vec<RecordHandle>,
        channel: &SharedChannel,
        endpoints: Option<(SocketAddr, SocketAddr)>,
    ) -> Option<RecordHandle> {
        let mut position = None;
        if let Some(pair) = endpoints {
            for (index, handle) in records.iter().enumerate() {
                if handle.read().await.endpoints() == Some(pair) {
                    position = Some(index);
                    break;
                }
            }
        }
        let replaced = position.map(|index| records.remove(index));
        records.push(ConnectionRecord::inbound(channel.clone()).into_handle());
        replaced
    }

    /// One reconnect pass over new and dead seed peers.
    ///
    /// Returns the number of records attempted.
    pub async fn sweep(&self) -> usize {
        let candidates = {
            let records = self.records.lock().await;
            let mut picked = Vec::new();
            for handle in records.iter() {
                let mut record = handle.write().await;
                if record.status.is_retryable() && !record.address.is_inbound() && !record.dialing {
                    record.dialing = true;
                    picked.push(handle.clone());
                }
            }
            picked
        };

        for handle in &candidates {
            if self.cancel.is_cancelled() {
                break;
            }
            self.try_connect(handle).await;
        }
        candidates.len()
    }

    async fn run_sweeps(self: Arc<Self>) {
        let start = Instant::now() + self.timings.reconnect_delay();
        let mut ticker = time::interval_at(start, self.timings.reconnect_period());
        let mut sweeps = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let pool = self.clone();
                    sweeps.spawn(async move {
                        pool.sweep().await;
                    });
                }
                Some(_) = sweeps.join_next(), if !sweeps.is_empty() => {}
            }
        }

        sweeps.shutdown().await;
    }

    async fn try_connect(&self, handle: &RecordHandle) {
        let (address, stale) = {
            let mut record = handle.write().await;
            let address = match &record.address {
                PeerAddress::Dialable(address) => address.clone(),
                PeerAddress::Inbound => {
                    record.dialing = false;
                    return;
                }
            };
            record.connect_attempts += 1;
            (address, record.channel.take())
        };

        if let Some(stale) = stale {
            close_quietly(&stale, &address, self.timings.send_timeout()).await;
        }

        log::debug!("Connecting to {}", address);
        let channel = self.factory.produce();
        let result = self.handshake(&channel, &address, handle).await;

        let adopted = {
            let mut record = handle.write().await;
            record.dialing = false;
            match &result {
                Err(e) => {
                    log::debug!("Cannot connect to {}: {}", address, e);
                    record.status = ConnectionStatus::Dead;
                }
                Ok(()) if record.status == ConnectionStatus::Connected && self.cancel.is_cancelled() => {
                    record.status = ConnectionStatus::Disconnected;
                }
                Ok(()) => {}
            }
            let adopted = record.status == ConnectionStatus::Connected;
            if adopted {
                record.channel = Some(channel.clone());
            }
            adopted
        };

        if !adopted {
            close_quietly(&channel, &address, self.timings.send_timeout()).await;
        }
    }

    /// Dial, probe with our version and apply the peer's answer to the record.
    ///
    /// Anything the peer sends ahead of its answer is held back and
    /// delivered right after it, once the record is promoted.
    async fn handshake(
        &self,
        channel: &SharedChannel,
        address: &str,
        handle: &RecordHandle,
    ) -> Result<(), ChannelError> {
        let deadline = Instant::now() + self.timings.handshake_timeout();
        let expired = || ChannelError::Timeout(format!("handshake with {}", address));

        time::timeout_at(deadline, channel.connect(address))
            .await
            .map_err(|_| expired())??;
        if !channel.is_live() {
            return Err(ChannelError::Closed);
        }

        let ours = self.version_info().await;
        time::timeout_at(deadline, channel.send(&Message::Version(ours.clone())))
            .await
            .map_err(|_| expired())??;

        let mut early = Vec::new();
        let answer = loop {
            let message = time::timeout_at(deadline, channel.receive())
                .await
                .map_err(|_| expired())??
                .ok_or(ChannelError::Closed)?;

            if message.is_handshake() {
                break message;
            }
            if early.len() >= HANDSHAKE_BACKLOG {
                return Err(ChannelError::ConnectionFailed(format!(
                    "{} sent {} messages without answering the handshake",
                    address,
                    early.len()
                )));
            }
            log::debug!("Holding {} from {} until the handshake", message.type_name(), address);
            early.push(message);
        };

        for message in std::iter::once(answer).chain(early) {
            self.publish(handle, channel, &message).await;
            let (reply, status) = {
                let mut record = handle.write().await;
                let reply = message.on_received(&ours, &mut record);
                (reply, record.status)
            };
            if let Some(reply) = reply {
                time::timeout_at(deadline, channel.send(&reply))
                    .await
                    .map_err(|_| expired())??;
            }
            if status != ConnectionStatus::Connected {
                break;
            }
        }
        Ok(())
    }

    async fn run_pump(self: Arc<Self>) {
        log::info!("Receive pump started");
        let result = self.pump().await;
        self.receiving.store(false, Ordering::SeqCst);
        match result {
            Ok(()) => log::info!("Receive pump stopped"),
            Err(e) => log::error!("Receive pump aborted: {}", e),
        }
    }

    async fn pump(&self) -> Result<(), PoolError> {
        while !self.cancel.is_cancelled() {
            let snapshot = self.records.lock().await.clone();
            let ours = self.version_info().await;

            for handle in &snapshot {
                if self.cancel.is_cancelled() {
                    return Ok(());
                }
                self.receive_from(handle, &ours).await?;
            }

            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = time::sleep(self.timings.receive_idle()) => {}
            }
        }
        Ok(())
    }

    async fn receive_from(&self, handle: &RecordHandle, ours: &VersionInfo) -> Result<(), PoolError> {
        let (channel, label) = {
            let record = handle.read().await;
            match &record.channel {
                Some(channel) => (channel.clone(), record.label()),
                None => return Ok(()),
            }
        };

        if !channel.is_live() {
            self.retire(handle, &channel, None).await;
            return Ok(());
        }

        let received = tokio::select! {
            _ = self.cancel.cancelled() => return Ok(()),
            received = time::timeout(self.timings.receive_timeout(), channel.receive()) => received,
        };

        let message = match received {
            Err(_idle) => return Ok(()),
            Ok(Ok(Some(message))) => message,
            Ok(Ok(None)) => {
                self.retire(handle, &channel, None).await;
                return Ok(());
            }
            Ok(Err(source)) => {
                return Err(PoolError::ReceiveFailed {
                    peer: label,
                    source,
                })
            }
        };

        log::debug!("Received {} from {}", message.type_name(), label);
        self.publish(handle, &channel, &message).await;

        let (reply, status) = {
            let mut record = handle.write().await;
            let reply = message.on_received(ours, &mut record);
            (reply, record.status)
        };

        if let Some(reply) = reply {
            let sent = tokio::select! {
                _ = self.cancel.cancelled() => return Ok(()),
                sent = self.send_to(&channel, &label, &reply) => sent,
            };
            if let Err(e) = sent {
                log::warn!("Failed to answer {} from {}: {}", message.type_name(), label, e);
                self.retire(handle, &channel, None).await;
                return Ok(());
            }
        }

        if matches!(
            status,
            ConnectionStatus::SelfConnection | ConnectionStatus::DifferentNetwork
        ) {
            self.retire(handle, &channel, Some(status)).await;
        }
        Ok(())
    }

    async fn run_inbound(self: Arc<Self>, inbound: Option<mpsc::Receiver<SharedChannel>>) {
        let Some(mut inbound) = inbound else {
            return;
        };
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = inbound.recv() => match accepted {
                    Some(channel) => self.accept_inbound(channel).await,
                    None => {
                        log::info!("Inbound listener closed");
                        break;
                    }
                },
            }
        }
    }

    /// Detach `channel` from its record and close it.
    ///
    /// Without an explicit status, seed peers become `Dead` (the sweep
    /// retries them) and inbound peers `Disconnected`.
    async fn retire(
        &self,
        handle: &RecordHandle,
        channel: &SharedChannel,
        status: Option<ConnectionStatus>,
    ) {
        let label = {
            let mut record = handle.write().await;
            let label = record.label();
            if record.detach(channel) {
                record.status = status.unwrap_or(if record.address.is_inbound() {
                    ConnectionStatus::Disconnected
                } else {
                    ConnectionStatus::Dead
                });
                log::info!("Peer {} detached ({:?})", label, record.status);
            }
            label
        };
        close_quietly(channel, &label, self.timings.send_timeout()).await;
    }

    /// Detach every channel, then close them side by side
    async fn close_all(&self) {
        let handles = self.records.lock().await.clone();
        let mut detached = Vec::new();
        for handle in handles {
            let mut record = handle.write().await;
            if let Some(channel) = record.channel.take() {
                if record.status == ConnectionStatus::Connected {
                    record.status = ConnectionStatus::Disconnected;
                }
                detached.push((record.label(), channel));
            }
        }

        let limit = self.timings.send_timeout();
        future::join_all(
            detached
                .iter()
                .map(|(label, channel)| close_quietly(channel, label, limit)),
        )
        .await;
    }

    /// Send to one peer, giving up after the send limit
    async fn send_to(
        &self,
        channel: &SharedChannel,
        label: &str,
        message: &Message,
    ) -> Result<(), ChannelError> {
        time::timeout(self.timings.send_timeout(), channel.send(message))
            .await
            .map_err(|_| ChannelError::Timeout(format!("send to {}", label)))?
    }

    async fn connected_channels(&self) -> Vec<(String, SharedChannel)> {
        let records = self.records.lock().await;
        let mut targets = Vec::new();
        for handle in records.iter() {
            let record = handle.read().await;
            if record.status == ConnectionStatus::Connected {
                if let Some(channel) = &record.channel {
                    targets.push((record.label(), channel.clone()));
                }
            }
        }
        targets
    }

    async fn publish(&self, handle: &RecordHandle, channel: &SharedChannel, message: &Message) {
        let received = {
            let record = handle.read().await;
            ReceivedMessage {
                from: record.address.clone(),
                remote: channel.remote_endpoint(),
                node_id: record.node_id,
                message: message.clone(),
            }
        };
        // No subscribers is fine
        let _ = self.messages.send(received);
    }

    async fn version_info(&self) -> VersionInfo {
        VersionInfo::new(
            self.magic,
            self.local.id(),
            self.local.user_agent(),
            self.local.tip().await,
        )
    }
}
