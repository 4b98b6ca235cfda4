//! TCP transport
//!
//! Length-prefixed JSON frames over tokio TCP streams, plus the listener
//! that turns accepted sockets into inbound channels.

use crate::network::channel::{
    ChannelError, ChannelFactory, InboundListener, PeerChannel, SharedChannel,
};
use crate::network::message::{Message, FRAME_MARKER, MAX_MESSAGE_SIZE};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::{SplitSink, SplitStream, StreamExt};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Frame header: marker (4) + length (4)
const HEADER_LEN: usize = 8;

/// Buffer of accepted connections per listener subscription
const ACCEPT_BUFFER: usize = 64;

/// Back-off after a failed accept
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Message codec for length-prefixed framing
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let data = item
            .to_bytes()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        if data.len() > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("message too large: {} bytes", data.len()),
            ));
        }

        dst.reserve(HEADER_LEN + data.len());
        dst.put_slice(&FRAME_MARKER);
        dst.put_u32(data.len() as u32);
        dst.put_slice(&data);

        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[..4] != FRAME_MARKER {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "Invalid frame marker",
            ));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_MESSAGE_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large: {} bytes", len),
            ));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let data = src.split_to(len);

        let msg = Message::from_bytes(&data)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

        Ok(Some(msg))
    }
}

type Writer = SplitSink<Framed<TcpStream, MessageCodec>, Message>;
type Reader = SplitStream<Framed<TcpStream, MessageCodec>>;

fn is_disconnect(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// Peer channel over a TCP stream
pub struct TcpChannel {
    writer: Mutex<Option<Writer>>,
    reader: Mutex<Option<Reader>>,
    endpoints: OnceLock<(SocketAddr, SocketAddr)>,
    live: AtomicBool,
}

impl Default for TcpChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpChannel {
    /// An unconnected channel
    pub fn new() -> Self {
        Self {
            writer: Mutex::new(None),
            reader: Mutex::new(None),
            endpoints: OnceLock::new(),
            live: AtomicBool::new(false),
        }
    }

    /// Wrap an already connected stream (accepted by a listener)
    pub fn from_stream(stream: TcpStream) -> Result<Self, ChannelError> {
        let endpoints = (stream.local_addr()?, stream.peer_addr()?);
        let (writer, reader) = Framed::new(stream, MessageCodec).split();
        Ok(Self {
            writer: Mutex::new(Some(writer)),
            reader: Mutex::new(Some(reader)),
            endpoints: OnceLock::from(endpoints),
            live: AtomicBool::new(true),
        })
    }

    fn mark_dead(&self) {
        self.live.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerChannel for TcpChannel {
    async fn connect(&self, address: &str) -> Result<(), ChannelError> {
        if self.endpoints.get().is_some() {
            return Err(ChannelError::AlreadyConnected);
        }

        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?;
        let endpoints = (
            stream
                .local_addr()
                .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?,
            stream
                .peer_addr()
                .map_err(|e| ChannelError::ConnectionFailed(e.to_string()))?,
        );

        let (writer, reader) = Framed::new(stream, MessageCodec).split();
        *self.writer.lock().await = Some(writer);
        *self.reader.lock().await = Some(reader);
        if self.endpoints.set(endpoints).is_err() {
            return Err(ChannelError::AlreadyConnected);
        }
        self.live.store(true, Ordering::SeqCst);

        log::debug!("Connected {} -> {}", endpoints.0, endpoints.1);
        Ok(())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    async fn send(&self, message: &Message) -> Result<(), ChannelError> {
        let mut writer = self.writer.lock().await;
        let writer = writer.as_mut().ok_or(ChannelError::NotConnected)?;
        writer.send(message.clone()).await.map_err(|e| {
            if is_disconnect(&e) {
                self.mark_dead();
                ChannelError::Closed
            } else {
                ChannelError::IoError(e)
            }
        })
    }

    async fn receive(&self) -> Result<Option<Message>, ChannelError> {
        let mut reader = self.reader.lock().await;
        let Some(reader) = reader.as_mut() else {
            if self.endpoints.get().is_none() {
                return Err(ChannelError::NotConnected);
            }
            return Ok(None);
        };

        match reader.next().await {
            Some(Ok(msg)) => Ok(Some(msg)),
            Some(Err(e)) if is_disconnect(&e) => {
                self.mark_dead();
                Ok(None)
            }
            Some(Err(e)) if e.kind() == io::ErrorKind::InvalidData => {
                Err(ChannelError::Codec(e.to_string()))
            }
            Some(Err(e)) => Err(ChannelError::IoError(e)),
            None => {
                self.mark_dead();
                Ok(None)
            }
        }
    }

    async fn close(&self) -> Result<(), ChannelError> {
        self.mark_dead();
        // A reader busy in receive is released by its own timeout
        if let Ok(mut reader) = self.reader.try_lock() {
            reader.take();
        }
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.close().await?;
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

/// Produces unconnected [`TcpChannel`]s
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpChannelFactory;

impl ChannelFactory for TcpChannelFactory {
    fn produce(&self) -> SharedChannel {
        Arc::new(TcpChannel::new())
    }
}

type Subscribers = Arc<std::sync::Mutex<Vec<mpsc::Sender<SharedChannel>>>>;

/// TCP listener handing accepted sockets to subscribers
pub struct TcpInbound {
    address: String,
    local_addr: SocketAddr,
    subscribers: Subscribers,
    accept_task: JoinHandle<()>,
}

impl TcpInbound {
    /// Bind to `address` and start accepting connections
    pub async fn bind(address: &str) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(address).await?;
        let local_addr = listener.local_addr()?;
        log::info!("Listening for peers on {}", local_addr);

        // An ephemeral port is only known after binding
        let address = match address.parse::<SocketAddr>() {
            Ok(requested) if requested.port() == 0 => local_addr.to_string(),
            _ => address.to_string(),
        };

        let subscribers: Subscribers = Arc::new(std::sync::Mutex::new(Vec::new()));
        let accept_subscribers = subscribers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        log::info!("Incoming connection from {}", addr);
                        match TcpChannel::from_stream(stream) {
                            Ok(channel) => {
                                forward(&accept_subscribers, Arc::new(channel)).await;
                            }
                            Err(e) => log::warn!("Dropping connection from {}: {}", addr, e),
                        }
                    }
                    Err(e) => {
                        log::error!("Accept error: {}", e);
                        tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    }
                }
            }
        });

        Ok(Self {
            address,
            local_addr,
            subscribers,
            accept_task,
        })
    }

    /// Socket address actually bound
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn forward(subscribers: &Subscribers, channel: SharedChannel) {
    let senders: Vec<_> = {
        let mut subscribers = subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.clone()
    };
    if senders.is_empty() {
        log::warn!("No subscriber for inbound connection, closing it");
        let _ = channel.close().await;
        return;
    }
    for tx in senders {
        let _ = tx.send(channel.clone()).await;
    }
}

impl InboundListener for TcpInbound {
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

impl Drop for TcpInbound {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_codec() {
        let mut codec = MessageCodec;
        let msg = Message::Ping(12345);

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_partial_frame_waits() {
        let mut codec = MessageCodec;
        let mut full = BytesMut::new();
        codec.encode(Message::Pong(7), &mut full).unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn test_bad_marker_rejected() {
        let mut codec = MessageCodec;
        let mut buf = BytesMut::from(&b"XXXX\x00\x00\x00\x02{}"[..]);
        let err = codec.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_loopback_exchange() {
        let inbound = TcpInbound::bind("127.0.0.1:0").await.unwrap();
        let mut accepted = inbound.subscribe();
        assert_eq!(inbound.address(), inbound.local_addr().to_string());

        let dialer = TcpChannelFactory.produce();
        dialer.connect(&inbound.address()).await.unwrap();
        assert!(dialer.is_live());

        let server = accepted.recv().await.unwrap();
        assert_eq!(server.remote_endpoint(), dialer.local_endpoint());

        dialer.send(&Message::Ping(1)).await.unwrap();
        assert_eq!(server.receive().await.unwrap(), Some(Message::Ping(1)));

        dialer.close().await.unwrap();
        assert_eq!(server.receive().await.unwrap(), None);
        assert!(!server.is_live());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to obtain a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let channel = TcpChannel::new();
        let result = channel.connect(&format!("127.0.0.1:{}", port)).await;
        assert!(matches!(result, Err(ChannelError::ConnectionFailed(_))));
        assert!(!channel.is_live());
    }
}
