// Copyright 2022. The GlobalWitness Project
//
// Redistribution and use in source and binary forms, with or without modification, are permitted provided that the
// following conditions are met:
//
// 1. Redistributions of source code must retain the above copyright notice, this list of conditions and the following
// disclaimer.
//
// 2. Redistributions in binary form must reproduce the above copyright notice, this list of conditions and the
// following disclaimer in the documentation and/or other materials provided with the distribution.
//
// 3. Neither the name of the copyright holder nor the names of its contributors may be used to endorse or promote
// products derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE COPYRIGHT HOLDERS AND CONTRIBUTORS "AS IS" AND ANY EXPRESS OR IMPLIED WARRANTIES,
// INCLUDING, BUT NOT LIMITED TO, THE IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE ARE
// DISCLAIMED. IN NO EVENT SHALL THE COPYRIGHT HOLDER OR CONTRIBUTORS BE LIABLE FOR ANY DIRECT, INDIRECT, INCIDENTAL,
// SPECIAL, EXEMPLARY, OR CONSEQUENTIAL DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS OR
// SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION) HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY,
// WHETHER IN CONTRACT, STRICT LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY OUT OF THE
// USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF SUCH DAMAGE.

//! Outbound wire-protocol peer.
//!
//! [`OutboundPeer`] dials a remote node, drives the version/verack handshake and then dispatches
//! every incoming message serially to a [`PeerEvents`] implementor. Outbound messages go through
//! a writer task: control messages are written immediately, `addr` gossip is trickled on a slow
//! interval so the crawler does not perturb the peer behaviour it is observing.

use std::{
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use bitcoin::p2p::{
    address::Address,
    message::NetworkMessage,
    message_network::VersionMessage,
    Magic,
    ServiceFlags,
};
use log::*;
use rand::{rngs::OsRng, RngCore};
use tokio::{
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpStream,
    },
    sync::{mpsc, oneshot, watch},
    time,
    time::MissedTickBehavior,
};

pub mod codec;
mod error;
mod events;

pub use error::PeerError;
pub use events::PeerEvents;

const LOG_TARGET: &str = "crawler::peer";

/// Protocol version spoken on the wire.
pub const DEFAULT_PROTOCOL_VERSION: u32 = 70015;

/// Identity and cadence configuration for outbound peers.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub user_agent_name: String,
    pub user_agent_version: String,
    pub services: ServiceFlags,
    pub magic: Magic,
    pub protocol_version: u32,
    pub connect_timeout: Duration,
    /// Cadence of keepalive pings sent by the writer task.
    pub ping_interval: Duration,
    /// Flush cadence for queued gossip messages.
    pub trickle_interval: Duration,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            user_agent_name: "Satoshi".to_string(),
            user_agent_version: "0.17.99".to_string(),
            services: default_services(),
            magic: Magic::BITCOIN,
            protocol_version: DEFAULT_PROTOCOL_VERSION,
            connect_timeout: Duration::from_secs(5),
            ping_interval: Duration::from_secs(120),
            trickle_interval: Duration::from_secs(120),
        }
    }
}

impl PeerConfig {
    /// BIP14-style user agent string, e.g. `/Satoshi:0.17.99/`.
    pub fn user_agent(&self) -> String {
        format!("/{}:{}/", self.user_agent_name, self.user_agent_version)
    }
}

/// The service bits a regular full node would advertise. Bits 4 (xthin), 5 and 7 (2x) have no
/// named flag in the protocol library but are part of the impersonated identity.
fn default_services() -> ServiceFlags {
    ServiceFlags::NETWORK |
        ServiceFlags::GETUTXO |
        ServiceFlags::BLOOM |
        ServiceFlags::WITNESS |
        ServiceFlags::COMPACT_FILTERS |
        ServiceFlags::from((1u64 << 4) | (1 << 5) | (1 << 7))
}

pub(crate) struct QueuedMessage {
    pub(crate) msg: NetworkMessage,
    pub(crate) done: Option<oneshot::Sender<()>>,
}

pub(crate) struct PeerState {
    shutdown: watch::Sender<bool>,
    last_ping_nonce: Mutex<Option<u64>>,
    remote_version: Mutex<Option<VersionMessage>>,
}

impl PeerState {
    fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            shutdown,
            last_ping_nonce: Mutex::new(None),
            remote_version: Mutex::new(None),
        }
    }
}

/// Cloneable handle through which callbacks (and anything they spawn) talk back to the
/// connection.
#[derive(Clone)]
pub struct PeerHandle {
    queue_tx: mpsc::UnboundedSender<QueuedMessage>,
    state: Arc<PeerState>,
}

impl PeerHandle {
    /// Queues a message for the writer task. Dropped silently once the connection has ended.
    pub fn queue_message(&self, msg: NetworkMessage) {
        let _ = self.queue_tx.send(QueuedMessage { msg, done: None });
    }

    /// As [`queue_message`](Self::queue_message), with a completion signal fired after the frame
    /// has been written to the socket.
    pub fn queue_message_with_done(&self, msg: NetworkMessage, done: oneshot::Sender<()>) {
        let _ = self.queue_tx.send(QueuedMessage { msg, done: Some(done) });
    }

    /// Initiates a clean disconnect. Idempotent.
    pub fn disconnect(&self) {
        self.state.shutdown.send_replace(true);
    }

    pub fn is_disconnecting(&self) -> bool {
        *self.state.shutdown.borrow()
    }

    /// Nonce of the last keepalive ping sent to the remote.
    pub fn last_ping_nonce(&self) -> Option<u64> {
        *self.state.last_ping_nonce.lock().unwrap()
    }

    /// The remote's version message, once received. Its receiver field is our own address as the
    /// remote sees it.
    pub fn remote_version(&self) -> Option<VersionMessage> {
        self.state.remote_version.lock().unwrap().clone()
    }

    #[cfg(test)]
    pub(crate) fn set_last_ping_nonce(&self, nonce: u64) {
        *self.state.last_ping_nonce.lock().unwrap() = Some(nonce);
    }
}

/// A dialled outbound connection, ready to run the protocol.
pub struct OutboundPeer {
    config: PeerConfig,
    addr: SocketAddr,
    stream: TcpStream,
    state: Arc<PeerState>,
    queue_tx: mpsc::UnboundedSender<QueuedMessage>,
    queue_rx: mpsc::UnboundedReceiver<QueuedMessage>,
}

impl OutboundPeer {
    /// Dials the remote with the configured connect timeout.
    pub async fn connect(config: PeerConfig, addr: SocketAddr) -> Result<Self, PeerError> {
        let stream = time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| PeerError::DialTimeout(config.connect_timeout))??;

        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config,
            addr,
            stream,
            state: Arc::new(PeerState::new()),
            queue_tx,
            queue_rx,
        })
    }

    pub fn handle(&self) -> PeerHandle {
        PeerHandle {
            queue_tx: self.queue_tx.clone(),
            state: self.state.clone(),
        }
    }

    /// Runs the handshake and the serial callback loop until the connection ends, either because
    /// the remote went away or because [`PeerHandle::disconnect`] was called.
    pub async fn run<H>(self, handler: &mut H) -> Result<(), PeerError>
    where H: PeerEvents
    {
        let Self {
            config,
            addr,
            stream,
            state,
            queue_tx,
            queue_rx,
        } = self;

        let (reader, writer) = stream.into_split();
        let handle = PeerHandle {
            queue_tx,
            state: state.clone(),
        };

        let writer_task = tokio::spawn(write_loop(writer, queue_rx, state.clone(), config.clone()));

        handle.queue_message(NetworkMessage::Version(build_version(&config, addr)));
        debug!(target: LOG_TARGET, "Opened outbound session to {}", addr);

        let result = read_loop(reader, handler, &handle, &state, &config, addr).await;

        state.shutdown.send_replace(true);
        let _ = writer_task.await;
        debug!(target: LOG_TARGET, "Session with {} ended", addr);
        result
    }
}

async fn read_loop<H>(
    mut reader: OwnedReadHalf,
    handler: &mut H,
    handle: &PeerHandle,
    state: &Arc<PeerState>,
    config: &PeerConfig,
    addr: SocketAddr,
) -> Result<(), PeerError>
where
    H: PeerEvents,
{
    let mut shutdown_rx = state.shutdown.subscribe();
    let mut got_version = false;
    let mut got_verack = false;

    loop {
        let frame = tokio::select! {
            res = codec::read_message(&mut reader, config.magic) => res?,
            _ = shutdown_rx.wait_for(|stop| *stop) => return Ok(()),
        };
        let Some((raw, bytes_read)) = frame else {
            return Ok(());
        };

        handler.on_read(handle, bytes_read).await;

        match raw.payload() {
            NetworkMessage::Version(version) => {
                if got_version {
                    debug!(target: LOG_TARGET, "{} sent a duplicate version message", addr);
                    continue;
                }
                got_version = true;
                *state.remote_version.lock().unwrap() = Some(version.clone());
                handler.on_version(handle, version).await;
                handle.queue_message(NetworkMessage::Verack);
            },
            NetworkMessage::Verack => {
                if got_verack {
                    debug!(target: LOG_TARGET, "{} sent a duplicate verack message", addr);
                    continue;
                }
                got_verack = true;
                handler.on_verack(handle).await;
            },
            NetworkMessage::Addr(addresses) => handler.on_addr(handle, addresses).await,
            NetworkMessage::Inv(inventory) => handler.on_inv(handle, inventory).await,
            NetworkMessage::Ping(nonce) => handler.on_ping(handle, *nonce).await,
            NetworkMessage::Pong(nonce) => handler.on_pong(handle, *nonce).await,
            NetworkMessage::Tx(tx) => handler.on_tx(handle, tx).await,
            NetworkMessage::Block(block) => handler.on_block(handle, block).await,
            NetworkMessage::Reject(reject) => handler.on_reject(handle, reject).await,
            NetworkMessage::MemPool => handler.on_mempool(handle).await,
            other => {
                trace!(target: LOG_TARGET, "{}: ignoring '{}' message", addr, other.cmd());
            },
        }
    }
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut queue_rx: mpsc::UnboundedReceiver<QueuedMessage>,
    state: Arc<PeerState>,
    config: PeerConfig,
) {
    let mut shutdown_rx = state.shutdown.subscribe();
    let mut pending_gossip: Vec<QueuedMessage> = Vec::new();

    let mut trickle = time::interval_at(time::Instant::now() + config.trickle_interval, config.trickle_interval);
    trickle.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut ping = time::interval_at(time::Instant::now() + config.ping_interval, config.ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        if *shutdown_rx.borrow() {
            break;
        }
        tokio::select! {
            maybe_msg = queue_rx.recv() => {
                let Some(queued) = maybe_msg else { break; };
                if matches!(queued.msg, NetworkMessage::Addr(_)) {
                    pending_gossip.push(queued);
                } else if write_queued(&mut writer, config.magic, queued).await.is_err() {
                    state.shutdown.send_replace(true);
                    break;
                }
            },
            _ = trickle.tick() => {
                let mut failed = false;
                for queued in pending_gossip.drain(..) {
                    if write_queued(&mut writer, config.magic, queued).await.is_err() {
                        failed = true;
                        break;
                    }
                }
                if failed {
                    state.shutdown.send_replace(true);
                    break;
                }
            },
            _ = ping.tick() => {
                let nonce = OsRng.next_u64();
                *state.last_ping_nonce.lock().unwrap() = Some(nonce);
                let queued = QueuedMessage { msg: NetworkMessage::Ping(nonce), done: None };
                if write_queued(&mut writer, config.magic, queued).await.is_err() {
                    state.shutdown.send_replace(true);
                    break;
                }
            },
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            },
        }
    }
}

async fn write_queued(writer: &mut OwnedWriteHalf, magic: Magic, queued: QueuedMessage) -> Result<(), PeerError> {
    if let Err(err) = codec::write_message(writer, magic, queued.msg).await {
        debug!(target: LOG_TARGET, "Write failed, dropping connection: {}", err);
        return Err(err);
    }
    if let Some(done) = queued.done {
        let _ = done.send(());
    }
    Ok(())
}

fn build_version(config: &PeerConfig, remote: SocketAddr) -> VersionMessage {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    let unspecified = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    VersionMessage {
        version: config.protocol_version,
        services: config.services,
        timestamp,
        receiver: Address::new(&remote, ServiceFlags::NONE),
        sender: Address::new(&unspecified, config.services),
        nonce: OsRng.next_u64(),
        user_agent: config.user_agent(),
        start_height: 0,
        relay: true,
    }
}

#[cfg(test)]
pub(crate) fn test_handle() -> (PeerHandle, mpsc::UnboundedReceiver<QueuedMessage>) {
    let (queue_tx, queue_rx) = mpsc::unbounded_channel();
    let handle = PeerHandle {
        queue_tx,
        state: Arc::new(PeerState::new()),
    };
    (handle, queue_rx)
}

#[cfg(test)]
mod test {
    use async_trait::async_trait;
    use tokio::net::TcpListener;

    use super::*;

    #[derive(Default)]
    struct RecordingHandler {
        versions: usize,
        veracks: usize,
        reads: usize,
    }

    #[async_trait]
    impl PeerEvents for RecordingHandler {
        async fn on_version(&mut self, _peer: &PeerHandle, _version: &VersionMessage) {
            self.versions += 1;
        }

        async fn on_verack(&mut self, _peer: &PeerHandle) {
            self.veracks += 1;
        }

        async fn on_ping(&mut self, peer: &PeerHandle, nonce: u64) {
            peer.queue_message(NetworkMessage::Pong(nonce));
        }

        async fn on_read(&mut self, _peer: &PeerHandle, _bytes_read: usize) {
            self.reads += 1;
        }
    }

    #[test]
    fn user_agent_rendering() {
        let config = PeerConfig::default();
        assert_eq!(config.user_agent(), "/Satoshi:0.17.99/");
    }

    #[test]
    fn impersonated_services() {
        let services = default_services();
        assert!(services.has(ServiceFlags::NETWORK));
        assert!(services.has(ServiceFlags::BLOOM));
        assert!(services.has(ServiceFlags::WITNESS));
        assert!(services.has(ServiceFlags::GETUTXO));
        assert!(services.has(ServiceFlags::COMPACT_FILTERS));
        assert!(services.has(ServiceFlags::from(1 << 5)));
    }

    #[tokio::test]
    async fn connect_refused_is_an_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        match OutboundPeer::connect(PeerConfig::default(), addr).await {
            Err(PeerError::Io(_)) | Err(PeerError::DialTimeout(_)) => {},
            other => panic!("expected a dial failure, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn handshake_and_ping_dispatch() {
        let magic = Magic::BITCOIN;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, client_addr) = listener.accept().await.unwrap();
            let (raw, _) = codec::read_message(&mut stream, magic).await.unwrap().unwrap();
            assert!(matches!(raw.payload(), NetworkMessage::Version(_)));

            let version = build_version(&PeerConfig::default(), client_addr);
            codec::write_message(&mut stream, magic, NetworkMessage::Version(version))
                .await
                .unwrap();
            codec::write_message(&mut stream, magic, NetworkMessage::Verack).await.unwrap();

            let (raw, _) = codec::read_message(&mut stream, magic).await.unwrap().unwrap();
            assert_eq!(raw.payload(), &NetworkMessage::Verack);

            codec::write_message(&mut stream, magic, NetworkMessage::Ping(7)).await.unwrap();
            let (raw, _) = codec::read_message(&mut stream, magic).await.unwrap().unwrap();
            assert_eq!(raw.payload(), &NetworkMessage::Pong(7));
        });

        let peer = OutboundPeer::connect(PeerConfig::default(), addr).await.unwrap();
        let mut handler = RecordingHandler::default();
        peer.run(&mut handler).await.unwrap();
        server.await.unwrap();

        assert_eq!(handler.versions, 1);
        assert_eq!(handler.veracks, 1);
        // version + verack + ping at minimum
        assert!(handler.reads >= 3);
    }

    #[tokio::test]
    async fn disconnect_ends_the_session() {
        let magic = Magic::BITCOIN;
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            // Swallow whatever the client sends until it goes away.
            while let Ok(Some(_)) = codec::read_message(&mut stream, magic).await {}
        });

        let peer = OutboundPeer::connect(PeerConfig::default(), addr).await.unwrap();
        let handle = peer.handle();
        let mut handler = RecordingHandler::default();
        handle.disconnect();
        peer.run(&mut handler).await.unwrap();
        server.await.unwrap();
        assert!(handle.is_disconnecting());
    }
}
