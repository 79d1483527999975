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

//! One outbound peer session, end to end: dial, handshake, gossip bookkeeping, liveness tagging
//! and history writes. Sessions are fire-and-forget; nothing they do can fail their siblings or
//! the coordinator, which only observes counters and the live peer count.

use std::{
    net::SocketAddr,
    sync::{atomic::Ordering, Arc},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use bitcoin::p2p::{
    address::Address,
    message::NetworkMessage,
    message_blockdata::Inventory,
    message_network::VersionMessage,
    ServiceFlags,
};
use chrono::Utc;
use log::*;
use serde::Serialize;
use tokio::sync::oneshot;

use crate::{
    coordinator::CrawlContext,
    peer::{OutboundPeer, PeerEvents, PeerHandle},
    storage::{make_conn_string, parse_conn_string, LivenessStore, NodeEvent, NodeInfo, NodeStore},
};

const LOG_TARGET: &str = "crawler::session";

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Soft upper bound on session lifetime, enforced on the next outbound addr reply.
    pub dwell_threshold: Duration,
    /// Minimum interval between liveness tag refreshes.
    pub activity_refresh_interval: Duration,
    /// Expiry of the cluster-wide active tag.
    pub active_ttl: Duration,
    /// Eager-gossip variant: also solicit addresses every time the remote pings us. Useful while
    /// the discovery graph is still small; off by default.
    pub getaddr_on_ping: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dwell_threshold: Duration::from_secs(60 * 60),
            activity_refresh_interval: Duration::from_secs(60),
            active_ttl: Duration::from_secs(120),
            getaddr_on_ping: false,
        }
    }
}

#[derive(Serialize)]
struct ConnectionFailureMetadata<'a> {
    output: &'a str,
}

#[derive(Serialize)]
struct SessionBeginMetadata<'a> {
    current_peer_version: &'a str,
}

#[derive(Serialize)]
struct DiscoveryMetadata {
    count: usize,
}

#[derive(Serialize)]
struct SessionEndMetadata {
    duration_secs: u64,
}

/// Drives a single outbound session against one node record.
pub struct SessionHandler<TNode, TLive> {
    node: NodeInfo,
    context: Arc<CrawlContext<TNode, TLive>>,
    started: Instant,
    last_activity_report: Option<Instant>,
}

impl<TNode, TLive> SessionHandler<TNode, TLive>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    pub fn new(node: NodeInfo, context: Arc<CrawlContext<TNode, TLive>>) -> Self {
        Self {
            node,
            context,
            started: Instant::now(),
            last_activity_report: None,
        }
    }

    /// Runs the session to completion. Every outcome is accounted for in history rows and the
    /// shared counters; the returned future never fails.
    pub async fn run(mut self) {
        self.started = Instant::now();
        self.context.counters.attempts.incr();

        let addr = match parse_conn_string(&self.node.conn_string) {
            Ok((ip, port)) => SocketAddr::new(ip, port),
            Err(err) => {
                self.record_failure(NodeEvent::ProtocolError, &err.to_string()).await;
                return;
            },
        };

        let peer = match OutboundPeer::connect(self.context.peer_config.clone(), addr).await {
            Ok(peer) => peer,
            Err(err) => {
                debug!(target: LOG_TARGET, "Dial failed for {}: {}", self.node.conn_string, err);
                self.record_failure(NodeEvent::ConnectError, &err.to_string()).await;
                return;
            },
        };

        self.context.counters.successes.incr();
        // Confirmed live peers only; attempts are not counted here.
        self.context.peer_count.fetch_add(1, Ordering::SeqCst);

        let result = peer.run(&mut self).await;

        self.context.counters.voluntary_disconnects.incr();
        self.context.peer_count.fetch_sub(1, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let data = serde_json::to_value(SessionEndMetadata {
                    duration_secs: self.started.elapsed().as_secs(),
                })
                .ok();
                if let Err(err) = self
                    .context
                    .node_db
                    .add_history(self.node.id, NodeEvent::SessionEnd, Utc::now().naive_utc(), data)
                    .await
                {
                    warn!(
                        target: LOG_TARGET,
                        "Failed to record session end for {}: {}", self.node.conn_string, err
                    );
                }
            },
            Err(err) => {
                self.record_failure(NodeEvent::ProtocolError, &err.to_string()).await;
            },
        }
    }

    async fn record_failure(&self, event: NodeEvent, output: &str) {
        self.context.counters.failures.incr();
        if let Err(err) = self.context.liveness.remove_active(&self.node.conn_string).await {
            warn!(
                target: LOG_TARGET,
                "Failed to drop active tag for {}: {}", self.node.conn_string, err
            );
        }
        let data = serde_json::to_value(ConnectionFailureMetadata { output }).ok();
        if let Err(err) = self
            .context
            .node_db
            .add_history(self.node.id, event, Utc::now().naive_utc(), data)
            .await
        {
            warn!(
                target: LOG_TARGET,
                "Failed to record {} for {}: {}", event, self.node.conn_string, err
            );
        }
    }

    async fn record_discoveries(&self, count: usize) {
        let data = serde_json::to_value(DiscoveryMetadata { count }).ok();
        if let Err(err) = self
            .context
            .node_db
            .add_history(self.node.id, NodeEvent::Discovery, Utc::now().naive_utc(), data)
            .await
        {
            warn!(
                target: LOG_TARGET,
                "Failed to record discoveries from {}: {}", self.node.conn_string, err
            );
        }
    }

    /// Replies to a processed addr batch with one random known node plus our own address. Once
    /// the dwell threshold has passed, the reply carries a completion signal and the session is
    /// disconnected after the frame has drained.
    async fn send_addr_reply(&self, peer: &PeerHandle) {
        let random = match self.context.node_db.get_random_node().await {
            Ok(Some(node)) => node,
            Ok(None) => return,
            Err(err) => {
                warn!(target: LOG_TARGET, "Could not sample a node for the addr reply: {}", err);
                return;
            },
        };
        let (ip, port) = match parse_conn_string(&random.conn_string) {
            Ok(pair) => pair,
            Err(err) => {
                warn!(target: LOG_TARGET, "Stored conn string failed to parse: {}", err);
                return;
            },
        };

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or_default();
        let mut reply = vec![(
            timestamp,
            Address::new(&SocketAddr::new(ip, port), ServiceFlags::NETWORK),
        )];
        if let Some(version) = peer.remote_version() {
            // Our own address, as the remote advertised it back to us.
            reply.push((timestamp, version.receiver));
        }

        if self.started.elapsed() > self.context.session_config.dwell_threshold {
            let (done_tx, done_rx) = oneshot::channel();
            peer.queue_message_with_done(NetworkMessage::Addr(reply), done_tx);
            let handle = peer.clone();
            let conn_string = self.node.conn_string.clone();
            tokio::spawn(async move {
                let _ = done_rx.await;
                info!(
                    target: LOG_TARGET,
                    "Disconnecting from {} after a completed addr exchange", conn_string
                );
                handle.disconnect();
            });
        } else {
            peer.queue_message(NetworkMessage::Addr(reply));
        }
    }
}

#[async_trait]
impl<TNode, TLive> PeerEvents for SessionHandler<TNode, TLive>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    async fn on_version(&mut self, _peer: &PeerHandle, version: &VersionMessage) {
        self.node.version = Some(version.user_agent.clone());
        self.node.last_seen = Utc::now().naive_utc();

        let data = serde_json::to_value(SessionBeginMetadata {
            current_peer_version: &version.user_agent,
        })
        .ok();
        if let Err(err) = self
            .context
            .node_db
            .add_history(self.node.id, NodeEvent::SessionBegin, self.node.last_seen, data)
            .await
        {
            warn!(
                target: LOG_TARGET,
                "Failed to record session begin for {}: {}", self.node.conn_string, err
            );
        }
    }

    async fn on_verack(&mut self, peer: &PeerHandle) {
        match self.context.node_db.update_node(self.node.clone()).await {
            Ok(true) => {},
            Ok(false) => {
                warn!(
                    target: LOG_TARGET,
                    "Failed to update node session time for {}", self.node.conn_string
                );
            },
            Err(err) => {
                warn!(
                    target: LOG_TARGET,
                    "Failed to update node {}: {}", self.node.conn_string, err
                );
            },
        }
        // Solicit their view of the network now that the handshake is done.
        peer.queue_message(NetworkMessage::GetAddr);
    }

    async fn on_addr(&mut self, peer: &PeerHandle, addresses: &[(u32, Address)]) {
        let mut discovered = 0usize;
        for (_, address) in addresses {
            let Ok(socket_addr) = address.socket_addr() else {
                continue;
            };
            let conn_string = make_conn_string(socket_addr.ip(), socket_addr.port());

            match self.context.node_db.get_by_conn_string(&conn_string).await {
                Ok(Some(_)) => continue,
                Ok(None) => {},
                Err(err) => {
                    warn!(target: LOG_TARGET, "Lookup failed for {}: {}", conn_string, err);
                    continue;
                },
            }

            match self
                .context
                .node_db
                .add_node(socket_addr.ip(), socket_addr.port(), Some(self.node.id))
                .await
            {
                Ok((node, true)) => {
                    discovered += 1;
                    debug!(target: LOG_TARGET, "Added new unconfirmed node {}", node.conn_string);
                },
                Ok((_, false)) => {},
                Err(err) => {
                    warn!(target: LOG_TARGET, "Failed to add node {}: {}", conn_string, err);
                },
            }
        }

        if discovered > 0 {
            info!(
                target: LOG_TARGET,
                "Learned {} new node(s) from {} ({} advertised)",
                discovered,
                self.node.conn_string,
                addresses.len()
            );
            self.record_discoveries(discovered).await;
        }

        self.send_addr_reply(peer).await;
    }

    async fn on_inv(&mut self, peer: &PeerHandle, inventory: &[Inventory]) {
        let mut blocks = Vec::new();
        for inv in inventory {
            match inv {
                Inventory::Block(hash) => {
                    debug!(target: LOG_TARGET, "->Block {} from {}", hash, self.node.conn_string);
                    blocks.push(*inv);
                },
                Inventory::Transaction(_) => {},
                other => {
                    trace!(target: LOG_TARGET, "->{:?} from {}", other, self.node.conn_string);
                },
            }
        }
        if !blocks.is_empty() {
            peer.queue_message(NetworkMessage::GetData(blocks));
        }
    }

    async fn on_ping(&mut self, peer: &PeerHandle, nonce: u64) {
        peer.queue_message(NetworkMessage::Pong(nonce));
        if self.context.session_config.getaddr_on_ping {
            peer.queue_message(NetworkMessage::GetAddr);
        }
    }

    async fn on_pong(&mut self, peer: &PeerHandle, nonce: u64) {
        match peer.last_ping_nonce() {
            Some(expected) if expected != nonce => {
                warn!(
                    target: LOG_TARGET,
                    "Pong nonce mismatch from {}: expected {}, got {}", self.node.conn_string, expected, nonce
                );
            },
            None => {
                debug!(
                    target: LOG_TARGET,
                    "Unsolicited pong from {}", self.node.conn_string
                );
            },
            _ => {},
        }
    }

    async fn on_tx(&mut self, _peer: &PeerHandle, tx: &bitcoin::Transaction) {
        trace!(target: LOG_TARGET, "MsgTx {} from {}", tx.txid(), self.node.conn_string);
    }

    async fn on_block(&mut self, _peer: &PeerHandle, block: &bitcoin::Block) {
        debug!(
            target: LOG_TARGET,
            "MsgBlock {} from {}",
            block.block_hash(),
            self.node.conn_string
        );
    }

    async fn on_reject(&mut self, _peer: &PeerHandle, reject: &bitcoin::p2p::message_network::Reject) {
        debug!(target: LOG_TARGET, "MsgReject from {}: {:?}", self.node.conn_string, reject);
    }

    async fn on_mempool(&mut self, _peer: &PeerHandle) {
        debug!(target: LOG_TARGET, "MsgMemPool from {}", self.node.conn_string);
    }

    async fn on_read(&mut self, _peer: &PeerHandle, _bytes_read: usize) {
        let refresh_due = self
            .last_activity_report
            .map(|at| at.elapsed() > self.context.session_config.activity_refresh_interval)
            .unwrap_or(true);
        if refresh_due {
            if let Err(err) = self
                .context
                .liveness
                .set_active(&self.node.conn_string, self.context.session_config.active_ttl)
                .await
            {
                warn!(
                    target: LOG_TARGET,
                    "Failed to refresh active tag for {}: {}", self.node.conn_string, err
                );
            }
            self.last_activity_report = Some(Instant::now());
        }
    }
}

#[cfg(test)]
mod test {
    use std::{net::IpAddr, sync::atomic::AtomicI64};

    use bitcoin::hashes::Hash;

    use super::*;
    use crate::{
        coordinator::CrawlCounters,
        peer::{test_handle, PeerConfig},
        storage::{LivenessDatabase, NodeDatabase},
        test_utils::{MemoryLivenessStore, MemoryNodeStore},
    };

    type TestContext = Arc<CrawlContext<MemoryNodeStore, MemoryLivenessStore>>;

    fn test_context(session_config: SessionConfig) -> (TestContext, MemoryNodeStore, MemoryLivenessStore) {
        let nodes = MemoryNodeStore::new();
        let liveness = MemoryLivenessStore::new();
        let context = Arc::new(CrawlContext {
            node_db: NodeDatabase::new(nodes.clone()),
            liveness: LivenessDatabase::new(liveness.clone()),
            counters: CrawlCounters::new(),
            peer_count: AtomicI64::new(0),
            peer_config: PeerConfig::default(),
            session_config,
        });
        (context, nodes, liveness)
    }

    fn seed_node(nodes: &MemoryNodeStore) -> NodeInfo {
        let ip = "198.51.100.7".parse::<IpAddr>().unwrap();
        let (node, inserted) = nodes.add_node(ip, 8333, None).unwrap();
        assert!(inserted);
        node
    }

    fn addr_entry(ip: &str, port: u16) -> (u32, Address) {
        let socket_addr = SocketAddr::new(ip.parse().unwrap(), port);
        (0, Address::new(&socket_addr, ServiceFlags::NETWORK))
    }

    fn remote_version(user_agent: &str) -> VersionMessage {
        let remote = "[2001:db8::99]:8333".parse::<SocketAddr>().unwrap();
        let local = "127.0.0.1:48333".parse::<SocketAddr>().unwrap();
        VersionMessage {
            version: 70015,
            services: ServiceFlags::NETWORK,
            timestamp: 0,
            receiver: Address::new(&local, ServiceFlags::NONE),
            sender: Address::new(&remote, ServiceFlags::NETWORK),
            nonce: 1,
            user_agent: user_agent.to_string(),
            start_height: 0,
            relay: false,
        }
    }

    #[tokio::test]
    async fn addr_batch_discovers_nodes_with_referrer() {
        let (context, nodes, _) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed.clone(), context);
        let (handle, mut queue) = test_handle();

        let batch = [
            addr_entry("192.0.2.10", 8333),
            addr_entry("192.0.2.11", 8334),
            addr_entry("192.0.2.10", 8333),
        ];
        handler.on_addr(&handle, &batch).await;

        assert_eq!(nodes.node_count(), 3);
        let discovered = nodes.get_by_conn_string("[192.0.2.10]:8333").unwrap().unwrap();
        assert_eq!(discovered.referrer, Some(seed.id));

        let history = nodes.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "discovery");
        assert_eq!(history[0].data.as_ref().unwrap()["count"], 2);

        // The batch is answered with an addr reply built from a random stored node.
        let queued = queue.try_recv().expect("expected an addr reply");
        assert!(matches!(queued.msg, NetworkMessage::Addr(_)));
        assert!(queued.done.is_none());

        // Re-delivery of the same batch adds nothing.
        handler.on_addr(&handle, &batch).await;
        assert_eq!(nodes.node_count(), 3);
        assert_eq!(nodes.history().len(), 1);
    }

    #[tokio::test]
    async fn advertised_zero_port_is_normalized() {
        let (context, nodes, _) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed, context);
        let (handle, _queue) = test_handle();

        handler.on_addr(&handle, &[addr_entry("2001:db8::1", 0)]).await;

        assert!(nodes.get_by_conn_string("[2001:db8::1]:8333").unwrap().is_some());
    }

    #[tokio::test]
    async fn dwell_threshold_disconnects_after_the_reply_drains() {
        // A zero dwell budget makes every session immediately due for rotation.
        let (context, nodes, _) = test_context(SessionConfig {
            dwell_threshold: Duration::ZERO,
            ..Default::default()
        });
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed, context);
        let (handle, mut queue) = test_handle();

        handler.on_addr(&handle, &[addr_entry("192.0.2.20", 8333)]).await;

        let queued = queue.try_recv().expect("expected an addr reply");
        assert!(matches!(queued.msg, NetworkMessage::Addr(_)));
        let done = queued.done.expect("dwell reply must carry a completion signal");
        assert!(!handle.is_disconnecting());

        done.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_disconnecting());
    }

    #[tokio::test]
    async fn version_and_verack_update_the_node_record() {
        let (context, nodes, _) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed.clone(), context);
        let (handle, mut queue) = test_handle();

        let version = remote_version("/Satoshi:0.18.0/");
        handler.on_version(&handle, &version).await;

        let history = nodes.history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].event_type, "session_begin");
        assert_eq!(
            history[0].data.as_ref().unwrap()["current_peer_version"],
            "/Satoshi:0.18.0/"
        );

        handler.on_verack(&handle).await;

        let stored = nodes.get_by_conn_string(&seed.conn_string).unwrap().unwrap();
        assert_eq!(stored.version.as_deref(), Some("/Satoshi:0.18.0/"));
        assert!(stored.discovery <= stored.last_seen);

        let queued = queue.try_recv().expect("verack must solicit addresses");
        assert_eq!(queued.msg, NetworkMessage::GetAddr);
    }

    #[tokio::test]
    async fn inv_requests_block_data_only() {
        let (context, nodes, _) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed, context);
        let (handle, mut queue) = test_handle();

        let block = Inventory::Block(bitcoin::BlockHash::all_zeros());
        let tx = Inventory::Transaction(bitcoin::Txid::all_zeros());
        handler.on_inv(&handle, &[tx, block]).await;

        let queued = queue.try_recv().expect("expected a getdata request");
        assert_eq!(queued.msg, NetworkMessage::GetData(vec![block]));
        assert!(queue.try_recv().is_err());
    }

    #[tokio::test]
    async fn ping_is_answered_and_optionally_solicits() {
        let (context, nodes, _) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed.clone(), context);
        let (handle, mut queue) = test_handle();

        handler.on_ping(&handle, 77).await;
        assert_eq!(queue.try_recv().unwrap().msg, NetworkMessage::Pong(77));
        assert!(queue.try_recv().is_err());

        let (context, _, _) = test_context(SessionConfig {
            getaddr_on_ping: true,
            ..Default::default()
        });
        let mut handler = SessionHandler::new(seed, context);
        handler.on_ping(&handle, 78).await;
        assert_eq!(queue.try_recv().unwrap().msg, NetworkMessage::Pong(78));
        assert_eq!(queue.try_recv().unwrap().msg, NetworkMessage::GetAddr);
    }

    #[tokio::test]
    async fn pong_nonce_mismatch_is_tolerated() {
        let (context, nodes, _) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed, context);
        let (handle, _queue) = test_handle();

        handle.set_last_ping_nonce(41);
        handler.on_pong(&handle, 42).await;
        assert!(!handle.is_disconnecting());
    }

    #[tokio::test]
    async fn read_activity_refreshes_the_active_tag_once_per_interval() {
        let (context, nodes, liveness) = test_context(SessionConfig::default());
        let seed = seed_node(&nodes);
        let mut handler = SessionHandler::new(seed.clone(), context);
        let (handle, _queue) = test_handle();

        handler.on_read(&handle, 24).await;
        handler.on_read(&handle, 24).await;

        assert!(liveness.check_active(&seed.conn_string).unwrap());
        assert_eq!(liveness.set_active_calls(), 1);
    }
}
