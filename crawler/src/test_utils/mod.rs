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

//! Test doubles: in-memory implementations of both store traits and a scripted remote peer that
//! speaks just enough of the wire protocol to drive a session end to end.

use std::{
    collections::HashMap,
    net::{IpAddr, SocketAddr},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use bitcoin::p2p::{
    address::Address,
    message::NetworkMessage,
    message_network::VersionMessage,
    Magic,
    ServiceFlags,
};
use chrono::Utc;
use rand::{seq::SliceRandom, Rng};
use tokio::{net::TcpListener, task::JoinHandle};

use crate::{
    peer::codec,
    storage::{
        make_conn_string,
        LivenessStore,
        NodeEvent,
        NodeHistoryEntry,
        NodeInfo,
        NodeStore,
        StorageError,
        ACTIVE_TAG_PREFIX,
        LOCK_PREFIX,
    },
};

#[derive(Default)]
struct NodeStoreInner {
    nodes: Vec<NodeInfo>,
    history: Vec<NodeHistoryEntry>,
    next_node_id: i64,
    next_history_id: i64,
}

/// In-memory [`NodeStore`]. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryNodeStore {
    inner: Arc<Mutex<NodeStoreInner>>,
}

impl MemoryNodeStore {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn node_count(&self) -> usize {
        self.inner.lock().unwrap().nodes.len()
    }

    pub fn nodes(&self) -> Vec<NodeInfo> {
        self.inner.lock().unwrap().nodes.clone()
    }

    pub fn history(&self) -> Vec<NodeHistoryEntry> {
        self.inner.lock().unwrap().history.clone()
    }

    pub fn history_for_event(&self, event: NodeEvent) -> Vec<NodeHistoryEntry> {
        self.inner
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|entry| entry.event_type == event.as_str())
            .cloned()
            .collect()
    }
}

impl NodeStore for MemoryNodeStore {
    fn get_by_conn_string(&self, conn_string: &str) -> Result<Option<NodeInfo>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nodes.iter().find(|node| node.conn_string == conn_string).cloned())
    }

    fn add_node(&self, ip: IpAddr, port: u16, referrer: Option<i64>) -> Result<(NodeInfo, bool), StorageError> {
        let conn_string = make_conn_string(ip, port);
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.nodes.iter().find(|node| node.conn_string == conn_string) {
            return Ok((existing.clone(), false));
        }
        inner.next_node_id += 1;
        let now = Utc::now().naive_utc();
        let node = NodeInfo {
            id: inner.next_node_id,
            conn_string,
            referrer,
            discovery: now,
            last_seen: now,
            version: None,
            data: None,
        };
        inner.nodes.push(node.clone());
        Ok((node, true))
    }

    fn update_node(&self, node: &NodeInfo) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        match inner.nodes.iter_mut().find(|candidate| candidate.id == node.id) {
            Some(existing) => {
                *existing = node.clone();
                Ok(true)
            },
            None => Ok(false),
        }
    }

    fn get_random_node(&self) -> Result<Option<NodeInfo>, StorageError> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.nodes.choose(&mut rand::thread_rng()).cloned())
    }

    fn get_random_nodes(&self, probability: f64) -> Result<Vec<NodeInfo>, StorageError> {
        let inner = self.inner.lock().unwrap();
        let mut rng = rand::thread_rng();
        Ok(inner
            .nodes
            .iter()
            .filter(|_| rng.gen::<f64>() < probability)
            .cloned()
            .collect())
    }

    fn add_history(
        &self,
        node_id: i64,
        event: NodeEvent,
        timestamp: chrono::NaiveDateTime,
        data: Option<serde_json::Value>,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_history_id += 1;
        let entry = NodeHistoryEntry {
            id: inner.next_history_id,
            node_id,
            event_type: event.as_str().to_string(),
            timestamp,
            data,
        };
        inner.history.push(entry);
        Ok(())
    }
}

struct Expiring {
    expires_at: Option<Instant>,
}

impl Expiring {
    fn is_expired(&self) -> bool {
        self.expires_at.map(|at| at <= Instant::now()).unwrap_or(false)
    }
}

#[derive(Default)]
struct LivenessInner {
    entries: HashMap<String, Expiring>,
    counters: HashMap<String, i64>,
    set_active_calls: usize,
}

impl LivenessInner {
    fn purge(&mut self) {
        self.entries.retain(|_, entry| !entry.is_expired());
    }
}

/// In-memory [`LivenessStore`] with real TTL expiry. Clones share state.
#[derive(Clone, Default)]
pub struct MemoryLivenessStore {
    inner: Arc<Mutex<LivenessInner>>,
}

impl MemoryLivenessStore {
    pub fn new() -> Self {
        Default::default()
    }

    /// Number of `set_active` calls observed, for asserting refresh cadence.
    pub fn set_active_calls(&self) -> usize {
        self.inner.lock().unwrap().set_active_calls
    }
}

impl LivenessStore for MemoryLivenessStore {
    fn set_active(&self, conn_string: &str, ttl: Duration) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.set_active_calls += 1;
        inner.entries.insert(format!("{}{}", ACTIVE_TAG_PREFIX, conn_string), Expiring {
            expires_at: Some(Instant::now() + ttl),
        });
        Ok(())
    }

    fn remove_active(&self, conn_string: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&format!("{}{}", ACTIVE_TAG_PREFIX, conn_string));
        Ok(())
    }

    fn check_active(&self, conn_string: &str) -> Result<bool, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge();
        Ok(inner
            .entries
            .contains_key(&format!("{}{}", ACTIVE_TAG_PREFIX, conn_string)))
    }

    fn acquire_lock(&self, resource: &str, ttl: Duration, extend: bool) -> Result<bool, StorageError> {
        let key = format!("{}{}", LOCK_PREFIX, resource);
        let mut inner = self.inner.lock().unwrap();
        inner.purge();
        if !extend && inner.entries.contains_key(&key) {
            return Ok(false);
        }
        inner.entries.insert(key, Expiring {
            expires_at: Some(Instant::now() + ttl),
        });
        Ok(true)
    }

    fn release_lock(&self, resource: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.remove(&format!("{}{}", LOCK_PREFIX, resource));
        Ok(())
    }

    fn incr(&self, counter: &str) -> Result<i64, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        let value = inner.counters.entry(counter.to_string()).or_insert(0);
        *value += 1;
        Ok(*value)
    }

    fn full_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.purge();
        // Prefix globs only, which is all the crawler uses.
        let keys = match pattern.strip_suffix('*') {
            Some(prefix) => inner
                .entries
                .keys()
                .filter(|key| key.starts_with(prefix))
                .cloned()
                .collect(),
            None => inner.entries.keys().filter(|key| *key == pattern).cloned().collect(),
        };
        Ok(keys)
    }

    fn flush_all(&self) -> Result<(), StorageError> {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.counters.clear();
        Ok(())
    }
}

/// A scripted remote node: accepts one connection, completes the handshake, announces the given
/// addresses (on verack and again on each getaddr), and answers pings until the client goes away.
pub struct RemotePeer {
    pub addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl RemotePeer {
    pub async fn spawn(user_agent: &str, announce: Vec<SocketAddr>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind scripted peer listener");
        let addr = listener.local_addr().expect("scripted peer has no local addr");
        let user_agent = user_agent.to_string();

        let handle = tokio::spawn(async move {
            let Ok((mut stream, client_addr)) = listener.accept().await else {
                return;
            };
            let magic = Magic::BITCOIN;
            let timestamp = 0u32;
            let entries: Vec<(u32, Address)> = announce
                .iter()
                .map(|socket_addr| (timestamp, Address::new(socket_addr, ServiceFlags::NETWORK)))
                .collect();

            let mut sent_version = false;
            while let Ok(Some((raw, _))) = codec::read_message(&mut stream, magic).await {
                let response = match raw.payload() {
                    NetworkMessage::Version(_) if !sent_version => {
                        sent_version = true;
                        let version = scripted_version(&user_agent, client_addr);
                        if codec::write_message(&mut stream, magic, NetworkMessage::Version(version))
                            .await
                            .is_err()
                        {
                            return;
                        }
                        Some(NetworkMessage::Verack)
                    },
                    NetworkMessage::Verack => Some(NetworkMessage::Addr(entries.clone())),
                    NetworkMessage::GetAddr => Some(NetworkMessage::Addr(entries.clone())),
                    NetworkMessage::Ping(nonce) => Some(NetworkMessage::Pong(*nonce)),
                    _ => None,
                };
                if let Some(msg) = response {
                    if codec::write_message(&mut stream, magic, msg).await.is_err() {
                        return;
                    }
                }
            }
        });

        Self { addr, handle }
    }

    /// The conn string a node store would hold for this peer.
    pub fn conn_string(&self) -> String {
        make_conn_string(self.addr.ip(), self.addr.port())
    }

    pub async fn finished(self) {
        let _ = self.handle.await;
    }
}

fn scripted_version(user_agent: &str, client_addr: SocketAddr) -> VersionMessage {
    VersionMessage {
        version: 70015,
        services: ServiceFlags::NETWORK,
        timestamp: 0,
        receiver: Address::new(&client_addr, ServiceFlags::NONE),
        sender: Address::new(&client_addr, ServiceFlags::NETWORK),
        nonce: rand::thread_rng().gen(),
        user_agent: user_agent.to_string(),
        start_height: 0,
        relay: false,
    }
}
