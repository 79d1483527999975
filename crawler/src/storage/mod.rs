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

//! Storage backends for the discovery graph (relational) and the cluster liveness tags
//! (key-value).
//!
//! Backends implement the synchronous [`NodeStore`] / [`LivenessStore`] traits. Async callers go
//! through the [`NodeDatabase`] / [`LivenessDatabase`] facades, which run every operation on the
//! blocking thread pool so that a held pool connection can never suspend the calling task.

use std::{net::IpAddr, sync::Arc, time::Duration};

use chrono::NaiveDateTime;

pub mod error;
pub mod model;
pub mod postgres;
pub mod redis;
mod schema;

pub use self::{
    error::StorageError,
    model::{make_conn_string, parse_conn_string, NodeEvent, NodeHistoryEntry, NodeInfo, DEFAULT_PEER_PORT},
    postgres::PostgresNodeStore,
    redis::{RedisLivenessStore, ACTIVE_TAG_PREFIX, LOCK_PREFIX},
};

/// Relational persistence of discovered peers and their session history.
pub trait NodeStore: Send + Sync {
    /// Point lookup by the natural key.
    fn get_by_conn_string(&self, conn_string: &str) -> Result<Option<NodeInfo>, StorageError>;
    /// Inserts a newly observed endpoint. A unique-key conflict is the ordinary "already known"
    /// path and returns the existing row with `false`.
    fn add_node(&self, ip: IpAddr, port: u16, referrer: Option<i64>) -> Result<(NodeInfo, bool), StorageError>;
    /// Overwrites the mutable columns of the row identified by `node.id`. Returns whether a row
    /// changed.
    fn update_node(&self, node: &NodeInfo) -> Result<bool, StorageError>;
    /// One uniformly-sampled row, or `None` when the sample came back empty (callers retry).
    fn get_random_node(&self) -> Result<Option<NodeInfo>, StorageError>;
    /// A sampled batch; each row is included with probability `probability`.
    fn get_random_nodes(&self, probability: f64) -> Result<Vec<NodeInfo>, StorageError>;
    /// Appends one history row for the node.
    fn add_history(
        &self,
        node_id: i64,
        event: NodeEvent,
        timestamp: NaiveDateTime,
        data: Option<serde_json::Value>,
    ) -> Result<(), StorageError>;
}

/// Ephemeral cluster coordination state: active-session tags, advisory locks and counters.
pub trait LivenessStore: Send + Sync {
    fn set_active(&self, conn_string: &str, ttl: Duration) -> Result<(), StorageError>;
    fn remove_active(&self, conn_string: &str) -> Result<(), StorageError>;
    fn check_active(&self, conn_string: &str) -> Result<bool, StorageError>;
    /// Acquires the advisory lock unless it is already held. A lease-extension caller passes
    /// `extend = true` to refresh the expiry unconditionally.
    fn acquire_lock(&self, resource: &str, ttl: Duration, extend: bool) -> Result<bool, StorageError>;
    fn release_lock(&self, resource: &str) -> Result<(), StorageError>;
    fn incr(&self, counter: &str) -> Result<i64, StorageError>;
    /// All keys matching `pattern`, e.g. `active_*` for the cluster-wide active peer set.
    fn full_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError>;
    /// Administrative purge of the whole store.
    fn flush_all(&self) -> Result<(), StorageError>;
}

fn blocking_err(err: tokio::task::JoinError) -> StorageError {
    StorageError::BlockingTaskSpawn(err.to_string())
}

/// Async facade over a [`NodeStore`].
pub struct NodeDatabase<T> {
    db: Arc<T>,
}

impl<T> Clone for NodeDatabase<T> {
    fn clone(&self) -> Self {
        Self { db: self.db.clone() }
    }
}

impl<T> NodeDatabase<T>
where T: NodeStore + 'static
{
    pub fn new(db: T) -> Self {
        Self { db: Arc::new(db) }
    }

    pub async fn get_by_conn_string(&self, conn_string: &str) -> Result<Option<NodeInfo>, StorageError> {
        let db = self.db.clone();
        let conn_string = conn_string.to_string();
        tokio::task::spawn_blocking(move || db.get_by_conn_string(&conn_string))
            .await
            .map_err(blocking_err)?
    }

    pub async fn add_node(
        &self,
        ip: IpAddr,
        port: u16,
        referrer: Option<i64>,
    ) -> Result<(NodeInfo, bool), StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.add_node(ip, port, referrer))
            .await
            .map_err(blocking_err)?
    }

    pub async fn update_node(&self, node: NodeInfo) -> Result<bool, StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.update_node(&node))
            .await
            .map_err(blocking_err)?
    }

    pub async fn get_random_node(&self) -> Result<Option<NodeInfo>, StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.get_random_node())
            .await
            .map_err(blocking_err)?
    }

    pub async fn get_random_nodes(&self, probability: f64) -> Result<Vec<NodeInfo>, StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.get_random_nodes(probability))
            .await
            .map_err(blocking_err)?
    }

    pub async fn add_history(
        &self,
        node_id: i64,
        event: NodeEvent,
        timestamp: NaiveDateTime,
        data: Option<serde_json::Value>,
    ) -> Result<(), StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.add_history(node_id, event, timestamp, data))
            .await
            .map_err(blocking_err)?
    }
}

/// Async facade over a [`LivenessStore`].
pub struct LivenessDatabase<T> {
    db: Arc<T>,
}

impl<T> Clone for LivenessDatabase<T> {
    fn clone(&self) -> Self {
        Self { db: self.db.clone() }
    }
}

impl<T> LivenessDatabase<T>
where T: LivenessStore + 'static
{
    pub fn new(db: T) -> Self {
        Self { db: Arc::new(db) }
    }

    pub async fn set_active(&self, conn_string: &str, ttl: Duration) -> Result<(), StorageError> {
        let db = self.db.clone();
        let conn_string = conn_string.to_string();
        tokio::task::spawn_blocking(move || db.set_active(&conn_string, ttl))
            .await
            .map_err(blocking_err)?
    }

    pub async fn remove_active(&self, conn_string: &str) -> Result<(), StorageError> {
        let db = self.db.clone();
        let conn_string = conn_string.to_string();
        tokio::task::spawn_blocking(move || db.remove_active(&conn_string))
            .await
            .map_err(blocking_err)?
    }

    pub async fn check_active(&self, conn_string: &str) -> Result<bool, StorageError> {
        let db = self.db.clone();
        let conn_string = conn_string.to_string();
        tokio::task::spawn_blocking(move || db.check_active(&conn_string))
            .await
            .map_err(blocking_err)?
    }

    pub async fn acquire_lock(&self, resource: &str, ttl: Duration, extend: bool) -> Result<bool, StorageError> {
        let db = self.db.clone();
        let resource = resource.to_string();
        tokio::task::spawn_blocking(move || db.acquire_lock(&resource, ttl, extend))
            .await
            .map_err(blocking_err)?
    }

    pub async fn release_lock(&self, resource: &str) -> Result<(), StorageError> {
        let db = self.db.clone();
        let resource = resource.to_string();
        tokio::task::spawn_blocking(move || db.release_lock(&resource))
            .await
            .map_err(blocking_err)?
    }

    pub async fn incr(&self, counter: &str) -> Result<i64, StorageError> {
        let db = self.db.clone();
        let counter = counter.to_string();
        tokio::task::spawn_blocking(move || db.incr(&counter))
            .await
            .map_err(blocking_err)?
    }

    pub async fn full_keys(&self, pattern: &str) -> Result<Vec<String>, StorageError> {
        let db = self.db.clone();
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || db.full_keys(&pattern))
            .await
            .map_err(blocking_err)?
    }

    pub async fn flush_all(&self) -> Result<(), StorageError> {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.flush_all())
            .await
            .map_err(blocking_err)?
    }
}
