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

//! Admission control for the crawler instance: a bounded pool of concurrent outbound sessions
//! fed from the discovery graph, with cluster-wide contention avoidance through the shared
//! liveness tags.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicI64, AtomicU8, Ordering},
        Arc,
    },
    time::Duration,
};

use log::*;
use serde::{Deserialize, Serialize};
use tokio::time;

use crate::{
    peer::PeerConfig,
    session::{SessionConfig, SessionHandler},
    storage::{LivenessDatabase, LivenessStore, NodeDatabase, NodeStore},
};

pub mod counters;

pub use counters::{CrawlCounters, RateCounter};

const LOG_TARGET: &str = "crawler::coordinator";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorStatus {
    Stopped,
    Paused,
    Running,
}

impl CoordinatorStatus {
    fn as_u8(self) -> u8 {
        match self {
            CoordinatorStatus::Stopped => 0,
            CoordinatorStatus::Paused => 1,
            CoordinatorStatus::Running => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => CoordinatorStatus::Paused,
            2 => CoordinatorStatus::Running,
            _ => CoordinatorStatus::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            CoordinatorStatus::Stopped => "stopped",
            CoordinatorStatus::Paused => "paused",
            CoordinatorStatus::Running => "running",
        }
    }
}

/// State shared between the coordinator and every session it spawns. The coordinator owns the
/// counters; sessions borrow them through this context.
pub struct CrawlContext<TNode, TLive> {
    pub node_db: NodeDatabase<TNode>,
    pub liveness: LivenessDatabase<TLive>,
    pub counters: CrawlCounters,
    pub peer_count: AtomicI64,
    pub peer_config: PeerConfig,
    pub session_config: SessionConfig,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub max_peers: i64,
    /// Bernoulli sampling probability used to refill the candidate buffer.
    pub sample_probability: f64,
    /// Backoff while the session pool is saturated.
    pub saturated_delay: Duration,
    /// Backoff after the candidate refill came back empty.
    pub empty_refill_delay: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            max_peers: 16,
            sample_probability: 0.1,
            saturated_delay: Duration::from_secs(15),
            empty_refill_delay: Duration::from_secs(1),
        }
    }
}

/// Point-in-time view of the coordinator, serialized with the wire-compatible field names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Snapshot {
    pub name: String,
    pub status: String,
    pub peer_count: i64,
    pub max_peers: i64,
    pub attempt_counter: i64,
    pub fail_counter: i64,
    pub voluntary_disconnect_counter: i64,
    pub success_counter: i64,
    pub skipped_due_to_in_network_counter: i64,
}

pub struct Coordinator<TNode, TLive> {
    name: String,
    config: CoordinatorConfig,
    status: AtomicU8,
    context: Arc<CrawlContext<TNode, TLive>>,
}

impl<TNode, TLive> Coordinator<TNode, TLive>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    pub fn new(
        name: String,
        config: CoordinatorConfig,
        node_db: NodeDatabase<TNode>,
        liveness: LivenessDatabase<TLive>,
        peer_config: PeerConfig,
        session_config: SessionConfig,
    ) -> Self {
        Self {
            name,
            config,
            status: AtomicU8::new(CoordinatorStatus::Stopped.as_u8()),
            context: Arc::new(CrawlContext {
                node_db,
                liveness,
                counters: CrawlCounters::new(),
                peer_count: AtomicI64::new(0),
                peer_config,
                session_config,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> CoordinatorStatus {
        CoordinatorStatus::from_u8(self.status.load(Ordering::SeqCst))
    }

    pub fn liveness(&self) -> &LivenessDatabase<TLive> {
        &self.context.liveness
    }

    pub fn counters(&self) -> &CrawlCounters {
        &self.context.counters
    }

    pub fn peer_count(&self) -> i64 {
        self.context.peer_count.load(Ordering::SeqCst)
    }

    /// Starts the control loop and blocks until the status leaves `Running`. Returns whether the
    /// call changed the status; a coordinator that is already running (or paused) is left alone.
    pub async fn run(&self) -> bool {
        if self
            .status
            .compare_exchange(
                CoordinatorStatus::Stopped.as_u8(),
                CoordinatorStatus::Running.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return false;
        }

        info!(target: LOG_TARGET, "Coordinator '{}' started", self.name);
        let mut candidates: VecDeque<_> = VecDeque::new();

        while self.status() == CoordinatorStatus::Running {
            if self.context.peer_count.load(Ordering::SeqCst) >= self.config.max_peers {
                time::sleep(self.config.saturated_delay).await;
                continue;
            }

            if candidates.is_empty() {
                match self.context.node_db.get_random_nodes(self.config.sample_probability).await {
                    Ok(nodes) => candidates.extend(nodes),
                    Err(err) => {
                        warn!(target: LOG_TARGET, "Candidate refill failed: {}", err);
                    },
                }
                if candidates.is_empty() {
                    time::sleep(self.config.empty_refill_delay).await;
                    continue;
                }
            }

            let Some(node) = candidates.pop_front() else {
                continue;
            };

            match self.context.liveness.check_active(&node.conn_string).await {
                Ok(true) => {
                    // Another crawler instance already owns this peer.
                    self.context.counters.skipped_in_network.incr();
                    continue;
                },
                Ok(false) => {},
                Err(err) => {
                    warn!(
                        target: LOG_TARGET,
                        "Active check failed for {}, assuming inactive: {}", node.conn_string, err
                    );
                },
            }

            let handler = SessionHandler::new(node, self.context.clone());
            tokio::spawn(handler.run());
        }

        info!(target: LOG_TARGET, "Coordinator '{}' control loop exited", self.name);
        true
    }

    /// Returns whether the status changed. In-flight sessions are unaffected.
    pub fn pause(&self) -> bool {
        let previous = self.status.swap(CoordinatorStatus::Paused.as_u8(), Ordering::SeqCst);
        previous != CoordinatorStatus::Paused.as_u8()
    }

    /// Returns whether the status changed. The control loop exits at its next iteration;
    /// in-flight sessions run until their connection ends naturally.
    pub fn stop(&self) -> bool {
        let previous = self.status.swap(CoordinatorStatus::Stopped.as_u8(), Ordering::SeqCst);
        previous != CoordinatorStatus::Stopped.as_u8()
    }

    pub fn summary(&self) -> Snapshot {
        let counters = &self.context.counters;
        Snapshot {
            name: self.name.clone(),
            status: self.status().as_str().to_string(),
            peer_count: self.context.peer_count.load(Ordering::SeqCst),
            max_peers: self.config.max_peers,
            attempt_counter: counters.attempts.rate(),
            fail_counter: counters.failures.rate(),
            voluntary_disconnect_counter: counters.voluntary_disconnects.rate(),
            success_counter: counters.successes.rate(),
            skipped_due_to_in_network_counter: counters.skipped_in_network.rate(),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_utils::{MemoryLivenessStore, MemoryNodeStore};

    fn test_coordinator() -> Coordinator<MemoryNodeStore, MemoryLivenessStore> {
        Coordinator::new(
            "test-coordinator".to_string(),
            CoordinatorConfig::default(),
            NodeDatabase::new(MemoryNodeStore::new()),
            LivenessDatabase::new(MemoryLivenessStore::new()),
            PeerConfig::default(),
            SessionConfig::default(),
        )
    }

    #[test]
    fn initial_status_is_stopped() {
        let coordinator = test_coordinator();
        assert_eq!(coordinator.status(), CoordinatorStatus::Stopped);
    }

    #[test]
    fn pause_and_stop_report_changes() {
        let coordinator = test_coordinator();
        assert!(coordinator.pause());
        assert_eq!(coordinator.status(), CoordinatorStatus::Paused);
        assert!(!coordinator.pause());
        assert!(coordinator.stop());
        assert_eq!(coordinator.status(), CoordinatorStatus::Stopped);
        assert!(!coordinator.stop());
    }

    #[test]
    fn snapshot_uses_wire_field_names() {
        let coordinator = test_coordinator();
        let json = serde_json::to_value(coordinator.summary()).unwrap();
        for key in [
            "Name",
            "Status",
            "PeerCount",
            "MaxPeers",
            "AttemptCounter",
            "FailCounter",
            "VoluntaryDisconnectCounter",
            "SuccessCounter",
            "SkippedDueToInNetworkCounter",
        ] {
            assert!(json.get(key).is_some(), "missing snapshot field {}", key);
        }
        assert_eq!(json["Status"], "stopped");
        assert_eq!(json["MaxPeers"], 16);
    }

    #[tokio::test]
    async fn run_while_running_returns_false() {
        let coordinator = std::sync::Arc::new(test_coordinator());
        let runner = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.run().await })
        };

        // Wait for the control loop to actually claim Running.
        while coordinator.status() != CoordinatorStatus::Running {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!coordinator.run().await);

        coordinator.stop();
        assert!(runner.await.unwrap());
    }
}
