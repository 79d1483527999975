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

//! End-to-end crawl scenarios over the in-memory stores and a scripted remote peer.

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use globalwitness_crawler::{
    api,
    api::ApiConfig,
    coordinator::{Coordinator, CoordinatorConfig},
    peer::PeerConfig,
    session::SessionConfig,
    storage::{LivenessDatabase, LivenessStore, NodeDatabase, NodeEvent, NodeStore},
    test_utils::{MemoryLivenessStore, MemoryNodeStore, RemotePeer},
};
use tokio::net::TcpListener;

fn fast_coordinator_config() -> CoordinatorConfig {
    CoordinatorConfig {
        max_peers: 1,
        sample_probability: 1.0,
        saturated_delay: Duration::from_millis(100),
        empty_refill_delay: Duration::from_millis(25),
    }
}

fn build_coordinator(
    name: &str,
    nodes: MemoryNodeStore,
    liveness: MemoryLivenessStore,
    peer_config: PeerConfig,
    session_config: SessionConfig,
) -> Arc<Coordinator<MemoryNodeStore, MemoryLivenessStore>> {
    Arc::new(Coordinator::new(
        name.to_string(),
        fast_coordinator_config(),
        NodeDatabase::new(nodes),
        LivenessDatabase::new(liveness),
        peer_config,
        session_config,
    ))
}

async fn wait_until<F>(what: &str, deadline: Duration, predicate: F)
where F: Fn() -> bool {
    let start = Instant::now();
    while !predicate() {
        if start.elapsed() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// An address on the loopback interface with nothing listening behind it.
async fn unreachable_addr() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[tokio::test]
async fn fresh_start_records_a_connect_error() {
    let nodes = MemoryNodeStore::new();
    let liveness = MemoryLivenessStore::new();
    let addr = unreachable_addr().await;
    nodes.add_node(addr.ip(), addr.port(), None).unwrap();

    let coordinator = build_coordinator(
        "fresh-start",
        nodes.clone(),
        liveness,
        PeerConfig::default(),
        SessionConfig::default(),
    );
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    wait_until("the dial failure to be recorded", Duration::from_secs(10), || {
        !nodes.history_for_event(NodeEvent::ConnectError).is_empty()
    })
    .await;

    coordinator.stop();
    assert!(runner.await.unwrap());

    // The unreachable seed is the only node; nothing was discovered.
    assert_eq!(nodes.node_count(), 1);
    assert!(coordinator.summary().fail_counter >= 1);
    assert_eq!(coordinator.peer_count(), 0);
}

#[tokio::test]
async fn discovery_attributes_new_nodes_to_the_referrer() {
    let announce = vec![
        "192.0.2.10:8333".parse().unwrap(),
        "192.0.2.11:8333".parse().unwrap(),
        "192.0.2.12:8333".parse().unwrap(),
    ];
    let remote = RemotePeer::spawn("/Satoshi:0.18.0/", announce).await;

    let nodes = MemoryNodeStore::new();
    let liveness = MemoryLivenessStore::new();
    let (seed, _) = nodes.add_node(remote.addr.ip(), remote.addr.port(), None).unwrap();

    let coordinator = build_coordinator(
        "discovery",
        nodes.clone(),
        liveness.clone(),
        PeerConfig::default(),
        SessionConfig::default(),
    );
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    wait_until("the advertised nodes to land in storage", Duration::from_secs(10), || {
        nodes.node_count() == 4
    })
    .await;

    // The remote delivers the same batch again in response to getaddr; nothing new may appear.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(nodes.node_count(), 4);

    for node in nodes.nodes() {
        if node.id != seed.id {
            assert_eq!(node.referrer, Some(seed.id));
        }
    }

    let begins = nodes.history_for_event(NodeEvent::SessionBegin);
    assert_eq!(begins.len(), 1);
    assert_eq!(begins[0].node_id, seed.id);
    assert_eq!(
        begins[0].data.as_ref().unwrap()["current_peer_version"],
        "/Satoshi:0.18.0/"
    );

    // The handshake flushed version and last_seen back to the node row.
    let stored = nodes.get_by_conn_string(&seed.conn_string).unwrap().unwrap();
    assert_eq!(stored.version.as_deref(), Some("/Satoshi:0.18.0/"));
    assert!(stored.discovery <= stored.last_seen);

    // The live session tagged its peer for the rest of the cluster.
    assert!(liveness.check_active(&seed.conn_string).unwrap());
    assert!(coordinator.peer_count() >= 1);

    coordinator.stop();
    assert!(runner.await.unwrap());
}

#[tokio::test]
async fn sibling_instances_skip_each_others_peers() {
    let nodes = MemoryNodeStore::new();
    // The shared key-value store: instance A has already claimed the seed peer.
    let liveness = MemoryLivenessStore::new();
    let addr = unreachable_addr().await;
    let (seed, _) = nodes.add_node(addr.ip(), addr.port(), None).unwrap();
    liveness.set_active(&seed.conn_string, Duration::from_secs(120)).unwrap();

    let coordinator = build_coordinator(
        "instance-b",
        nodes.clone(),
        liveness,
        PeerConfig::default(),
        SessionConfig::default(),
    );
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    wait_until("the candidate to be skipped", Duration::from_secs(10), || {
        coordinator.summary().skipped_due_to_in_network_counter > 0
    })
    .await;

    coordinator.stop();
    assert!(runner.await.unwrap());

    // No session was ever opened from this instance.
    assert_eq!(coordinator.summary().attempt_counter, 0);
    assert!(nodes.history().is_empty());
}

#[tokio::test]
async fn dwell_threshold_rotates_the_session_out() {
    let remote = RemotePeer::spawn("/Satoshi:0.18.0/", vec!["192.0.2.44:8333".parse().unwrap()]).await;

    let nodes = MemoryNodeStore::new();
    let liveness = MemoryLivenessStore::new();
    nodes.add_node(remote.addr.ip(), remote.addr.port(), None).unwrap();

    // Every session is immediately over its dwell budget, and gossip trickles fast enough for a
    // test to observe the disconnect.
    let peer_config = PeerConfig {
        trickle_interval: Duration::from_millis(50),
        ..Default::default()
    };
    let session_config = SessionConfig {
        dwell_threshold: Duration::ZERO,
        ..Default::default()
    };

    let coordinator = build_coordinator("dwell", nodes.clone(), liveness, peer_config, session_config);
    let runner = {
        let coordinator = coordinator.clone();
        tokio::spawn(async move { coordinator.run().await })
    };

    wait_until("the session to be rotated out", Duration::from_secs(10), || {
        coordinator.summary().voluntary_disconnect_counter >= 1
    })
    .await;
    wait_until("the peer count to return to zero", Duration::from_secs(10), || {
        coordinator.peer_count() == 0
    })
    .await;

    coordinator.stop();
    assert!(runner.await.unwrap());
    remote.finished().await;

    assert!(!nodes.history_for_event(NodeEvent::SessionEnd).is_empty());
}

#[tokio::test]
async fn status_endpoint_round_trip() {
    let nodes = MemoryNodeStore::new();
    let liveness = MemoryLivenessStore::new();
    liveness.set_active("[192.0.2.1]:8333", Duration::from_secs(120)).unwrap();
    liveness.set_active("[2001:db8::1]:8333", Duration::from_secs(120)).unwrap();

    let coordinator = build_coordinator(
        "endpoint",
        nodes,
        liveness.clone(),
        PeerConfig::default(),
        SessionConfig::default(),
    );
    let api_config = ApiConfig {
        port: 0,
        bind_address: "127.0.0.1".parse().unwrap(),
    };
    let (addr, _server) = api::spawn(api_config, coordinator).unwrap();
    let client = hyper::Client::new();

    let uri: hyper::Uri = format!("http://{}/globalwitness/status", addr).parse().unwrap();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let status: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(status["Name"], "endpoint");
    assert_eq!(status["Status"], "stopped");
    assert_eq!(status["PeerCount"], 0);

    let uri: hyper::Uri = format!("http://{}/globalwitness/peers", addr).parse().unwrap();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), 200);
    let body = hyper::body::to_bytes(response.into_body()).await.unwrap();
    let peers: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let mut listed: Vec<String> = peers["Peers"]
        .as_array()
        .unwrap()
        .iter()
        .map(|value| value.as_str().unwrap().to_string())
        .collect();
    listed.sort();
    assert_eq!(listed, vec![
        "[192.0.2.1]:8333".to_string(),
        "[2001:db8::1]:8333".to_string(),
    ]);

    let uri: hyper::Uri = format!("http://{}/globalwitness/flush", addr).parse().unwrap();
    let response = client.get(uri).await.unwrap();
    assert_eq!(response.status(), 200);
    assert!(liveness.full_keys("active_*").unwrap().is_empty());
}
