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

use std::sync::Arc;

use globalwitness_crawler::{
    api,
    config::CrawlerConfig,
    coordinator::{Coordinator, CoordinatorConfig},
    peer::PeerConfig,
    session::SessionConfig,
    storage::{LivenessDatabase, NodeDatabase, PostgresNodeStore, RedisLivenessStore},
};
use log::*;
use rand::{rngs::OsRng, RngCore};

const LOG_TARGET: &str = "globalwitness::main";

fn generate_instance_name() -> String {
    format!("crawler-{:08x}", OsRng.next_u32())
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    env_logger::init();

    let instance_name = generate_instance_name();
    info!(target: LOG_TARGET, "#################################");
    info!(target: LOG_TARGET, "#  GlobalWitness Discovery");
    info!(target: LOG_TARGET, "#  ( instance: {} )", instance_name);
    info!(target: LOG_TARGET, "#################################");

    let config = CrawlerConfig::from_env()?;

    let node_store = PostgresNodeStore::connect(
        &config.database.url(),
        config.database.max_open,
        config.database.max_idle,
    )?;
    info!(target: LOG_TARGET, "Database connection established");

    let liveness_store = RedisLivenessStore::connect(
        &config.key_value.connection_url(),
        config.key_value.max_open,
        config.key_value.max_idle,
    )?;
    info!(target: LOG_TARGET, "Key-value store connection established");

    let coordinator = Arc::new(Coordinator::new(
        instance_name,
        CoordinatorConfig {
            max_peers: config.max_peers,
            ..Default::default()
        },
        NodeDatabase::new(node_store),
        LivenessDatabase::new(liveness_store),
        PeerConfig::default(),
        SessionConfig::default(),
    ));

    // The endpoint owns its own listener task; a bind failure is fatal at startup.
    let (_addr, _api_task) = api::spawn(config.api.clone(), coordinator.clone())?;

    let _ = coordinator.run().await;
    Ok(())
}
