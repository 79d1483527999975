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

//! Read-only status endpoint plus the administrative flush. A thin wrapper over the coordinator
//! snapshot and the liveness store; it never touches the node graph.

use std::{
    convert::Infallible,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::Arc,
};

use hyper::{
    header,
    service::{make_service_fn, service_fn},
    Body,
    Method,
    Request,
    Response,
    Server,
    StatusCode,
};
use log::*;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::{
    coordinator::{Coordinator, Snapshot},
    storage::{LivenessStore, NodeStore, ACTIVE_TAG_PREFIX},
};

const LOG_TARGET: &str = "crawler::api";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub port: u16,
    pub bind_address: IpAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Failed to bind the status endpoint to {addr}: {source}")]
    Bind { addr: SocketAddr, source: hyper::Error },
}

#[derive(Serialize)]
struct PeersResponse {
    #[serde(rename = "Info")]
    info: Snapshot,
    #[serde(rename = "Peers")]
    peers: Vec<String>,
}

/// Binds the listener and serves the endpoint on a spawned task. Returns the bound address so
/// callers configured with port 0 can discover it.
pub fn spawn<TNode, TLive>(
    config: ApiConfig,
    coordinator: Arc<Coordinator<TNode, TLive>>,
) -> Result<(SocketAddr, JoinHandle<Result<(), hyper::Error>>), ApiError>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    let addr = SocketAddr::new(config.bind_address, config.port);
    let make_svc = make_service_fn(move |_conn| {
        let coordinator = coordinator.clone();
        async move { Ok::<_, Infallible>(service_fn(move |req| handle(req, coordinator.clone()))) }
    });

    let server = Server::try_bind(&addr)
        .map_err(|source| ApiError::Bind { addr, source })?
        .serve(make_svc);
    let local_addr = server.local_addr();
    info!(target: LOG_TARGET, "Status endpoint listening on {}", local_addr);
    Ok((local_addr, tokio::spawn(server)))
}

async fn handle<TNode, TLive>(
    req: Request<Body>,
    coordinator: Arc<Coordinator<TNode, TLive>>,
) -> Result<Response<Body>, Infallible>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/globalwitness/status") => status_response(&coordinator),
        (&Method::GET, "/globalwitness/peers") => peers_response(&coordinator).await,
        (&Method::GET, "/globalwitness/flush") => flush_response(&coordinator).await,
        _ => error_response(StatusCode::NOT_FOUND, "not found"),
    };
    Ok(response)
}

fn status_response<TNode, TLive>(coordinator: &Coordinator<TNode, TLive>) -> Response<Body>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    match serde_json::to_vec(&coordinator.summary()) {
        Ok(body) => json_response(StatusCode::OK, body),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn peers_response<TNode, TLive>(coordinator: &Coordinator<TNode, TLive>) -> Response<Body>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    let pattern = format!("{}*", ACTIVE_TAG_PREFIX);
    match coordinator.liveness().full_keys(&pattern).await {
        Ok(keys) => {
            let peers = keys
                .iter()
                .map(|key| key.strip_prefix(ACTIVE_TAG_PREFIX).unwrap_or(key).to_string())
                .collect();
            let response = PeersResponse {
                info: coordinator.summary(),
                peers,
            };
            match serde_json::to_vec(&response) {
                Ok(body) => json_response(StatusCode::OK, body),
                Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
            }
        },
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

async fn flush_response<TNode, TLive>(coordinator: &Coordinator<TNode, TLive>) -> Response<Body>
where
    TNode: NodeStore + 'static,
    TLive: LivenessStore + 'static,
{
    match coordinator.liveness().flush_all().await {
        Ok(()) => json_response(StatusCode::OK, br#"{"result":"success"}"#.to_vec()),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, &err.to_string()),
    }
}

fn json_response(status: StatusCode, body: Vec<u8>) -> Response<Body> {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .expect("response construction with static parts cannot fail")
}

fn error_response(status: StatusCode, message: &str) -> Response<Body> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": message })).unwrap_or_default();
    json_response(status, body)
}
