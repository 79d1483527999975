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

use std::{fmt, net::IpAddr};

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// Port substituted when a peer advertises port 0.
pub const DEFAULT_PEER_PORT: u16 = 8333;

/// A known network endpoint in the discovery graph. The `conn_string` is the natural key; `id` is
/// assigned by the store on first observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: i64,
    pub conn_string: String,
    /// Node that first announced this endpoint, if it was learned from gossip.
    pub referrer: Option<i64>,
    pub discovery: NaiveDateTime,
    pub last_seen: NaiveDateTime,
    pub version: Option<String>,
    pub data: Option<serde_json::Value>,
}

/// Append-only lifecycle event for a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHistoryEntry {
    pub id: i64,
    pub node_id: i64,
    pub event_type: String,
    pub timestamp: NaiveDateTime,
    pub data: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeEvent {
    SessionBegin,
    ConnectError,
    ProtocolError,
    Discovery,
    SessionEnd,
}

impl NodeEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeEvent::SessionBegin => "session_begin",
            NodeEvent::ConnectError => "connect_error",
            NodeEvent::ProtocolError => "protocol_error",
            NodeEvent::Discovery => "discovery",
            NodeEvent::SessionEnd => "session_end",
        }
    }
}

impl fmt::Display for NodeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Composes the canonical `[ip]:port` conn string. A zero port is always normalized to the
/// default protocol port before composition, so no unnormalized conn string can reach the store.
pub fn make_conn_string(ip: IpAddr, port: u16) -> String {
    let port = if port == 0 { DEFAULT_PEER_PORT } else { port };
    format!("[{}]:{}", ip, port)
}

/// Splits a canonical `[ip]:port` conn string back into its address and port.
pub fn parse_conn_string(conn_string: &str) -> Result<(IpAddr, u16), StorageError> {
    let invalid = || StorageError::InvalidConnString(conn_string.to_string());
    let rest = conn_string.strip_prefix('[').ok_or_else(invalid)?;
    let (ip, port) = rest.split_once("]:").ok_or_else(invalid)?;
    let ip = ip.parse::<IpAddr>().map_err(|_| invalid())?;
    let port = port.parse::<u16>().map_err(|_| invalid())?;
    Ok((ip, port))
}
