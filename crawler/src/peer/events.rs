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

use async_trait::async_trait;
use bitcoin::{
    p2p::{address::Address, message_blockdata::Inventory, message_network::VersionMessage},
    Block,
    Transaction,
};

use super::PeerHandle;

/// Callbacks invoked serially, in arrival order, by the peer's read loop. The implementor is
/// borrowed for the duration of one callback; anything it wants to do to the connection goes
/// through the supplied [`PeerHandle`].
#[async_trait]
pub trait PeerEvents: Send {
    async fn on_version(&mut self, _peer: &PeerHandle, _version: &VersionMessage) {}

    async fn on_verack(&mut self, _peer: &PeerHandle) {}

    async fn on_addr(&mut self, _peer: &PeerHandle, _addresses: &[(u32, Address)]) {}

    async fn on_inv(&mut self, _peer: &PeerHandle, _inventory: &[Inventory]) {}

    async fn on_ping(&mut self, _peer: &PeerHandle, _nonce: u64) {}

    async fn on_pong(&mut self, _peer: &PeerHandle, _nonce: u64) {}

    async fn on_tx(&mut self, _peer: &PeerHandle, _tx: &Transaction) {}

    async fn on_block(&mut self, _peer: &PeerHandle, _block: &Block) {}

    async fn on_reject(&mut self, _peer: &PeerHandle, _reject: &bitcoin::p2p::message_network::Reject) {}

    async fn on_mempool(&mut self, _peer: &PeerHandle) {}

    /// Invoked for every message successfully read from the wire, before the message-specific
    /// callback.
    async fn on_read(&mut self, _peer: &PeerHandle, _bytes_read: usize) {}
}
