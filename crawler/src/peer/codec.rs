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

//! Message framing over the raw TCP stream. Serialization of the payloads themselves is the
//! protocol library's job; this module only moves whole frames in and out.

use std::io;

use bitcoin::{
    consensus::encode,
    p2p::{
        message::{NetworkMessage, RawNetworkMessage},
        Magic,
    },
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::error::PeerError;

/// magic(4) + command(12) + length(4) + checksum(4)
pub const HEADER_SIZE: usize = 24;

/// Upper bound a remote may announce for a single payload.
pub const MAX_PAYLOAD_SIZE: u32 = 32 * 1024 * 1024;

pub async fn write_message<W>(writer: &mut W, magic: Magic, msg: NetworkMessage) -> Result<usize, PeerError>
where W: AsyncWrite + Unpin
{
    let raw = RawNetworkMessage::new(magic, msg);
    let bytes = encode::serialize(&raw);
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(bytes.len())
}

/// Reads one whole message frame. Returns `None` when the remote closed the connection cleanly
/// between frames.
pub async fn read_message<R>(reader: &mut R, magic: Magic) -> Result<Option<(RawNetworkMessage, usize)>, PeerError>
where R: AsyncRead + Unpin
{
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {},
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }

    let frame_magic = Magic::from_bytes([header[0], header[1], header[2], header[3]]);
    if frame_magic != magic {
        return Err(PeerError::WrongNetwork {
            expected: magic,
            actual: frame_magic,
        });
    }

    let payload_len = u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(PeerError::OversizedMessage(payload_len));
    }

    let mut frame = vec![0u8; HEADER_SIZE + payload_len as usize];
    frame[..HEADER_SIZE].copy_from_slice(&header);
    reader.read_exact(&mut frame[HEADER_SIZE..]).await?;

    let raw = encode::deserialize::<RawNetworkMessage>(&frame)?;
    Ok(Some((raw, frame.len())))
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let magic = Magic::BITCOIN;
        write_message(&mut a, magic, NetworkMessage::Ping(42)).await.unwrap();

        let (raw, bytes) = read_message(&mut b, magic).await.unwrap().unwrap();
        assert_eq!(raw.payload(), &NetworkMessage::Ping(42));
        assert!(bytes > HEADER_SIZE);
    }

    #[tokio::test]
    async fn clean_close_returns_none() {
        let (a, mut b) = tokio::io::duplex(4096);
        drop(a);
        let res = read_message(&mut b, Magic::BITCOIN).await.unwrap();
        assert!(res.is_none());
    }

    #[tokio::test]
    async fn rejects_wrong_magic() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        write_message(&mut a, Magic::TESTNET, NetworkMessage::Ping(1)).await.unwrap();

        match read_message(&mut b, Magic::BITCOIN).await {
            Err(PeerError::WrongNetwork { expected, actual }) => {
                assert_eq!(expected, Magic::BITCOIN);
                assert_eq!(actual, Magic::TESTNET);
            },
            other => panic!("unexpected result: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_payload() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let mut header = [0u8; HEADER_SIZE];
        header[..4].copy_from_slice(&Magic::BITCOIN.to_bytes());
        header[16..20].copy_from_slice(&(MAX_PAYLOAD_SIZE + 1).to_le_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut a, &header).await.unwrap();

        assert!(matches!(
            read_message(&mut b, Magic::BITCOIN).await,
            Err(PeerError::OversizedMessage(_))
        ));
    }
}
