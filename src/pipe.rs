//! Unidirectional forwarding loops between a decrypted client-facing cipher
//! half and a raw destination stream half, with a [`TrafficHook`] consulted
//! once per read on the plaintext that crosses the boundary.

use std::net::IpAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::cipher::{CipherError, CipherReadHalf, CipherWriteHalf};
use crate::hook::TrafficHook;
use crate::packet::{Direction, PacketContext, Protocol};

/// Plaintext read/write buffer size for one pipe iteration.
pub const PIPE_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Error, Debug)]
pub enum PipeError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("connection blocked by traffic hook")]
    BlockedByHook,
}

/// Static per-connection addressing reused to build a [`PacketContext`] on
/// every iteration without re-resolving anything.
#[derive(Debug, Clone)]
pub struct PipeEndpoints {
    pub conn_id: String,
    pub direction: Direction,
    pub src_ip: Option<IpAddr>,
    pub src_port: Option<u16>,
    pub dst_ip: Option<IpAddr>,
    pub dst_port: Option<u16>,
}

/// Client → destination: decrypt off the cipher half, run the hook, forward
/// plaintext to the raw destination writer. Used for the `Out` direction.
pub async fn forward_decrypt<S, W>(
    cipher_read: &mut CipherReadHalf<S>,
    dest_write: &mut W,
    endpoints: PipeEndpoints,
    hook: Arc<TrafficHook>,
) -> Result<u64, PipeError>
where
    S: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = cipher_read.read(&mut buf).await?;
        if n == 0 {
            dest_write.shutdown().await.ok();
            return Ok(total);
        }

        let ctx = build_context(&endpoints, &buf[..n]);
        if !hook.on_packet(&ctx).await {
            return Err(PipeError::BlockedByHook);
        }

        dest_write.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}

/// Destination → client: read raw plaintext off the destination, run the
/// hook, encrypt and forward through the cipher half. Used for the `In`
/// direction.
pub async fn forward_encrypt<R, S>(
    dest_read: &mut R,
    cipher_write: &mut CipherWriteHalf<S>,
    endpoints: PipeEndpoints,
    hook: Arc<TrafficHook>,
) -> Result<u64, PipeError>
where
    R: AsyncRead + Unpin,
    S: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = dest_read.read(&mut buf).await?;
        if n == 0 {
            cipher_write.shutdown().await.ok();
            return Ok(total);
        }

        let ctx = build_context(&endpoints, &buf[..n]);
        if !hook.on_packet(&ctx).await {
            return Err(PipeError::BlockedByHook);
        }

        cipher_write.write(&buf[..n]).await?;
        total += n as u64;
    }
}

fn build_context(endpoints: &PipeEndpoints, payload: &[u8]) -> PacketContext {
    PacketContext::new(
        endpoints.conn_id.clone(),
        endpoints.direction,
        Protocol::Tcp,
        endpoints.src_ip,
        endpoints.src_port,
        endpoints.dst_ip,
        endpoints.dst_port,
        payload,
    )
}
