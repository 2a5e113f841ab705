//! Data forwarding module
//!
//! This module copies bytes in both directions between two streams.

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use crate::common::Result;
use crate::config::defaults::BUFFER_SIZE;

/// Forward data between two streams
///
/// Returns once either direction reaches end of stream or fails. Both
/// directions run inside the calling task, so dropping the returned future
/// tears the connection down.
///
/// # Parameters
///
/// * `client` - Stream of the connecting peer
/// * `target` - Stream of the destination
pub async fn proxy_data<C, T>(client: C, target: T) -> Result<()>
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    T: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_reader, mut client_writer) = tokio::io::split(client);
    let (mut target_reader, mut target_writer) = tokio::io::split(target);

    tokio::select! {
        total = copy_half(&mut client_reader, &mut target_writer) => {
            debug!("Client to target closed after {} bytes", total);
        }
        total = copy_half(&mut target_reader, &mut client_writer) => {
            debug!("Target to client closed after {} bytes", total);
        }
    }

    // Best effort: the peer may already be gone.
    let _ = client_writer.shutdown().await;
    let _ = target_writer.shutdown().await;
    Ok(())
}

async fn copy_half<R, W>(reader: &mut ReadHalf<R>, writer: &mut WriteHalf<W>) -> usize
where
    R: AsyncRead,
    W: AsyncWrite,
{
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total_bytes = 0;

    loop {
        match reader.read(&mut buffer).await {
            Ok(0) => break,
            Ok(n) => {
                total_bytes += n;
                if writer.write_all(&buffer[..n]).await.is_err() {
                    break;
                }
                if writer.flush().await.is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }

    total_bytes
}
