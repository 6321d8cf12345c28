//! Stream RPC: write one encoded request, read one encoded response. One exchange per stream.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use crate::api::{AddrInfo, ProviderHost};
use crate::wire::{self, DecodeError, EncodeError, ItemScanner, Record, MAX_MESSAGE_LEN};

const READ_CHUNK: usize = 4096;

/// Write the request's encoding and flush.
pub async fn write_request<W, Req>(w: &mut W, req: &Req) -> Result<(), RpcError>
where
    W: AsyncWrite + Unpin,
    Req: Record,
{
    let bytes = wire::encode(req)?;
    w.write_all(&bytes).await.map_err(RpcError::Write)?;
    w.flush().await.map_err(RpcError::Write)?;
    Ok(())
}

/// Read until the first CBOR item is complete, then decode it once. Bytes past the response are
/// ignored.
pub async fn read_response<R, Resp>(r: &mut R) -> Result<Resp, RpcError>
where
    R: AsyncRead + Unpin,
    Resp: Record,
{
    let mut buf = Vec::new();
    let mut chunk = [0u8; READ_CHUNK];
    let mut scanner = ItemScanner::default();
    loop {
        if !buf.is_empty() {
            if let Some(len) = scanner.complete_len(&buf).map_err(RpcError::Decode)? {
                let (resp, _) = wire::decode::<Resp>(&buf[..len]).map_err(RpcError::Decode)?;
                return Ok(resp);
            }
        }
        if buf.len() >= MAX_MESSAGE_LEN {
            return Err(RpcError::TooLarge);
        }
        let n = r.read(&mut chunk).await.map_err(RpcError::Read)?;
        if n == 0 {
            return Err(RpcError::Truncated(buf.len()));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// One request/response exchange over an open stream.
pub async fn exchange<S, Req, Resp>(stream: &mut S, req: &Req) -> Result<Resp, RpcError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    Req: Record,
    Resp: Record,
{
    write_request(stream, req).await?;
    read_response(stream).await
}

/// Open a stream for `protocol`, run one exchange within `timeout`, and close the stream on every
/// path. Dropping the returned future also drops (and so closes) the stream.
pub async fn call<H, Req, Resp>(
    host: &H,
    peer: &AddrInfo,
    protocol: &str,
    req: &Req,
    timeout: Duration,
) -> Result<Resp, RpcError>
where
    H: ProviderHost + ?Sized,
    Req: Record + Sync,
    Resp: Record,
{
    let attempt = async {
        let mut stream = host
            .open_stream(peer, protocol)
            .await
            .map_err(RpcError::Open)?;
        let result = exchange(&mut stream, req).await;
        if let Err(e) = stream.shutdown().await {
            debug!(protocol, error = %e, "stream shutdown failed");
        }
        result
    };
    tokio::time::timeout(timeout, attempt)
        .await
        .map_err(|_| RpcError::TimedOut(timeout))?
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("failed to open stream: {0:#}")]
    Open(anyhow::Error),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("write error: {0}")]
    Write(std::io::Error),
    #[error("read error: {0}")]
    Read(std::io::Error),
    #[error("decode error: {0}")]
    Decode(DecodeError),
    #[error("stream closed after {0} bytes of a partial response")]
    Truncated(usize),
    #[error("response exceeds the 16 MiB message limit")]
    TooLarge,
    #[error("exchange timed out after {0:?}")]
    TimedOut(Duration),
}

impl RpcError {
    /// True when no stream could be opened, as opposed to a failed exchange.
    pub fn is_open(&self) -> bool {
        matches!(self, RpcError::Open(_))
    }
}
