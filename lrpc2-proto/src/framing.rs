use crate::{Header, ProtocolError, Result};
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

/// Reads one framed message from an async reader: the fixed-size header,
/// then exactly the payload length the header announces.
///
/// Returns `Ok(None)` when the peer has closed the connection before a
/// full header arrived; that is a graceful end of input, not an error.
/// The header is verified before any payload byte is read, so an
/// oversized payload length is rejected without allocating for it.
///
/// NOTE: payload contents are never logged here or above. The payload can
/// carry sensitive information (e.g. a password).
pub async fn read_message<R>(reader: &mut R) -> Result<Option<(Header, Vec<u8>)>>
where
    R: AsyncRead + Unpin,
{
    let mut header_bytes = [0u8; Header::wire_len()];
    match reader.read_exact(&mut header_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            trace!("No more to read from LRPC2 connection");
            return Ok(None);
        }
        Err(e) => return Err(e.into()),
    }

    let header = Header::decode(&mut &header_bytes[..])?;
    header.verify()?;

    trace!(
        len = header.msg_data_len,
        seq = header.sequence_num,
        "Reading LRPC2 message data"
    );

    let mut payload = vec![0u8; header.msg_data_len as usize];
    reader.read_exact(&mut payload).await.map_err(|e| {
        debug!("Failed to read LRPC2 message data: {}", e);
        ProtocolError::Io(e)
    })?;

    Ok(Some((header, payload)))
}

/// Writes one framed message (header, then payload) to an async writer.
pub async fn write_message<W>(writer: &mut W, header: &Header, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(Header::wire_len() + payload.len());
    header.encode(&mut buf);
    buf.extend_from_slice(payload);

    trace!(
        len = payload.len(),
        seq = header.sequence_num,
        "Writing LRPC2 message"
    );

    writer.write_all(&buf).await?;
    writer.flush().await?;

    Ok(())
}
