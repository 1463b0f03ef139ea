use std::path::{Path, PathBuf};

use bytes::{Buf, BufMut, BytesMut};
use lrpc2_proto::{
    decode_payload, encode_payload, framing, Header, ProtocolError, Result, Value,
    LRPC2_HANDSHAKE_REPLY_V4_SIZE, LRPC2_HANDSHAKE_REQUEST_SIZE, LRPC2_NACK, LRPC2_VERSION_4,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info, trace};

use crate::config::Timeouts;

/// One LRPC2 client session: a single connection to the agent endpoint.
///
/// At most one request may be outstanding at a time. A session is not
/// synchronized internally; callers that need concurrency create one
/// session per task.
pub struct ClientSession {
    endpoint: PathBuf,
    conn: Option<UnixStream>,
    timeouts: Timeouts,
    /// Sequence number for the next request.
    seq: u32,
    /// Sequence number used by the most recent send; the reply must echo
    /// this exact value.
    last_sent_seq: u32,
    pid: u64,
    /// Maximum message data size advertised by the server at handshake.
    max_msg_data_len: u32,
}

impl ClientSession {
    pub fn new(endpoint: impl AsRef<Path>, timeouts: Timeouts) -> Self {
        Self {
            endpoint: endpoint.as_ref().to_path_buf(),
            conn: None,
            timeouts,
            seq: 0,
            last_sent_seq: 0,
            pid: 0,
            max_msg_data_len: 0,
        }
    }

    /// Opens the connection and performs the version handshake. On any
    /// handshake failure the transport connection is closed and the
    /// session stays unconnected.
    pub async fn connect(&mut self) -> Result<()> {
        trace!("LRPC2 client: Connecting to {}", self.endpoint.display());

        let mut stream = timeout(self.timeouts.connect, UnixStream::connect(&self.endpoint))
            .await
            .map_err(|_| timeout_error("connect"))??;

        match timeout(self.timeouts.connect, do_handshake(&mut stream)).await {
            Ok(Ok(max_msg_data_len)) => {
                self.max_msg_data_len = max_msg_data_len;
                self.seq = rand::random();
                self.pid = u64::from(std::process::id());
                self.conn = Some(stream);
                trace!(
                    max_msg_data_len,
                    seq = self.seq,
                    pid = self.pid,
                    "LRPC2 client handshake completed"
                );
                Ok(())
            }
            Ok(Err(e)) => {
                debug!("LRPC2 client: handshake failed: {}", e);
                Err(e)
            }
            Err(_) => Err(timeout_error("handshake")),
        }
    }

    /// Sends one framed request. The command must fit into an unsigned
    /// 16-bit value and the encoded payload must not exceed the server's
    /// advertised maximum; both are checked before any byte is sent.
    pub async fn write_request(&mut self, cmd: u32, args: &[Value]) -> Result<()> {
        let seq = self.seq;
        self.last_sent_seq = seq;
        // The sequence number advances for the next request regardless of
        // this send's outcome.
        self.seq = seq.wrapping_add(1);

        let conn = self.conn.as_mut().ok_or(ProtocolError::NotConnected)?;

        let msg_id = u16::try_from(cmd).map_err(|_| {
            debug!("LRPC2 client: command {} does not fit into u16", cmd);
            ProtocolError::CommandOutOfRange(cmd)
        })?;

        let payload = encode_payload(msg_id, args);
        if payload.len() > self.max_msg_data_len as usize {
            return Err(ProtocolError::MsgTooLong(
                payload.len().min(u32::MAX as usize) as u32,
                self.max_msg_data_len,
            ));
        }

        let header = Header::new(self.pid, seq, payload.len() as u32);
        trace!(seq, msg_id, "LRPC2 client: sending request");

        timeout(
            self.timeouts.send,
            framing::write_message(conn, &header, &payload),
        )
        .await
        .map_err(|_| timeout_error("send"))?
    }

    /// Reads the reply for the request just sent. The reply header is
    /// verified and its echoed sequence number must equal the one used by
    /// the immediately preceding `write_request`.
    pub async fn read_response(&mut self) -> Result<Vec<Value>> {
        let sent = self.last_sent_seq;
        let conn = self.conn.as_mut().ok_or(ProtocolError::NotConnected)?;

        let frame = timeout(self.timeouts.receive, framing::read_message(conn))
            .await
            .map_err(|_| timeout_error("receive"))??;

        let (header, payload) = frame.ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed by server",
            ))
        })?;

        if header.sequence_num != sent {
            debug!(
                "LRPC2 client: expect response sequence number {}, got {}",
                sent, header.sequence_num
            );
            return Err(ProtocolError::SeqNumMismatch {
                sent,
                got: header.sequence_num,
            });
        }

        let (_, results) = decode_payload(&payload)?;
        trace!("LRPC2 client: response carries {} values", results.len());
        Ok(results)
    }

    /// Sends a request and waits for its reply.
    pub async fn do_request(&mut self, cmd: u32, args: &[Value]) -> Result<Vec<Value>> {
        self.write_request(cmd, args).await?;
        self.read_response().await
    }

    /// Sends a request for which the server writes no reply.
    pub async fn do_async_request(&mut self, cmd: u32, args: &[Value]) -> Result<()> {
        self.write_request(cmd, args).await
    }

    /// Closes the transport connection. Single-close discipline is the
    /// caller's responsibility.
    pub async fn close(&mut self) -> Result<()> {
        let mut conn = self.conn.take().ok_or(ProtocolError::NotConnected)?;
        conn.shutdown().await?;
        info!("LRPC2 client: connection to {} closed", self.endpoint.display());
        Ok(())
    }
}

async fn do_handshake(stream: &mut UnixStream) -> Result<u32> {
    let mut req = BytesMut::with_capacity(LRPC2_HANDSHAKE_REQUEST_SIZE);
    req.put_u32_le(LRPC2_VERSION_4);
    stream.write_all(&req).await?;

    trace!("LRPC2 client: Sent handshake request, waiting for reply");

    let mut reply = [0u8; LRPC2_HANDSHAKE_REPLY_V4_SIZE];
    stream.read_exact(&mut reply).await?;

    let mut buf = &reply[..];
    let answer = buf.get_u32_le();
    if answer == LRPC2_NACK {
        return Err(ProtocolError::HandshakeRejected);
    }

    Ok(buf.get_u32_le())
}

fn timeout_error(phase: &str) -> ProtocolError {
    ProtocolError::Io(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{phase} timeout"),
    ))
}
