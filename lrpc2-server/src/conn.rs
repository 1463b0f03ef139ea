use std::mem;

use bytes::{BufMut, BytesMut};
use lrpc2_proto::{
    decode_payload, encode_payload, framing, Header, ProtocolError, Result, Value, LRPC2_ACK,
    LRPC2_HANDSHAKE_REQUEST_SIZE, LRPC2_MAX_MSG_LEN, LRPC2_NACK, LRPC2_VERSION_4,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::sync::oneshot;
use tokio::time::timeout;
use tokio_util::task::TaskTracker;
use tracing::{debug, trace};

use crate::config::Timeouts;

enum ConnState {
    /// Handshake running in its own task; the receiver yields the stream
    /// once the peer has been accepted.
    Handshaking(oneshot::Receiver<Result<UnixStream>>),
    Ready(UnixStream),
    Failed(String),
}

/// One accepted LRPC2 connection.
///
/// The version handshake starts immediately in a background task so a
/// slow or silent peer cannot stall the caller; the first request read
/// waits for its outcome. After a failed handshake every operation
/// replays the failure.
pub struct ServerConnection {
    state: ConnState,
    timeouts: Timeouts,
}

impl ServerConnection {
    /// The handshake task runs on the server's tracker so a shutdown
    /// wait also drains handshakes still in flight.
    pub fn new(mut stream: UnixStream, timeouts: Timeouts, tracker: &TaskTracker) -> Self {
        let (tx, rx) = oneshot::channel();
        let handshake_timeout = timeouts.handshake;

        tracker.spawn(async move {
            let result = match timeout(handshake_timeout, do_handshake(&mut stream)).await {
                Ok(Ok(())) => Ok(stream),
                Ok(Err(e)) => Err(e),
                Err(_) => Err(ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "handshake timeout",
                ))),
            };
            // The receiver may already be gone if the connection task was
            // dropped during shutdown.
            let _ = tx.send(result);
        });

        Self {
            state: ConnState::Handshaking(rx),
            timeouts,
        }
    }

    /// Reads one request. `Ok(None)` means the peer closed the connection
    /// cleanly. The first call completes the handshake gate.
    pub async fn read_request(&mut self) -> Result<Option<(Header, u16, Vec<Value>)>> {
        let receive = self.timeouts.receive;
        let stream = self.stream().await?;

        let frame = timeout(receive, framing::read_message(stream))
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "receive timeout",
                ))
            })??;

        match frame {
            None => Ok(None),
            Some((header, payload)) => {
                let (msg_id, args) = decode_payload(&payload)?;
                trace!(
                    msg_id,
                    seq = header.sequence_num,
                    "LRPC2 server: request received"
                );
                Ok(Some((header, msg_id, args)))
            }
        }
    }

    /// Writes a reply frame echoing the request's message ID, sequence
    /// number, and pid, with a fresh timestamp.
    pub async fn write_response(
        &mut self,
        request: &Header,
        msg_id: u16,
        results: &[Value],
    ) -> Result<()> {
        let payload = encode_payload(msg_id, results);
        if payload.len() > LRPC2_MAX_MSG_LEN as usize {
            return Err(ProtocolError::MsgTooLong(
                payload.len().min(u32::MAX as usize) as u32,
                LRPC2_MAX_MSG_LEN,
            ));
        }

        let header = Header::new(request.pid, request.sequence_num, payload.len() as u32);
        let send = self.timeouts.send;
        let stream = self.stream().await?;

        timeout(send, framing::write_message(stream, &header, &payload))
            .await
            .map_err(|_| {
                ProtocolError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "send timeout",
                ))
            })?
    }

    async fn stream(&mut self) -> Result<&mut UnixStream> {
        if matches!(self.state, ConnState::Handshaking(_)) {
            let state = mem::replace(
                &mut self.state,
                ConnState::Failed("handshake incomplete".to_string()),
            );
            let ConnState::Handshaking(rx) = state else {
                unreachable!()
            };

            match rx.await {
                Ok(Ok(stream)) => self.state = ConnState::Ready(stream),
                Ok(Err(e)) => {
                    debug!("LRPC2 handshake failed: {}", e);
                    self.state = ConnState::Failed(e.to_string());
                    // The first waiter gets the original error; later
                    // calls replay it from the cached state.
                    return Err(e);
                }
                Err(_) => {
                    self.state = ConnState::Failed("handshake task aborted".to_string());
                }
            }
        }

        match &mut self.state {
            ConnState::Ready(stream) => Ok(stream),
            ConnState::Failed(msg) => Err(ProtocolError::HandshakeFailed(msg.clone())),
            ConnState::Handshaking(_) => unreachable!(),
        }
    }
}

/// Server half of the version handshake: the client's requested version
/// is acked together with the maximum payload size, or nacked when the
/// request is short or the version is unsupported.
///
/// A dead transport (timeout, broken pipe, reset) gets no nack; a reply
/// there could block on a connection already known not to work.
async fn do_handshake(stream: &mut UnixStream) -> Result<()> {
    let mut request = [0u8; LRPC2_HANDSHAKE_REQUEST_SIZE];
    if let Err(e) = stream.read_exact(&mut request).await {
        return match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                debug!("Short LRPC2 handshake request, sending nack");
                let _ = reply(stream, LRPC2_NACK, 0).await;
                Err(ProtocolError::BadHandshakeSize)
            }
            std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::ConnectionReset => {
                debug!("LRPC2 connection not working, not replying handshake: {}", e);
                Err(e.into())
            }
            _ => {
                debug!("LRPC2 handshake read error, sending nack: {}", e);
                let _ = reply(stream, LRPC2_NACK, 0).await;
                Err(e.into())
            }
        };
    }

    let version = u32::from_le_bytes(request);
    if version != LRPC2_VERSION_4 {
        let _ = reply(stream, LRPC2_NACK, 0).await;
        return Err(ProtocolError::BadVersion(version));
    }

    reply(stream, LRPC2_ACK, LRPC2_MAX_MSG_LEN).await?;

    trace!("LRPC2 handshake completed, version {}", version);
    Ok(())
}

async fn reply(stream: &mut UnixStream, answer: u32, max_msg_len: u32) -> Result<()> {
    let mut buf = BytesMut::new();
    buf.put_u32_le(answer);
    buf.put_u32_le(max_msg_len);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    fn test_timeouts() -> Timeouts {
        Timeouts {
            handshake: std::time::Duration::from_secs(2),
            receive: std::time::Duration::from_secs(2),
            send: std::time::Duration::from_secs(2),
        }
    }

    fn new_conn(stream: UnixStream) -> ServerConnection {
        ServerConnection::new(stream, test_timeouts(), &TaskTracker::new())
    }

    async fn client_handshake(stream: &mut UnixStream, version: u32) -> (u32, u32) {
        let mut req = BytesMut::new();
        req.put_u32_le(version);
        stream.write_all(&req).await.unwrap();

        let mut reply = [0u8; 8];
        stream.read_exact(&mut reply).await.unwrap();
        let mut buf = &reply[..];
        (buf.get_u32_le(), buf.get_u32_le())
    }

    #[tokio::test]
    async fn test_request_response_roundtrip() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = new_conn(server);

        let server_task = tokio::spawn(async move {
            let (header, msg_id, args) = conn.read_request().await.unwrap().unwrap();
            assert_eq!(msg_id, 100);
            conn.write_response(&header, msg_id, &args).await.unwrap();
        });

        let (answer, max_len) = client_handshake(&mut client, LRPC2_VERSION_4).await;
        assert_eq!(answer, LRPC2_ACK);
        assert_eq!(max_len, LRPC2_MAX_MSG_LEN);

        let payload = encode_payload(100, &[Value::Str("ping".into())]);
        let request = Header::new(1, 55, payload.len() as u32);
        framing::write_message(&mut client, &request, &payload)
            .await
            .unwrap();

        let (reply, reply_payload) = framing::read_message(&mut client)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.sequence_num, 55);
        assert_eq!(reply.pid, 1);
        let (msg_id, results) = decode_payload(&reply_payload).unwrap();
        assert_eq!(msg_id, 100);
        assert_eq!(results, vec![Value::Str("ping".into())]);

        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_unsupported_version_nacked() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = new_conn(server);

        let (answer, _) = client_handshake(&mut client, 3).await;
        assert_eq!(answer, LRPC2_NACK);

        let result = conn.read_request().await;
        assert!(matches!(result, Err(ProtocolError::BadVersion(3))));

        // The failure is replayed on subsequent calls.
        let result = conn.read_request().await;
        assert!(matches!(result, Err(ProtocolError::HandshakeFailed(_))));
    }

    #[tokio::test]
    async fn test_peer_close_before_handshake() {
        let (client, server) = UnixStream::pair().unwrap();
        let mut conn = new_conn(server);
        drop(client);

        let result = conn.read_request().await;
        assert!(matches!(result, Err(ProtocolError::BadHandshakeSize)));
    }

    #[tokio::test]
    async fn test_short_handshake_request_nacked() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = new_conn(server);

        // Two bytes of a four-byte request, then end of stream.
        client.write_all(&[0x04, 0x00]).await.unwrap();
        client.shutdown().await.unwrap();

        let mut reply = [0u8; 8];
        client.read_exact(&mut reply).await.unwrap();
        let answer = u32::from_le_bytes(reply[..4].try_into().unwrap());
        assert_eq!(answer, LRPC2_NACK);

        let result = conn.read_request().await;
        assert!(matches!(result, Err(ProtocolError::BadHandshakeSize)));
    }

    #[tokio::test]
    async fn test_wait_drains_pending_handshake() {
        let (client, server) = UnixStream::pair().unwrap();
        let tracker = TaskTracker::new();
        let timeouts = Timeouts {
            handshake: std::time::Duration::from_millis(100),
            ..test_timeouts()
        };
        let conn = ServerConnection::new(server, timeouts, &tracker);
        assert_eq!(tracker.len(), 1);

        // The peer stays silent; waiting must outlast the handshake task
        // rather than return while it still owns the stream.
        tracker.close();
        tracker.wait().await;
        assert!(tracker.is_empty());

        drop(conn);
        drop(client);
    }

    #[tokio::test]
    async fn test_clean_close_after_handshake() {
        let (mut client, server) = UnixStream::pair().unwrap();
        let mut conn = new_conn(server);

        client_handshake(&mut client, LRPC2_VERSION_4).await;
        drop(client);

        let result = conn.read_request().await.unwrap();
        assert!(result.is_none());
    }
}
