use bytes::{Buf, BufMut};

use crate::{
    ProtocolError, Result, LRPC2_HEADER_LEN_V4, LRPC2_MAGIC_NUM, LRPC2_MAX_MSG_LEN, LRPC2_VERSION_4,
};

/// LRPC2 version 4 message header. Transmitted before every request and
/// every reply, always 34 bytes, always little-endian.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub magic_num: u32,
    pub header_len: u16,
    pub version: u32,
    pub pid: u64,
    pub sequence_num: u32,
    pub timestamp: u64,
    pub msg_data_len: u32,
}

impl Header {
    /// Builds a header for an outgoing message, stamped with the current
    /// time.
    pub fn new(pid: u64, sequence_num: u32, msg_data_len: u32) -> Self {
        Self {
            magic_num: LRPC2_MAGIC_NUM,
            header_len: LRPC2_HEADER_LEN_V4,
            version: LRPC2_VERSION_4,
            pid,
            sequence_num,
            timestamp: chrono::Utc::now().timestamp() as u64,
            msg_data_len,
        }
    }

    pub const fn wire_len() -> usize {
        LRPC2_HEADER_LEN_V4 as usize
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        if buf.remaining() < Self::wire_len() {
            return Err(ProtocolError::Truncated);
        }

        Ok(Self {
            magic_num: buf.get_u32_le(),
            header_len: buf.get_u16_le(),
            version: buf.get_u32_le(),
            pid: buf.get_u64_le(),
            sequence_num: buf.get_u32_le(),
            timestamp: buf.get_u64_le(),
            msg_data_len: buf.get_u32_le(),
        })
    }

    pub fn encode(&self, buf: &mut impl BufMut) {
        buf.put_u32_le(self.magic_num);
        buf.put_u16_le(self.header_len);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.pid);
        buf.put_u32_le(self.sequence_num);
        buf.put_u64_le(self.timestamp);
        buf.put_u32_le(self.msg_data_len);
    }

    /// Validates the fixed fields against the protocol constants. Each
    /// failure has its own error kind so callers can tell a stray client
    /// from a version skew.
    pub fn verify(&self) -> Result<()> {
        if self.magic_num != LRPC2_MAGIC_NUM {
            return Err(ProtocolError::BadMagicNum);
        }

        if self.header_len != LRPC2_HEADER_LEN_V4 {
            return Err(ProtocolError::BadHeaderLen);
        }

        if self.version != LRPC2_VERSION_4 {
            return Err(ProtocolError::VersionMismatch(self.version));
        }

        if self.msg_data_len > LRPC2_MAX_MSG_LEN {
            return Err(ProtocolError::MsgTooLong(self.msg_data_len, LRPC2_MAX_MSG_LEN));
        }

        Ok(())
    }
}
