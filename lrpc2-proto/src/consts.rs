//! Protocol constants shared by the LRPC2 client and server.
//!
//! The wire values here are released protocol constants and must match the
//! peer implementation exactly. All multi-byte integers on the wire are
//! little-endian regardless of platform.

use std::time::Duration;

/// NACK answer in a handshake reply.
pub const LRPC2_NACK: u32 = 0;
/// ACK answer in a handshake reply.
pub const LRPC2_ACK: u32 = 1;

/// Magic number carried in every message header.
pub const LRPC2_MAGIC_NUM: u32 = 0xABCD_8012;

/// The maximum LRPC2 message data length. Applies to requests; the server
/// advertises it in the handshake reply.
pub const LRPC2_MAX_MSG_LEN: u32 = 1024 * 1024;

/// Handshake request carries the LRPC2 protocol version.
pub const LRPC2_HANDSHAKE_REQUEST_SIZE: usize = 4;

/// Supported LRPC2 version.
pub const LRPC2_VERSION_4: u32 = 4;

/// LRPC2 version 4 settings.
pub const LRPC2_HANDSHAKE_REPLY_V4_SIZE: usize = 8;
pub const LRPC2_HEADER_LEN_V4: u16 = 34;

/// Default per-phase timeouts.
pub const LRPC2_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
pub const LRPC2_RECEIVE_TIMEOUT: Duration = Duration::from_secs(300);
pub const LRPC2_SEND_TIMEOUT: Duration = Duration::from_secs(60);

/// Message IDs served by the stock agent daemon. Message IDs are opaque to
/// the protocol core; they only need to be unique per endpoint and fit in
/// an unsigned 16-bit value.
pub const MSG_ID_CLIENT_INFO: u16 = 119;
pub const MSG_ID_GET_PUBLIC_KEY: u16 = 1501;
