pub mod consts;
pub mod framing;
pub mod header;
pub mod secure;
pub mod value;

pub use consts::*;
pub use header::Header;
pub use secure::SecureMessenger;
pub use value::{decode_payload, encode_payload, Value};

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bad magic number")]
    BadMagicNum,

    #[error("Bad header length")]
    BadHeaderLen,

    #[error("Message version mismatched: {0}")]
    VersionMismatch(u32),

    #[error("Message length {0} exceeds LRPC2 limit ({1})")]
    MsgTooLong(u32, u32),

    #[error("LRPC2 handshake request size mismatched")]
    BadHandshakeSize,

    #[error("Unknown LRPC2 version: {0}")]
    BadVersion(u32),

    #[error("LRPC2 handshake rejected")]
    HandshakeRejected,

    #[error("Handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("Unsupported data type tag in lrpc message: {0}")]
    UnknownTag(u8),

    #[error("Lrpc message is incomplete")]
    Truncated,

    #[error("String value is not valid UTF-8")]
    InvalidUtf8,

    #[error("Sequence number mismatched: sent {sent}, got {got}")]
    SeqNumMismatch { sent: u32, got: u32 },

    #[error("Not connected")]
    NotConnected,

    #[error("Command {0} out of supported range")]
    CommandOutOfRange(u32),

    #[error("Message ID {0} is not registered")]
    UnknownMessageId(u16),

    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("RSA error: {0}")]
    Rsa(#[from] rsa::Error),

    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;
