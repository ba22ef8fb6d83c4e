//! Protocol messages consumed or originated by the connection stack.
//!
//! Wire encoding is the codec's concern; these are the decoded forms.

use serde::{Deserialize, Serialize};

use crate::types::NetworkAddress;

/// The subset of the Bitcoin message set this library speaks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    Version(VersionPayload),
    Verack,
    /// Pre-BIP31 pings carry no nonce.
    Ping { nonce: Option<u64> },
    Pong { nonce: u64 },
    GetAddress,
    Address(Vec<NetworkAddress>),
    Reject(RejectPayload),
}

impl Message {
    /// The Bitcoin command string for this message.
    pub fn command(&self) -> &'static str {
        match self {
            Message::Version(_) => Self::VERSION,
            Message::Verack => Self::VERACK,
            Message::Ping { .. } => Self::PING,
            Message::Pong { .. } => Self::PONG,
            Message::GetAddress => Self::GET_ADDRESS,
            Message::Address(_) => Self::ADDRESS,
            Message::Reject(_) => Self::REJECT,
        }
    }

    pub const VERSION: &'static str = "version";
    pub const VERACK: &'static str = "verack";
    pub const PING: &'static str = "ping";
    pub const PONG: &'static str = "pong";
    pub const GET_ADDRESS: &'static str = "getaddr";
    pub const ADDRESS: &'static str = "addr";
    pub const REJECT: &'static str = "reject";
}

/// Handshake announcement exchanged at channel start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionPayload {
    /// Highest protocol level the sender speaks.
    pub value: u32,
    /// Service bits the sender provides.
    pub services: u64,
    /// Sender wall clock, unix seconds.
    pub timestamp: u64,
    /// How the sender sees the receiver; services zeroed, they cannot
    /// be reflected.
    pub receiver: NetworkAddress,
    /// The sender's own advertised address.
    pub sender: NetworkAddress,
    /// Random per-channel nonce, used to detect connection to self.
    pub nonce: u64,
    pub user_agent: String,
    /// Sender's best block height.
    pub start_height: u32,
    /// Whether the sender wants unsolicited transaction relay (BIP37).
    pub relay: bool,
}

/// Reject error classes (BIP61).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectCode {
    Malformed,
    Invalid,
    Obsolete,
    Duplicate,
    NonStandard,
    Dust,
    InsufficientFee,
    Checkpoint,
}

/// Rejection notice for a previously sent message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectPayload {
    /// Command string of the rejected message.
    pub message: String,
    pub code: RejectCode,
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands() {
        assert_eq!(Message::Verack.command(), "verack");
        assert_eq!(Message::GetAddress.command(), "getaddr");
        assert_eq!(Message::Ping { nonce: None }.command(), "ping");
        assert_eq!(Message::Address(vec![]).command(), "addr");
    }
}
