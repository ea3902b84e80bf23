// SPDX-License-Identifier: MIT

use thiserror::Error;

use netlink_packet_core::{DecodeError, ErrorMessage, NetlinkMessage};
use netlink_packet_generic::GenlMessage;

use crate::nl80211::Nl80211Message;

#[derive(Debug, Error)]
pub enum WsuppError {
    #[error("Received an unexpected message {0:?}")]
    UnexpectedMessage(NetlinkMessage<GenlMessage<Nl80211Message>>),

    #[error("Received a netlink error message {0}")]
    NetlinkError(ErrorMessage),

    #[error("A netlink request failed")]
    RequestFailed(String),

    #[error("Failed to decode netlink package: {0}")]
    DecodeFailed(DecodeError),

    #[error("Could not resolve the nl80211 multicast group {0}")]
    NoSuchMcastGroup(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Fatal(String),

    #[error("A bug in this crate")]
    Bug(String),
}
