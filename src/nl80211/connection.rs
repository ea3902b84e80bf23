// SPDX-License-Identifier: MIT

use futures::channel::mpsc::UnboundedReceiver;
use futures::StreamExt;
use genetlink::message::{map_from_rawgenlmsg, RawGenlMessage};
use log::{debug, warn};
use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_proto::{sys::AsyncSocket, Connection};
use netlink_sys::SocketAddr;

use crate::nl80211::{Nl80211Handle, Nl80211Message};
use crate::WsuppError;

/// The two nl80211 multicast groups a supplicant listens to: scan
/// completion and MLME events (authenticate/associate/disconnect).
pub const MCAST_GROUP_SCAN: &str = "scan";
pub const MCAST_GROUP_MLME: &str = "mlme";

#[allow(clippy::type_complexity)]
pub fn new_connection() -> std::io::Result<(
    Connection<RawGenlMessage>,
    Nl80211Handle,
    UnboundedReceiver<(NetlinkMessage<RawGenlMessage>, SocketAddr)>,
)> {
    let (conn, handle, messages) = genetlink::new_connection()?;
    Ok((conn, Nl80211Handle::new(handle), messages))
}

/// Unsolicited nl80211 messages, delivered over a dedicated
/// connection whose socket joined the scan and mlme groups. Requests
/// never travel on this connection, so kernel events cannot be
/// confused with dump replies.
pub struct Nl80211Events {
    messages:
        UnboundedReceiver<(NetlinkMessage<RawGenlMessage>, SocketAddr)>,
}

impl Nl80211Events {
    /// Resolves the multicast group ids through the request handle,
    /// then opens and subscribes the event connection.
    pub async fn new(
        handle: &mut Nl80211Handle,
    ) -> Result<Self, WsuppError> {
        let groups = handle
            .resolve_mcast_groups(&[MCAST_GROUP_SCAN, MCAST_GROUP_MLME])
            .await?;

        let (mut conn, _, messages) = genetlink::new_connection()?;
        for group in groups {
            conn.socket_mut().socket_mut().add_membership(group)?;
        }
        tokio::spawn(conn);

        Ok(Nl80211Events { messages })
    }

    /// Next parsed event. None means the kernel side is gone, which
    /// the caller treats as fatal. Messages that fail to decode are
    /// logged and dropped, per the malformed-frame policy.
    pub async fn next(&mut self) -> Option<Nl80211Message> {
        loop {
            let (msg, _addr) = self.messages.next().await?;
            match map_from_rawgenlmsg::<Nl80211Message>(msg) {
                Ok(msg) => match msg.payload {
                    NetlinkPayload::InnerMessage(genl) => {
                        return Some(genl.payload)
                    }
                    NetlinkPayload::Error(e) => {
                        warn!("nl80211 event socket error: {e}");
                    }
                    _ => (),
                },
                Err(e) => {
                    debug!("dropping nl80211 event: {e}");
                }
            }
        }
    }
}
