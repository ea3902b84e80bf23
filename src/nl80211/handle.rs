// SPDX-License-Identifier: MIT

use futures::StreamExt;
use genetlink::GenetlinkHandle;
use netlink_packet_core::{
    NetlinkMessage, NetlinkPayload, NLM_F_ACK, NLM_F_DUMP, NLM_F_REQUEST,
};
use netlink_packet_generic::ctrl::{
    nlas::{GenlCtrlAttrs, McastGrpAttrs},
    GenlCtrl, GenlCtrlCmd,
};
use netlink_packet_generic::GenlMessage;

use crate::nl80211::Nl80211Message;
use crate::WsuppError;

/// Request/reply side of the nl80211 connection. Every exchange here
/// is short and bounded: the kernel is the peer, so a dialogue cannot
/// stall the daemon.
#[derive(Clone, Debug)]
pub struct Nl80211Handle {
    pub handle: GenetlinkHandle,
}

impl Nl80211Handle {
    pub(crate) fn new(handle: GenetlinkHandle) -> Self {
        Nl80211Handle { handle }
    }

    pub async fn request(
        &mut self,
        message: NetlinkMessage<GenlMessage<Nl80211Message>>,
    ) -> Result<
        impl futures::Stream<
            Item = Result<
                NetlinkMessage<GenlMessage<Nl80211Message>>,
                netlink_packet_core::DecodeError,
            >,
        >,
        WsuppError,
    > {
        self.handle.request(message).await.map_err(|e| {
            WsuppError::RequestFailed(format!("Request failed with {e}"))
        })
    }

    /// Sends one command and waits for its ack. A netlink error with a
    /// non-zero code comes back as [`WsuppError::NetlinkError`], which
    /// carries the raw errno for the caller to map.
    pub async fn ack(
        &mut self,
        message: Nl80211Message,
    ) -> Result<(), WsuppError> {
        let mut nl_msg =
            NetlinkMessage::from(GenlMessage::from_payload(message));
        nl_msg.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        let mut response = self.request(nl_msg).await?;
        while let Some(msg) = response.next().await {
            let msg = msg.map_err(WsuppError::DecodeFailed)?;
            match msg.payload {
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(WsuppError::NetlinkError(err))
                }
                // code None is the ack itself
                NetlinkPayload::Error(_) => return Ok(()),
                _ => (),
            }
        }
        Ok(())
    }

    /// Dump request; collects every inner message of the reply.
    pub async fn dump(
        &mut self,
        message: Nl80211Message,
    ) -> Result<Vec<Nl80211Message>, WsuppError> {
        let mut nl_msg =
            NetlinkMessage::from(GenlMessage::from_payload(message));
        nl_msg.header.flags = NLM_F_REQUEST | NLM_F_DUMP;

        let mut response = self.request(nl_msg).await?;
        let mut ret = Vec::new();
        while let Some(msg) = response.next().await {
            let msg = msg.map_err(WsuppError::DecodeFailed)?;
            match msg.payload {
                NetlinkPayload::InnerMessage(genl) => {
                    ret.push(genl.payload)
                }
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(WsuppError::NetlinkError(err))
                }
                _ => (),
            }
        }
        Ok(ret)
    }

    pub async fn trigger_scan(
        &mut self,
        if_index: u32,
    ) -> Result<(), WsuppError> {
        self.ack(Nl80211Message::new_trigger_scan(if_index)).await
    }

    pub async fn dump_scan(
        &mut self,
        if_index: u32,
    ) -> Result<Vec<Nl80211Message>, WsuppError> {
        self.dump(Nl80211Message::new_scan_get(if_index)).await
    }

    pub async fn authenticate(
        &mut self,
        if_index: u32,
        bssid: [u8; 6],
        freq: u32,
        ssid: Vec<u8>,
    ) -> Result<(), WsuppError> {
        self.ack(Nl80211Message::new_authenticate(
            if_index, bssid, freq, ssid,
        ))
        .await
    }

    pub async fn associate(
        &mut self,
        if_index: u32,
        bssid: [u8; 6],
        freq: u32,
        ssid: Vec<u8>,
        ies: Vec<u8>,
    ) -> Result<(), WsuppError> {
        self.ack(Nl80211Message::new_associate(
            if_index, bssid, freq, ssid, ies,
        ))
        .await
    }

    pub async fn disconnect(
        &mut self,
        if_index: u32,
    ) -> Result<(), WsuppError> {
        self.ack(Nl80211Message::new_disconnect(if_index)).await
    }

    pub async fn install_ptk(
        &mut self,
        if_index: u32,
        bssid: [u8; 6],
        tk: [u8; 16],
    ) -> Result<(), WsuppError> {
        self.ack(Nl80211Message::new_key_pairwise(if_index, bssid, tk))
            .await
    }

    pub async fn install_gtk(
        &mut self,
        if_index: u32,
        key: Vec<u8>,
        index: u8,
        rsc: [u8; 6],
        tkip: bool,
    ) -> Result<(), WsuppError> {
        self.ack(Nl80211Message::new_key_group(
            if_index, key, index, rsc, tkip,
        ))
        .await
    }

    /// Looks up nl80211 multicast group ids by name via the generic
    /// netlink ctrl family, in the order the names were given.
    pub async fn resolve_mcast_groups(
        &mut self,
        names: &[&str],
    ) -> Result<Vec<u32>, WsuppError> {
        let mut nl_msg =
            NetlinkMessage::from(GenlMessage::from_payload(GenlCtrl {
                cmd: GenlCtrlCmd::GetFamily,
                nlas: vec![GenlCtrlAttrs::FamilyName(
                    "nl80211".to_string(),
                )],
            }));
        nl_msg.header.flags = NLM_F_REQUEST | NLM_F_ACK;

        let mut response = self.handle.request(nl_msg).await.map_err(|e| {
            WsuppError::RequestFailed(format!("Request failed with {e}"))
        })?;

        let mut ids = vec![None; names.len()];
        while let Some(msg) = response.next().await {
            let msg = msg.map_err(WsuppError::DecodeFailed)?;
            match msg.payload {
                NetlinkPayload::InnerMessage(genl) => {
                    for nla in &genl.payload.nlas {
                        let GenlCtrlAttrs::McastGroups(groups) = nla
                        else {
                            continue;
                        };
                        for group in groups {
                            collect_group(group, names, &mut ids);
                        }
                    }
                }
                NetlinkPayload::Error(err) if err.code.is_some() => {
                    return Err(WsuppError::NetlinkError(err))
                }
                _ => (),
            }
        }

        ids.into_iter()
            .zip(names.iter())
            .map(|(id, name)| {
                id.ok_or_else(|| {
                    WsuppError::NoSuchMcastGroup(name.to_string())
                })
            })
            .collect()
    }
}

fn collect_group(
    group: &[McastGrpAttrs],
    names: &[&str],
    ids: &mut [Option<u32>],
) {
    let mut name = None;
    let mut id = None;
    for attr in group {
        match attr {
            McastGrpAttrs::Name(n) => name = Some(n.as_str()),
            McastGrpAttrs::Id(i) => id = Some(*i),
            #[allow(unreachable_patterns)]
            _ => (),
        }
    }
    if let (Some(name), Some(id)) = (name, id) {
        if let Some(pos) = names.iter().position(|n| *n == name) {
            ids[pos] = Some(id);
        }
    }
}
