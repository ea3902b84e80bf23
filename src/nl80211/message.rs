// SPDX-License-Identifier: MIT

use netlink_packet_core::{
    DecodeError, Emitable, ErrorContext, NlasIterator, Parseable,
    ParseableParametrized,
};
use netlink_packet_generic::{GenlFamily, GenlHeader};

use crate::ies::{SUITE_CCMP, SUITE_TKIP};
use crate::nl80211::attr::{Nl80211Attr, AUTH_TYPE_OPEN_SYSTEM};

const NL80211_CMD_NEW_KEY: u8 = 11;
const NL80211_CMD_GET_SCAN: u8 = 32;
const NL80211_CMD_TRIGGER_SCAN: u8 = 33;
const NL80211_CMD_NEW_SCAN_RESULTS: u8 = 34;
const NL80211_CMD_SCAN_ABORTED: u8 = 35;
const NL80211_CMD_AUTHENTICATE: u8 = 37;
const NL80211_CMD_ASSOCIATE: u8 = 38;
const NL80211_CMD_DEAUTHENTICATE: u8 = 39;
const NL80211_CMD_DISASSOCIATE: u8 = 40;
const NL80211_CMD_CONNECT: u8 = 46;
const NL80211_CMD_ROAM: u8 = 47;
const NL80211_CMD_DISCONNECT: u8 = 48;

/// 802.11 reason 3: deauthenticated because sending STA is leaving.
const REASON_DEAUTH_LEAVING: u16 = 3;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum Nl80211Cmd {
    NewKey,
    ScanGet,
    ScanTrigger,
    ScanResults,
    ScanAborted,
    Authenticate,
    Associate,
    Deauthenticate,
    Disassociate,
    Connect,
    Roam,
    Disconnect,
}

impl From<Nl80211Cmd> for u8 {
    fn from(cmd: Nl80211Cmd) -> Self {
        match cmd {
            Nl80211Cmd::NewKey => NL80211_CMD_NEW_KEY,
            Nl80211Cmd::ScanGet => NL80211_CMD_GET_SCAN,
            Nl80211Cmd::ScanTrigger => NL80211_CMD_TRIGGER_SCAN,
            Nl80211Cmd::ScanResults => NL80211_CMD_NEW_SCAN_RESULTS,
            Nl80211Cmd::ScanAborted => NL80211_CMD_SCAN_ABORTED,
            Nl80211Cmd::Authenticate => NL80211_CMD_AUTHENTICATE,
            Nl80211Cmd::Associate => NL80211_CMD_ASSOCIATE,
            Nl80211Cmd::Deauthenticate => NL80211_CMD_DEAUTHENTICATE,
            Nl80211Cmd::Disassociate => NL80211_CMD_DISASSOCIATE,
            Nl80211Cmd::Connect => NL80211_CMD_CONNECT,
            Nl80211Cmd::Roam => NL80211_CMD_ROAM,
            Nl80211Cmd::Disconnect => NL80211_CMD_DISCONNECT,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Nl80211Message {
    pub cmd: Nl80211Cmd,
    pub attributes: Vec<Nl80211Attr>,
}

impl GenlFamily for Nl80211Message {
    fn family_name() -> &'static str {
        "nl80211"
    }

    fn version(&self) -> u8 {
        1
    }

    fn command(&self) -> u8 {
        self.cmd.into()
    }
}

impl Nl80211Message {
    /// Wildcard active scan on one interface.
    pub fn new_trigger_scan(if_index: u32) -> Self {
        Nl80211Message {
            cmd: Nl80211Cmd::ScanTrigger,
            attributes: vec![
                Nl80211Attr::IfIndex(if_index),
                Nl80211Attr::ScanSsids(vec![Vec::new()]),
            ],
        }
    }

    pub fn new_scan_get(if_index: u32) -> Self {
        Nl80211Message {
            cmd: Nl80211Cmd::ScanGet,
            attributes: vec![Nl80211Attr::IfIndex(if_index)],
        }
    }

    pub fn new_authenticate(
        if_index: u32,
        bssid: [u8; 6],
        freq: u32,
        ssid: Vec<u8>,
    ) -> Self {
        Nl80211Message {
            cmd: Nl80211Cmd::Authenticate,
            attributes: vec![
                Nl80211Attr::IfIndex(if_index),
                Nl80211Attr::Mac(bssid),
                Nl80211Attr::WiphyFreq(freq),
                Nl80211Attr::Ssid(ssid),
                Nl80211Attr::AuthType(AUTH_TYPE_OPEN_SYSTEM),
            ],
        }
    }

    /// The IEs given here are the RSN element the EAPOL layer will
    /// replay in packet 2/4.
    pub fn new_associate(
        if_index: u32,
        bssid: [u8; 6],
        freq: u32,
        ssid: Vec<u8>,
        ies: Vec<u8>,
    ) -> Self {
        Nl80211Message {
            cmd: Nl80211Cmd::Associate,
            attributes: vec![
                Nl80211Attr::IfIndex(if_index),
                Nl80211Attr::Mac(bssid),
                Nl80211Attr::WiphyFreq(freq),
                Nl80211Attr::Ssid(ssid),
                Nl80211Attr::Ie(ies),
            ],
        }
    }

    pub fn new_disconnect(if_index: u32) -> Self {
        Nl80211Message {
            cmd: Nl80211Cmd::Disconnect,
            attributes: vec![
                Nl80211Attr::IfIndex(if_index),
                Nl80211Attr::ReasonCode(REASON_DEAUTH_LEAVING),
            ],
        }
    }

    /// Pairwise key install: CCMP TK in slot 0, addressed to the AP.
    pub fn new_key_pairwise(
        if_index: u32,
        bssid: [u8; 6],
        tk: [u8; 16],
    ) -> Self {
        Nl80211Message {
            cmd: Nl80211Cmd::NewKey,
            attributes: vec![
                Nl80211Attr::IfIndex(if_index),
                Nl80211Attr::Mac(bssid),
                Nl80211Attr::KeyData(tk.to_vec()),
                Nl80211Attr::KeyCipher(SUITE_CCMP),
                Nl80211Attr::KeyIdx(0),
            ],
        }
    }

    /// Group key install with the receive sequence counter the AP
    /// reported in packet 3/4 (or the rekey frame).
    pub fn new_key_group(
        if_index: u32,
        key: Vec<u8>,
        index: u8,
        rsc: [u8; 6],
        tkip: bool,
    ) -> Self {
        let cipher = if tkip { SUITE_TKIP } else { SUITE_CCMP };
        Nl80211Message {
            cmd: Nl80211Cmd::NewKey,
            attributes: vec![
                Nl80211Attr::IfIndex(if_index),
                Nl80211Attr::KeyData(key),
                Nl80211Attr::KeyCipher(cipher),
                Nl80211Attr::KeyIdx(index),
                Nl80211Attr::KeySeq(rsc.to_vec()),
            ],
        }
    }
}

impl Emitable for Nl80211Message {
    fn buffer_len(&self) -> usize {
        self.attributes.as_slice().buffer_len()
    }

    fn emit(&self, buffer: &mut [u8]) {
        self.attributes.as_slice().emit(buffer)
    }
}

fn parse_nlas(buffer: &[u8]) -> Result<Vec<Nl80211Attr>, DecodeError> {
    let mut nlas = Vec::new();
    for nla in NlasIterator::new(buffer) {
        let error_msg = "Failed to parse nl80211 message attribute";
        let nla = &nla.context(error_msg)?;
        nlas.push(Nl80211Attr::parse(nla).context(error_msg)?);
    }
    Ok(nlas)
}

impl ParseableParametrized<[u8], GenlHeader> for Nl80211Message {
    fn parse_with_param(
        buffer: &[u8],
        header: GenlHeader,
    ) -> Result<Self, DecodeError> {
        let cmd = match header.cmd {
            NL80211_CMD_NEW_KEY => Nl80211Cmd::NewKey,
            NL80211_CMD_TRIGGER_SCAN => Nl80211Cmd::ScanTrigger,
            NL80211_CMD_NEW_SCAN_RESULTS => Nl80211Cmd::ScanResults,
            NL80211_CMD_SCAN_ABORTED => Nl80211Cmd::ScanAborted,
            NL80211_CMD_AUTHENTICATE => Nl80211Cmd::Authenticate,
            NL80211_CMD_ASSOCIATE => Nl80211Cmd::Associate,
            NL80211_CMD_DEAUTHENTICATE => Nl80211Cmd::Deauthenticate,
            NL80211_CMD_DISASSOCIATE => Nl80211Cmd::Disassociate,
            NL80211_CMD_CONNECT => Nl80211Cmd::Connect,
            NL80211_CMD_ROAM => Nl80211Cmd::Roam,
            NL80211_CMD_DISCONNECT => Nl80211Cmd::Disconnect,
            cmd => {
                return Err(DecodeError::from(format!(
                    "Unsupported nl80211 reply command: {cmd}"
                )))
            }
        };
        Ok(Nl80211Message {
            cmd,
            attributes: parse_nlas(buffer)?,
        })
    }
}

impl Nl80211Message {
    pub fn get_ifindex(&self) -> Option<u32> {
        self.attributes.iter().find_map(|a| match a {
            Nl80211Attr::IfIndex(ifi) => Some(*ifi),
            _ => None,
        })
    }

    pub fn get_mac(&self) -> Option<[u8; 6]> {
        self.attributes.iter().find_map(|a| match a {
            Nl80211Attr::Mac(mac) => Some(*mac),
            _ => None,
        })
    }

    pub fn get_status_code(&self) -> Option<u16> {
        self.attributes.iter().find_map(|a| match a {
            Nl80211Attr::StatusCode(code) => Some(*code),
            _ => None,
        })
    }

    pub fn get_bss(&self) -> Option<&[crate::nl80211::Nl80211BssAttr]> {
        self.attributes.iter().find_map(|a| match a {
            Nl80211Attr::Bss(attrs) => Some(attrs.as_slice()),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nl80211::Nl80211BssAttr;
    use netlink_packet_core::Emitable as _;
    use netlink_packet_generic::GenlMessage;

    // Wire form of the wildcard scan trigger, as seen in nlmon
    // captures of `iw dev wlan0 scan`.
    #[test]
    fn trigger_scan_wire_format() {
        let family_id = 0x26;
        let genl = GenlMessage::new(
            GenlHeader {
                cmd: NL80211_CMD_TRIGGER_SCAN,
                version: 1,
            },
            Nl80211Message::new_trigger_scan(2),
            family_id,
        );

        let mut buf = vec![0; genl.buffer_len()];
        genl.emit(&mut buf);

        let expected = vec![
            0x21, 0x01, 0x00, 0x00, // cmd 33, version 1
            0x08, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00, // ifindex 2
            0x08, 0x00, 0x2d, 0x00, 0x04, 0x00, 0x00, 0x00, // wildcard
        ];
        assert_eq!(buf, expected);
    }

    #[test]
    fn scan_result_event_parses() {
        // NEW_SCAN_RESULTS carrying a nested BSS: bssid, frequency,
        // signal and a short IE blob (SSID "Test").
        let payload = vec![
            0x08, 0x00, 0x03, 0x00, 0x15, 0x00, 0x00, 0x00, // ifindex
            0x2c, 0x00, 0x2f, 0x00, // BSS nest
            0x0a, 0x00, 0x01, 0x00, 0x02, 0x00, 0x00, 0x00, 0x00, 0x01,
            0x00, 0x00, // bssid + pad
            0x08, 0x00, 0x02, 0x00, 0x85, 0x09, 0x00, 0x00, // freq 2437
            0x08, 0x00, 0x07, 0x00, 0x60, 0xf0, 0xff, 0xff, // -4000 mBm
            0x0a, 0x00, 0x06, 0x00, 0x00, 0x04, 0x54, 0x65, 0x73, 0x74,
            0x00, 0x00, // IEs + pad
        ];
        let header = GenlHeader {
            cmd: NL80211_CMD_NEW_SCAN_RESULTS,
            version: 1,
        };
        let msg =
            Nl80211Message::parse_with_param(&payload, header).unwrap();
        assert_eq!(msg.cmd, Nl80211Cmd::ScanResults);

        let bss = msg.get_bss().unwrap();
        assert!(bss
            .iter()
            .any(|a| *a == Nl80211BssAttr::Bssid([2, 0, 0, 0, 0, 1])));
        assert!(bss.iter().any(|a| *a == Nl80211BssAttr::Frequency(2437)));
        assert!(bss
            .iter()
            .any(|a| *a == Nl80211BssAttr::SignalMbm(-4000)));
        assert!(bss.iter().any(|a| {
            *a == Nl80211BssAttr::InformationElements(vec![
                0x00, 0x04, 0x54, 0x65, 0x73, 0x74,
            ])
        }));
    }

    #[test]
    fn disconnect_event_parses() {
        let payload = vec![
            0x08, 0x00, 0x03, 0x00, 0x02, 0x00, 0x00, 0x00, // ifindex
            0x06, 0x00, 0x36, 0x00, 0x03, 0x00, 0x00, 0x00, // reason 3
        ];
        let header = GenlHeader {
            cmd: NL80211_CMD_DISCONNECT,
            version: 1,
        };
        let msg =
            Nl80211Message::parse_with_param(&payload, header).unwrap();
        assert_eq!(msg.cmd, Nl80211Cmd::Disconnect);
    }

    #[test]
    fn unknown_command_is_an_error_not_a_panic() {
        let header = GenlHeader { cmd: 250, version: 1 };
        assert!(Nl80211Message::parse_with_param(&[], header).is_err());
    }

    #[test]
    fn key_messages_carry_the_right_attrs() {
        let msg = Nl80211Message::new_key_pairwise(
            2,
            [2, 0, 0, 0, 0, 1],
            [0xAA; 16],
        );
        assert!(msg
            .attributes
            .contains(&Nl80211Attr::KeyCipher(SUITE_CCMP)));
        assert!(msg.attributes.contains(&Nl80211Attr::KeyIdx(0)));

        let msg = Nl80211Message::new_key_group(
            2,
            vec![0x33; 16],
            2,
            [5, 0, 0, 0, 0, 0],
            false,
        );
        assert!(msg.attributes.contains(&Nl80211Attr::KeyIdx(2)));
        assert!(msg
            .attributes
            .contains(&Nl80211Attr::KeySeq(vec![5, 0, 0, 0, 0, 0])));

        let msg =
            Nl80211Message::new_key_group(2, vec![0x33; 32], 1, [0; 6], true);
        assert!(msg
            .attributes
            .contains(&Nl80211Attr::KeyCipher(SUITE_TKIP)));
    }
}
