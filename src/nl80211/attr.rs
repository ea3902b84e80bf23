// SPDX-License-Identifier: MIT

use netlink_packet_core::{
    parse_u16, parse_u32, parse_u8, DecodeError, DefaultNla, Emitable,
    ErrorContext, Nla, NlaBuffer, NlasIterator, Parseable,
};

use crate::bytes::{write_u16, write_u32};
use crate::nl80211::Nl80211BssAttr;

const ETH_ALEN: usize = 6;

const NL80211_ATTR_IFINDEX: u16 = 3;
const NL80211_ATTR_MAC: u16 = 6;
const NL80211_ATTR_KEY_DATA: u16 = 7;
const NL80211_ATTR_KEY_IDX: u16 = 8;
const NL80211_ATTR_KEY_CIPHER: u16 = 9;
const NL80211_ATTR_KEY_SEQ: u16 = 10;
const NL80211_ATTR_WIPHY_FREQ: u16 = 38;
const NL80211_ATTR_IE: u16 = 42;
const NL80211_ATTR_SCAN_SSIDS: u16 = 45;
const NL80211_ATTR_GENERATION: u16 = 46;
const NL80211_ATTR_BSS: u16 = 47;
const NL80211_ATTR_SSID: u16 = 52;
const NL80211_ATTR_AUTH_TYPE: u16 = 53;
const NL80211_ATTR_REASON_CODE: u16 = 54;
const NL80211_ATTR_STATUS_CODE: u16 = 72;

/// NL80211_AUTHTYPE_OPEN_SYSTEM; the only auth algorithm WPA2-PSK
/// ever uses.
pub const AUTH_TYPE_OPEN_SYSTEM: u32 = 0;

struct SsidNla {
    index: u16,
    ssid: Vec<u8>,
}

impl Nla for SsidNla {
    fn value_len(&self) -> usize {
        self.ssid.len()
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        buffer[..self.ssid.len()].copy_from_slice(&self.ssid)
    }

    fn kind(&self) -> u16 {
        self.index
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Nl80211Attr {
    IfIndex(u32),
    Mac([u8; ETH_ALEN]),
    KeyData(Vec<u8>),
    KeyIdx(u8),
    KeyCipher(u32),
    KeySeq(Vec<u8>),
    /// Frequency in MHz
    WiphyFreq(u32),
    Ie(Vec<u8>),
    /// SSIDs to probe for; one empty SSID means a wildcard scan.
    ScanSsids(Vec<Vec<u8>>),
    Generation(u32),
    Bss(Vec<Nl80211BssAttr>),
    Ssid(Vec<u8>),
    AuthType(u32),
    ReasonCode(u16),
    StatusCode(u16),
    Other(DefaultNla),
}

impl Nla for Nl80211Attr {
    fn value_len(&self) -> usize {
        match self {
            Self::IfIndex(_)
            | Self::KeyCipher(_)
            | Self::WiphyFreq(_)
            | Self::Generation(_)
            | Self::AuthType(_) => 4,
            Self::Mac(_) => ETH_ALEN,
            Self::KeyIdx(_) => 1,
            Self::ReasonCode(_) | Self::StatusCode(_) => 2,
            Self::KeyData(d) | Self::KeySeq(d) | Self::Ie(d)
            | Self::Ssid(d) => d.len(),
            Self::ScanSsids(ssids) => ssids
                .iter()
                .enumerate()
                .map(|(i, s)| {
                    SsidNla {
                        index: i as u16,
                        ssid: s.clone(),
                    }
                    .buffer_len()
                })
                .sum(),
            Self::Bss(attrs) => attrs.as_slice().buffer_len(),
            Self::Other(attr) => attr.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::IfIndex(_) => NL80211_ATTR_IFINDEX,
            Self::Mac(_) => NL80211_ATTR_MAC,
            Self::KeyData(_) => NL80211_ATTR_KEY_DATA,
            Self::KeyIdx(_) => NL80211_ATTR_KEY_IDX,
            Self::KeyCipher(_) => NL80211_ATTR_KEY_CIPHER,
            Self::KeySeq(_) => NL80211_ATTR_KEY_SEQ,
            Self::WiphyFreq(_) => NL80211_ATTR_WIPHY_FREQ,
            Self::Ie(_) => NL80211_ATTR_IE,
            Self::ScanSsids(_) => NL80211_ATTR_SCAN_SSIDS,
            Self::Generation(_) => NL80211_ATTR_GENERATION,
            Self::Bss(_) => NL80211_ATTR_BSS,
            Self::Ssid(_) => NL80211_ATTR_SSID,
            Self::AuthType(_) => NL80211_ATTR_AUTH_TYPE,
            Self::ReasonCode(_) => NL80211_ATTR_REASON_CODE,
            Self::StatusCode(_) => NL80211_ATTR_STATUS_CODE,
            Self::Other(attr) => attr.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::IfIndex(d)
            | Self::KeyCipher(d)
            | Self::WiphyFreq(d)
            | Self::Generation(d)
            | Self::AuthType(d) => write_u32(buffer, *d),
            Self::Mac(mac) => buffer[..ETH_ALEN].copy_from_slice(mac),
            Self::KeyIdx(d) => buffer[0] = *d,
            Self::ReasonCode(d) | Self::StatusCode(d) => {
                write_u16(buffer, *d)
            }
            Self::KeyData(d) | Self::KeySeq(d) | Self::Ie(d)
            | Self::Ssid(d) => buffer[..d.len()].copy_from_slice(d),
            Self::ScanSsids(ssids) => {
                let mut offset = 0;
                for (i, s) in ssids.iter().enumerate() {
                    let nla = SsidNla {
                        index: i as u16,
                        ssid: s.clone(),
                    };
                    nla.emit(
                        &mut buffer[offset..offset + nla.buffer_len()],
                    );
                    offset += nla.buffer_len();
                }
            }
            Self::Bss(attrs) => attrs.as_slice().emit(buffer),
            Self::Other(attr) => attr.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>>
    for Nl80211Attr
{
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            NL80211_ATTR_IFINDEX => Self::IfIndex(
                parse_u32(payload)
                    .context("Invalid NL80211_ATTR_IFINDEX")?,
            ),
            NL80211_ATTR_MAC => {
                let mac: [u8; ETH_ALEN] =
                    payload.try_into().map_err(|_| {
                        DecodeError::from(format!(
                            "Invalid NL80211_ATTR_MAC {payload:?}"
                        ))
                    })?;
                Self::Mac(mac)
            }
            NL80211_ATTR_KEY_DATA => Self::KeyData(payload.to_vec()),
            NL80211_ATTR_KEY_IDX => Self::KeyIdx(
                parse_u8(payload)
                    .context("Invalid NL80211_ATTR_KEY_IDX")?,
            ),
            NL80211_ATTR_KEY_CIPHER => Self::KeyCipher(
                parse_u32(payload)
                    .context("Invalid NL80211_ATTR_KEY_CIPHER")?,
            ),
            NL80211_ATTR_KEY_SEQ => Self::KeySeq(payload.to_vec()),
            NL80211_ATTR_WIPHY_FREQ => Self::WiphyFreq(
                parse_u32(payload)
                    .context("Invalid NL80211_ATTR_WIPHY_FREQ")?,
            ),
            NL80211_ATTR_IE => Self::Ie(payload.to_vec()),
            NL80211_ATTR_GENERATION => Self::Generation(
                parse_u32(payload)
                    .context("Invalid NL80211_ATTR_GENERATION")?,
            ),
            NL80211_ATTR_BSS => {
                let mut attrs = Vec::new();
                for nla in NlasIterator::new(payload) {
                    let error_msg =
                        "Failed to parse NL80211_ATTR_BSS attribute";
                    let nla = &nla.context(error_msg)?;
                    attrs.push(
                        Nl80211BssAttr::parse(nla).context(error_msg)?,
                    );
                }
                Self::Bss(attrs)
            }
            NL80211_ATTR_SSID => Self::Ssid(payload.to_vec()),
            NL80211_ATTR_AUTH_TYPE => Self::AuthType(
                parse_u32(payload)
                    .context("Invalid NL80211_ATTR_AUTH_TYPE")?,
            ),
            NL80211_ATTR_REASON_CODE => Self::ReasonCode(
                parse_u16(payload)
                    .context("Invalid NL80211_ATTR_REASON_CODE")?,
            ),
            NL80211_ATTR_STATUS_CODE => Self::StatusCode(
                parse_u16(payload)
                    .context("Invalid NL80211_ATTR_STATUS_CODE")?,
            ),
            _ => Self::Other(
                DefaultNla::parse(buf)
                    .context("invalid NLA (unknown kind)")?,
            ),
        })
    }
}
