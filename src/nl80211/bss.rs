// SPDX-License-Identifier: MIT

use netlink_packet_core::{
    parse_u32, DecodeError, DefaultNla, ErrorContext, Nla, NlaBuffer,
    Parseable,
};

use crate::bytes::{write_i32, write_u32};

const ETH_ALEN: usize = 6;

const NL80211_BSS_BSSID: u16 = 1;
const NL80211_BSS_FREQUENCY: u16 = 2;
const NL80211_BSS_INFORMATION_ELEMENTS: u16 = 6;
const NL80211_BSS_SIGNAL_MBM: u16 = 7;
const NL80211_BSS_STATUS: u16 = 9;

/// Subset of the nested NL80211_ATTR_BSS payload a supplicant cares
/// about. Everything else is carried opaquely.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Nl80211BssAttr {
    Bssid([u8; ETH_ALEN]),
    /// Frequency in MHz
    Frequency(u32),
    InformationElements(Vec<u8>),
    /// Signal strength of probe response/beacon in mBm (100 * dBm)
    SignalMbm(i32),
    /// NL80211_BSS_STATUS_* when the kernel considers this BSS in use
    Status(u32),
    Other(DefaultNla),
}

impl Nla for Nl80211BssAttr {
    fn value_len(&self) -> usize {
        match self {
            Self::Bssid(_) => ETH_ALEN,
            Self::Frequency(_) | Self::SignalMbm(_) | Self::Status(_) => 4,
            Self::InformationElements(v) => v.len(),
            Self::Other(attr) => attr.value_len(),
        }
    }

    fn kind(&self) -> u16 {
        match self {
            Self::Bssid(_) => NL80211_BSS_BSSID,
            Self::Frequency(_) => NL80211_BSS_FREQUENCY,
            Self::InformationElements(_) => {
                NL80211_BSS_INFORMATION_ELEMENTS
            }
            Self::SignalMbm(_) => NL80211_BSS_SIGNAL_MBM,
            Self::Status(_) => NL80211_BSS_STATUS,
            Self::Other(attr) => attr.kind(),
        }
    }

    fn emit_value(&self, buffer: &mut [u8]) {
        match self {
            Self::Bssid(mac) => buffer[..ETH_ALEN].copy_from_slice(mac),
            Self::Frequency(d) | Self::Status(d) => write_u32(buffer, *d),
            Self::SignalMbm(d) => write_i32(buffer, *d),
            Self::InformationElements(v) => {
                buffer[..v.len()].copy_from_slice(v)
            }
            Self::Other(attr) => attr.emit_value(buffer),
        }
    }
}

impl<'a, T: AsRef<[u8]> + ?Sized> Parseable<NlaBuffer<&'a T>>
    for Nl80211BssAttr
{
    fn parse(buf: &NlaBuffer<&'a T>) -> Result<Self, DecodeError> {
        let payload = buf.value();
        Ok(match buf.kind() {
            NL80211_BSS_BSSID => {
                let mac: [u8; ETH_ALEN] =
                    payload.try_into().map_err(|_| {
                        DecodeError::from(format!(
                            "Invalid NL80211_BSS_BSSID {payload:?}"
                        ))
                    })?;
                Self::Bssid(mac)
            }
            NL80211_BSS_FREQUENCY => Self::Frequency(
                parse_u32(payload)
                    .context("Invalid NL80211_BSS_FREQUENCY")?,
            ),
            NL80211_BSS_INFORMATION_ELEMENTS => {
                Self::InformationElements(payload.to_vec())
            }
            NL80211_BSS_SIGNAL_MBM => {
                let err_msg = format!(
                    "Invalid NL80211_BSS_SIGNAL_MBM value {payload:?}"
                );
                Self::SignalMbm(i32::from_ne_bytes(
                    payload.try_into().map_err(|_| {
                        DecodeError::from(err_msg)
                    })?,
                ))
            }
            NL80211_BSS_STATUS => Self::Status(
                parse_u32(payload)
                    .context("Invalid NL80211_BSS_STATUS")?,
            ),
            _ => Self::Other(
                DefaultNla::parse(buf)
                    .context("invalid NLA (unknown kind)")?,
            ),
        })
    }
}
