// SPDX-License-Identifier: MIT

//! Wire codec for the control socket: a simplified request/reply
//! protocol shaped after generic netlink. Each message is a 4-byte
//! little-endian total length, a 4-byte command, and a sequence of
//! `{u16 len, u16 key, payload}` attributes padded to 4-byte
//! alignment. Attribute integers are host byte order; both ends are
//! always the same host.

use anyhow::Context;
use byteorder::{ByteOrder, LittleEndian, NativeEndian};
use netlink_packet_utils::DecodeError;

use super::proto::{
    ATTR_BSSID, ATTR_FREQ, ATTR_IFI, ATTR_NAME, ATTR_PRIO, ATTR_PSK,
    ATTR_SCAN, ATTR_SIGNAL, ATTR_SSID, ATTR_STATE, ATTR_TYPE,
};

pub const MSG_HDR_LEN: usize = 8;
pub const ATTR_HDR_LEN: usize = 4;

/// Requests are tiny; replies carry at most the scan table.
pub const MAX_MSG_SIZE: usize = 16 * 1024;

const fn align4(len: usize) -> usize {
    (len + 3) & !3
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum CtrlAttr {
    Ssid(Vec<u8>),
    Psk(Vec<u8>),
    Prio,
    Signal(i32),
    Freq(i32),
    Type(u32),
    Bssid([u8; 6]),
    Scan(Vec<CtrlAttr>),
    IfIndex(i32),
    Name(String),
    State(u32),
    Other(u16, Vec<u8>),
}

impl CtrlAttr {
    pub fn kind(&self) -> u16 {
        match self {
            Self::Ssid(_) => ATTR_SSID,
            Self::Psk(_) => ATTR_PSK,
            Self::Prio => ATTR_PRIO,
            Self::Signal(_) => ATTR_SIGNAL,
            Self::Freq(_) => ATTR_FREQ,
            Self::Type(_) => ATTR_TYPE,
            Self::Bssid(_) => ATTR_BSSID,
            Self::Scan(_) => ATTR_SCAN,
            Self::IfIndex(_) => ATTR_IFI,
            Self::Name(_) => ATTR_NAME,
            Self::State(_) => ATTR_STATE,
            Self::Other(key, _) => *key,
        }
    }

    fn value_len(&self) -> usize {
        match self {
            Self::Ssid(v) | Self::Psk(v) | Self::Other(_, v) => v.len(),
            Self::Prio => 0,
            Self::Signal(_) | Self::Freq(_) | Self::Type(_) => 4,
            Self::IfIndex(_) | Self::State(_) => 4,
            Self::Bssid(_) => 6,
            Self::Name(s) => s.len() + 1,
            Self::Scan(attrs) => {
                attrs.iter().map(|a| a.buffer_len()).sum()
            }
        }
    }

    /// Space the attribute occupies in a message, padding included.
    pub fn buffer_len(&self) -> usize {
        align4(ATTR_HDR_LEN + self.value_len())
    }

    pub fn emit(&self, buffer: &mut [u8]) {
        let vlen = self.value_len();
        LittleEndian::write_u16(
            &mut buffer[0..2],
            (ATTR_HDR_LEN + vlen) as u16,
        );
        LittleEndian::write_u16(&mut buffer[2..4], self.kind());

        let value = &mut buffer[ATTR_HDR_LEN..ATTR_HDR_LEN + vlen];
        match self {
            Self::Ssid(v) | Self::Psk(v) | Self::Other(_, v) => {
                value.copy_from_slice(v)
            }
            Self::Prio => (),
            Self::Signal(v) | Self::Freq(v) | Self::IfIndex(v) => {
                NativeEndian::write_i32(value, *v)
            }
            Self::Type(v) | Self::State(v) => {
                NativeEndian::write_u32(value, *v)
            }
            Self::Bssid(mac) => value.copy_from_slice(mac),
            Self::Name(s) => {
                value[..s.len()].copy_from_slice(s.as_bytes());
                value[s.len()] = 0;
            }
            Self::Scan(attrs) => emit_attrs(attrs, value),
        }
        for pad in &mut buffer[ATTR_HDR_LEN + vlen..align4(ATTR_HDR_LEN + vlen)]
        {
            *pad = 0;
        }
    }

    pub fn parse(key: u16, payload: &[u8]) -> Result<Self, DecodeError> {
        Ok(match key {
            ATTR_SSID => Self::Ssid(payload.to_vec()),
            ATTR_PSK => Self::Psk(payload.to_vec()),
            ATTR_PRIO => Self::Prio,
            ATTR_SIGNAL => Self::Signal(parse_i32(payload, "ATTR_SIGNAL")?),
            ATTR_FREQ => Self::Freq(parse_i32(payload, "ATTR_FREQ")?),
            ATTR_TYPE => Self::Type(parse_u32(payload, "ATTR_TYPE")?),
            ATTR_BSSID => {
                let mac: [u8; 6] = payload
                    .try_into()
                    .map_err(|_| DecodeError::from("Invalid ATTR_BSSID"))?;
                Self::Bssid(mac)
            }
            ATTR_SCAN => Self::Scan(parse_attrs(payload)?),
            ATTR_IFI => Self::IfIndex(parse_i32(payload, "ATTR_IFI")?),
            ATTR_NAME => {
                let s = payload
                    .split(|b| *b == 0)
                    .next()
                    .unwrap_or_default();
                Self::Name(
                    std::str::from_utf8(s)
                        .context("ATTR_NAME is not valid UTF-8")?
                        .to_string(),
                )
            }
            ATTR_STATE => Self::State(parse_u32(payload, "ATTR_STATE")?),
            _ => Self::Other(key, payload.to_vec()),
        })
    }
}

fn parse_i32(payload: &[u8], what: &str) -> Result<i32, DecodeError> {
    if payload.len() != 4 {
        return Err(format!("Invalid {what} length {}", payload.len()).into());
    }
    Ok(NativeEndian::read_i32(payload))
}

fn parse_u32(payload: &[u8], what: &str) -> Result<u32, DecodeError> {
    parse_i32(payload, what).map(|v| v as u32)
}

fn emit_attrs(attrs: &[CtrlAttr], buffer: &mut [u8]) {
    let mut offset = 0;
    for attr in attrs {
        attr.emit(&mut buffer[offset..offset + attr.buffer_len()]);
        offset += attr.buffer_len();
    }
}

fn parse_attrs(buffer: &[u8]) -> Result<Vec<CtrlAttr>, DecodeError> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset + ATTR_HDR_LEN <= buffer.len() {
        let alen = LittleEndian::read_u16(&buffer[offset..]) as usize;
        let key = LittleEndian::read_u16(&buffer[offset + 2..]);
        if alen < ATTR_HDR_LEN || offset + alen > buffer.len() {
            return Err(format!(
                "Invalid attribute length {alen} at offset {offset}"
            )
            .into());
        }
        let payload = &buffer[offset + ATTR_HDR_LEN..offset + alen];
        attrs.push(CtrlAttr::parse(key, payload)?);
        offset += align4(alen);
    }
    Ok(attrs)
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CtrlMessage {
    pub cmd: i32,
    pub attrs: Vec<CtrlAttr>,
}

impl CtrlMessage {
    pub fn new(cmd: i32) -> Self {
        CtrlMessage {
            cmd,
            attrs: Vec::new(),
        }
    }

    pub fn buffer_len(&self) -> usize {
        MSG_HDR_LEN + self.attrs.iter().map(|a| a.buffer_len()).sum::<usize>()
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.buffer_len()];
        let len = buf.len() as u32;
        LittleEndian::write_u32(&mut buf[0..4], len);
        LittleEndian::write_i32(&mut buf[4..8], self.cmd);
        emit_attrs(&self.attrs, &mut buf[MSG_HDR_LEN..]);
        buf
    }

    /// Parses one complete frame, header included.
    pub fn parse(buffer: &[u8]) -> Result<Self, DecodeError> {
        if buffer.len() < MSG_HDR_LEN {
            return Err("Message shorter than its header".into());
        }
        let len = LittleEndian::read_u32(&buffer[0..4]) as usize;
        if len != buffer.len() {
            return Err(format!(
                "Message length field {len} does not match frame size {}",
                buffer.len()
            )
            .into());
        }
        let cmd = LittleEndian::read_i32(&buffer[4..8]);
        let attrs = parse_attrs(&buffer[MSG_HDR_LEN..])?;
        Ok(CtrlMessage { cmd, attrs })
    }

    pub fn get_ssid(&self) -> Option<&[u8]> {
        self.attrs.iter().find_map(|a| match a {
            CtrlAttr::Ssid(v) => Some(v.as_slice()),
            _ => None,
        })
    }

    pub fn get_psk(&self) -> Option<&[u8]> {
        self.attrs.iter().find_map(|a| match a {
            CtrlAttr::Psk(v) => Some(v.as_slice()),
            _ => None,
        })
    }
}

/// Reassembles length-prefixed frames from a byte stream, carrying
/// partial reads across calls the way the original shift-buffer did.
#[derive(Debug, Default)]
pub struct CtrlBuf {
    buf: Vec<u8>,
}

impl CtrlBuf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Pops the next complete message, or None if more bytes are
    /// needed. A malformed or oversized frame poisons the stream and
    /// the connection should be dropped.
    pub fn next_message(
        &mut self,
    ) -> Result<Option<CtrlMessage>, DecodeError> {
        if self.buf.len() < MSG_HDR_LEN {
            return Ok(None);
        }
        let len = LittleEndian::read_u32(&self.buf[0..4]) as usize;
        if len < MSG_HDR_LEN || len > MAX_MSG_SIZE {
            return Err(format!("Bad message length {len}").into());
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..len).collect();
        CtrlMessage::parse(&frame).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::proto::*;

    fn roundtrip(msg: &CtrlMessage) {
        let raw = msg.emit();
        assert_eq!(&CtrlMessage::parse(&raw).unwrap(), msg);
    }

    #[test]
    fn empty_request_wire_format() {
        let msg = CtrlMessage::new(CMD_WI_SCAN);
        let raw = msg.emit();
        assert_eq!(
            raw,
            vec![0x08, 0x00, 0x00, 0x00, 0x02, 0x00, 0x49, 0x57]
        );
        roundtrip(&msg);
    }

    #[test]
    fn attrs_are_padded_to_four_bytes() {
        let mut msg = CtrlMessage::new(CMD_WI_CONNECT);
        msg.attrs.push(CtrlAttr::Ssid(b"Test!".to_vec()));
        let raw = msg.emit();
        // 8 header + align4(4 + 5) = 20 total
        assert_eq!(raw.len(), 20);
        assert_eq!(raw[8], 9); // attr len excludes padding
        assert_eq!(&raw[12..17], b"Test!");
        assert_eq!(&raw[17..20], &[0, 0, 0]);
        roundtrip(&msg);
    }

    #[test]
    fn status_reply_roundtrip() {
        let mut msg = CtrlMessage::new(0);
        msg.attrs.push(CtrlAttr::IfIndex(3));
        msg.attrs.push(CtrlAttr::Name("wlan0".into()));
        msg.attrs.push(CtrlAttr::State(WS_CONNECTED));
        msg.attrs.push(CtrlAttr::Ssid(b"Blackhole".to_vec()));
        msg.attrs.push(CtrlAttr::Bssid([2, 0, 0, 0, 0, 1]));
        msg.attrs.push(CtrlAttr::Freq(2437));
        msg.attrs.push(CtrlAttr::Scan(vec![
            CtrlAttr::Freq(2437),
            CtrlAttr::Type(0x3F),
            CtrlAttr::Signal(-4000),
            CtrlAttr::Bssid([2, 0, 0, 0, 0, 1]),
            CtrlAttr::Ssid(b"Blackhole".to_vec()),
            CtrlAttr::Prio,
        ]));
        roundtrip(&msg);
    }

    #[test]
    fn ssid_with_nul_and_space_bytes_roundtrips() {
        let mut msg = CtrlMessage::new(CMD_WI_FORGET);
        msg.attrs
            .push(CtrlAttr::Ssid(vec![0x00, 0x20, 0x5C, 0xFF, 0x01]));
        roundtrip(&msg);
    }

    #[test]
    fn unknown_attribute_is_kept_opaque() {
        let mut msg = CtrlMessage::new(0);
        msg.attrs.push(CtrlAttr::Other(42, vec![1, 2, 3]));
        msg.attrs.push(CtrlAttr::IfIndex(1));
        let raw = msg.emit();
        let parsed = CtrlMessage::parse(&raw).unwrap();
        assert_eq!(parsed.attrs[0], CtrlAttr::Other(42, vec![1, 2, 3]));
        assert_eq!(parsed.attrs[1], CtrlAttr::IfIndex(1));
    }

    #[test]
    fn truncated_attribute_is_rejected() {
        let mut raw = CtrlMessage::new(0).emit();
        raw.extend_from_slice(&[12, 0, 1, 0, 0xAA]); // claims 12, has 5
        LittleEndian::write_u32(&mut raw[0..4], 13);
        assert!(CtrlMessage::parse(&raw).is_err());
    }

    #[test]
    fn stream_reassembly_across_partial_reads() {
        let mut msg1 = CtrlMessage::new(CMD_WI_CONNECT);
        msg1.attrs.push(CtrlAttr::Ssid(b"Home".to_vec()));
        let msg2 = CtrlMessage::new(CMD_WI_STATUS);

        let mut bytes = msg1.emit();
        bytes.extend_from_slice(&msg2.emit());

        let mut rb = CtrlBuf::new();
        rb.push(&bytes[..5]);
        assert!(rb.next_message().unwrap().is_none());
        rb.push(&bytes[5..]);
        assert_eq!(rb.next_message().unwrap().unwrap(), msg1);
        assert_eq!(rb.next_message().unwrap().unwrap(), msg2);
        assert!(rb.next_message().unwrap().is_none());
    }

    #[test]
    fn oversized_frame_poisons_the_stream() {
        let mut rb = CtrlBuf::new();
        let mut hdr = [0u8; 8];
        LittleEndian::write_u32(&mut hdr[0..4], (MAX_MSG_SIZE + 1) as u32);
        rb.push(&hdr);
        assert!(rb.next_message().is_err());
    }
}
