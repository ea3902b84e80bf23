// SPDX-License-Identifier: MIT

//! EAPOL-Key frame codec. One fixed-layout header, big-endian fields,
//! optional key data payload. Only the RSN key descriptor (type 2) is
//! ever meaningful here; everything else gets ignored upstream.

use byteorder::{BigEndian, ByteOrder};
use netlink_packet_utils::DecodeError;

/// EAPOL packet type for key frames.
pub const EAPOL_KEY: u8 = 3;
/// RSN key descriptor type.
pub const EAPOL_KEY_RSN: u8 = 2;

/// Fixed part of the frame: 4-byte EAPOL header + 95-byte descriptor.
pub const KEY_FRAME_LEN: usize = 99;

const MIC_OFFSET: usize = 81;
pub const MIC_LEN: usize = 16;

bitflags::bitflags! {
    /// Key-information field, minus the 3-bit descriptor version that
    /// lives in the same u16.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct KeyInfo: u16 {
        const PAIRWISE = 1 << 3;
        const INSTALL = 1 << 6;
        const ACK = 1 << 7;
        const MIC = 1 << 8;
        const SECURE = 1 << 9;
        const ERROR = 1 << 10;
        const REQUEST = 1 << 11;
        const ENCRYPTED = 1 << 12;
        const _ = !0;
    }
}

impl KeyInfo {
    pub const VERSION_MASK: u16 = 0x0007;
    /// Descriptor version 2: HMAC-SHA1 MIC, AES key wrap.
    pub const VERSION_SHA1: u16 = 2;

    /// Bits that take part in the per-state pattern match.
    const PATTERN: KeyInfo = KeyInfo::PAIRWISE
        .union(KeyInfo::ACK)
        .union(KeyInfo::MIC)
        .union(KeyInfo::SECURE)
        .union(KeyInfo::ENCRYPTED);
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct KeyFrame {
    pub version: u8,
    pub desc_type: u8,
    pub keyinfo: u16,
    pub keylen: u16,
    /// Replay counters compare as big-endian integers, so they are
    /// held decoded.
    pub replay: u64,
    pub nonce: [u8; 32],
    pub iv: [u8; 16],
    pub rsc: [u8; 8],
    pub mic: [u8; MIC_LEN],
    pub payload: Vec<u8>,
}

impl Default for KeyFrame {
    fn default() -> Self {
        KeyFrame {
            version: 0,
            desc_type: EAPOL_KEY_RSN,
            keyinfo: 0,
            keylen: 0,
            replay: 0,
            nonce: [0; 32],
            iv: [0; 16],
            rsc: [0; 8],
            mic: [0; MIC_LEN],
            payload: Vec::new(),
        }
    }
}

impl KeyFrame {
    /// Checks the descriptor version and the expected flag pattern for
    /// the current handshake state, as one unit.
    pub fn has_pattern(&self, bits: KeyInfo) -> bool {
        if self.keyinfo & KeyInfo::VERSION_MASK != KeyInfo::VERSION_SHA1 {
            return false;
        }
        KeyInfo::from_bits_retain(self.keyinfo) & KeyInfo::PATTERN == bits
    }

    pub fn flags(&self) -> KeyInfo {
        KeyInfo::from_bits_retain(self.keyinfo)
    }

    pub fn buffer_len(&self) -> usize {
        KEY_FRAME_LEN + self.payload.len()
    }

    pub fn emit(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.buffer_len()];
        buf[0] = self.version;
        buf[1] = EAPOL_KEY;
        BigEndian::write_u16(&mut buf[2..4], (self.buffer_len() - 4) as u16);
        buf[4] = self.desc_type;
        BigEndian::write_u16(&mut buf[5..7], self.keyinfo);
        BigEndian::write_u16(&mut buf[7..9], self.keylen);
        BigEndian::write_u64(&mut buf[9..17], self.replay);
        buf[17..49].copy_from_slice(&self.nonce);
        buf[49..65].copy_from_slice(&self.iv);
        buf[65..73].copy_from_slice(&self.rsc);
        // bytes 73..81 are reserved and stay zero
        buf[MIC_OFFSET..MIC_OFFSET + MIC_LEN].copy_from_slice(&self.mic);
        BigEndian::write_u16(&mut buf[97..99], self.payload.len() as u16);
        buf[KEY_FRAME_LEN..].copy_from_slice(&self.payload);
        buf
    }

    /// Parses a received frame, enforcing the length consistency rules
    /// from the original: the EAPOL body length must match what was
    /// read, and the key data must fit inside it.
    pub fn parse(buf: &[u8]) -> Result<Self, DecodeError> {
        if buf.len() < KEY_FRAME_LEN {
            return Err("packet too short".into());
        }
        if buf[1] != EAPOL_KEY {
            return Err("not a KEY packet".into());
        }
        let paclen = BigEndian::read_u16(&buf[2..4]) as usize;
        if paclen + 4 != buf.len() {
            return Err("packet size mismatch".into());
        }
        let paylen = BigEndian::read_u16(&buf[97..99]) as usize;
        if KEY_FRAME_LEN + paylen > buf.len() {
            return Err("truncated payload".into());
        }

        let mut frame = KeyFrame {
            version: buf[0],
            desc_type: buf[4],
            keyinfo: BigEndian::read_u16(&buf[5..7]),
            keylen: BigEndian::read_u16(&buf[7..9]),
            replay: BigEndian::read_u64(&buf[9..17]),
            payload: buf[KEY_FRAME_LEN..KEY_FRAME_LEN + paylen].to_vec(),
            ..Default::default()
        };
        frame.nonce.copy_from_slice(&buf[17..49]);
        frame.iv.copy_from_slice(&buf[49..65]);
        frame.rsc.copy_from_slice(&buf[65..73]);
        frame.mic.copy_from_slice(&buf[MIC_OFFSET..MIC_OFFSET + MIC_LEN]);
        Ok(frame)
    }
}

/// Copy of the frame bytes with the MIC field zeroed, the form the
/// MIC itself is computed over.
pub fn mic_zeroed(buf: &[u8]) -> Vec<u8> {
    let mut copy = buf.to_vec();
    if copy.len() >= MIC_OFFSET + MIC_LEN {
        copy[MIC_OFFSET..MIC_OFFSET + MIC_LEN].fill(0);
    }
    copy
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> KeyFrame {
        KeyFrame {
            version: 2,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::PAIRWISE | KeyInfo::ACK).bits(),
            keylen: 16,
            replay: 7,
            nonce: [0x01; 32],
            payload: vec![0xDD, 0x00],
            ..Default::default()
        }
    }

    #[test]
    fn emit_parse_roundtrip() {
        let frame = sample();
        let raw = frame.emit();
        assert_eq!(raw.len(), 101);
        assert_eq!(BigEndian::read_u16(&raw[2..4]), 97); // paclen = len - 4
        assert_eq!(KeyFrame::parse(&raw).unwrap(), frame);
    }

    #[test]
    fn length_mismatch_is_rejected() {
        let mut raw = sample().emit();
        raw.push(0);
        assert!(KeyFrame::parse(&raw).is_err());

        let mut raw = sample().emit();
        BigEndian::write_u16(&mut raw[97..99], 100); // paylen > frame
        assert!(KeyFrame::parse(&raw).is_err());

        assert!(KeyFrame::parse(&[0u8; 40]).is_err());
    }

    #[test]
    fn non_key_packet_is_rejected() {
        let mut raw = sample().emit();
        raw[1] = 0; // EAP packet
        assert!(KeyFrame::parse(&raw).is_err());
    }

    #[test]
    fn pattern_matching_requires_descriptor_version_2() {
        let mut frame = sample();
        assert!(frame.has_pattern(KeyInfo::PAIRWISE | KeyInfo::ACK));
        assert!(!frame.has_pattern(KeyInfo::PAIRWISE));

        frame.keyinfo = (frame.keyinfo & !KeyInfo::VERSION_MASK) | 1;
        assert!(!frame.has_pattern(KeyInfo::PAIRWISE | KeyInfo::ACK));
    }

    #[test]
    fn mic_zeroed_clears_only_the_mic() {
        let mut frame = sample();
        frame.mic = [0xAA; 16];
        let raw = frame.emit();
        let zeroed = mic_zeroed(&raw);
        assert_eq!(&zeroed[81..97], &[0u8; 16]);
        assert_eq!(&zeroed[..81], &raw[..81]);
        assert_eq!(&zeroed[97..], &raw[97..]);
    }
}
