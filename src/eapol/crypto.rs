// SPDX-License-Identifier: MIT

//! Key derivation and frame protection glue for the 4-way handshake.
//! The primitives come from the RustCrypto crates; this module owns
//! the 802.11 specifics: the PRF expansion, PTK layout, truncated
//! HMAC-SHA1 MICs and the RFC 3394 unwrap of EAPOL key data.

use aes_kw::KekAes128;
use hmac::{Hmac, Mac};
use sha1::Sha1;

type HmacSha1 = Hmac<Sha1>;

pub const PMK_LEN: usize = 32;
pub const MIC_LEN: usize = 16;

const PTK_LABEL: &str = "Pairwise key expansion";

/// Pairwise key hierarchy: confirmation, encryption and temporal keys,
/// in PRF output order.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Ptk {
    pub kck: [u8; 16],
    pub kek: [u8; 16],
    pub tk: [u8; 16],
}

impl Ptk {
    pub fn wipe(&mut self) {
        self.kck.fill(0);
        self.kek.fill(0);
        self.tk.fill(0);
    }
}

fn hmac_sha1(key: &[u8], parts: &[&[u8]]) -> [u8; 20] {
    let mut mac = HmacSha1::new_from_slice(key)
        .expect("HMAC accepts keys of any length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// IEEE 802.11 PRF: HMAC-SHA1(key, label || 0x00 || data || counter)
/// concatenated until `out` is full.
fn prf(key: &[u8], label: &str, data: &[u8], out: &mut [u8]) {
    for (counter, chunk) in out.chunks_mut(20).enumerate() {
        let digest = hmac_sha1(
            key,
            &[label.as_bytes(), &[0u8], data, &[counter as u8]],
        );
        chunk.copy_from_slice(&digest[..chunk.len()]);
    }
}

/// PTK derivation over the sorted MAC pair and sorted nonce pair.
/// Only the first 48 of the 60 PRF-480 bytes carry keys; the tail is
/// discarded and the scratch buffer wiped.
pub fn derive_ptk(
    pmk: &[u8; PMK_LEN],
    mac_a: &[u8; 6],
    mac_b: &[u8; 6],
    nonce_a: &[u8; 32],
    nonce_b: &[u8; 32],
) -> Ptk {
    let (mac1, mac2) = if mac_a < mac_b {
        (mac_a, mac_b)
    } else {
        (mac_b, mac_a)
    };
    let (nonce1, nonce2) = if nonce_a < nonce_b {
        (nonce_a, nonce_b)
    } else {
        (nonce_b, nonce_a)
    };

    let mut data = [0u8; 76];
    data[0..6].copy_from_slice(mac1);
    data[6..12].copy_from_slice(mac2);
    data[12..44].copy_from_slice(nonce1);
    data[44..76].copy_from_slice(nonce2);

    let mut key = [0u8; 60];
    prf(pmk, PTK_LABEL, &data, &mut key);

    let mut ptk = Ptk::default();
    ptk.kck.copy_from_slice(&key[0..16]);
    ptk.kek.copy_from_slice(&key[16..32]);
    ptk.tk.copy_from_slice(&key[32..48]);

    key.fill(0);
    ptk
}

/// MIC over a whole frame (MIC field already zeroed), truncated to 16
/// bytes per the SHA1 descriptor version.
pub fn make_mic(kck: &[u8; 16], frame: &[u8]) -> [u8; MIC_LEN] {
    let digest = hmac_sha1(kck, &[frame]);
    let mut mic = [0u8; MIC_LEN];
    mic.copy_from_slice(&digest[..MIC_LEN]);
    mic
}

/// Verification avoids short-circuiting on the first differing byte.
pub fn check_mic(
    kck: &[u8; 16],
    frame_zeroed: &[u8],
    mic: &[u8; MIC_LEN],
) -> bool {
    let expect = make_mic(kck, frame_zeroed);
    expect
        .iter()
        .zip(mic.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// AES-128 key unwrap of the EAPOL key data. The output is 8 bytes
/// shorter than the input; integrity failure means a corrupt or
/// foreign frame and aborts the connection at the caller.
pub fn unwrap_key(kek: &[u8; 16], wrapped: &[u8]) -> Option<Vec<u8>> {
    if wrapped.len() < 16 || wrapped.len() % 8 != 0 {
        return None;
    }
    let kek = KekAes128::from(*kek);
    let mut out = vec![0u8; wrapped.len() - 8];
    kek.unwrap(wrapped, &mut out).ok()?;
    Some(out)
}

/// Passphrase to PSK mapping: PBKDF2-HMAC-SHA1 with the SSID as salt
/// and 4096 rounds. The daemon itself only ever receives ready PSKs;
/// this lives here for the client side and the tests.
pub fn psk_from_passphrase(passphrase: &str, ssid: &[u8]) -> [u8; PMK_LEN] {
    let mut psk = [0u8; PMK_LEN];
    pbkdf2::pbkdf2_hmac::<Sha1>(
        passphrase.as_bytes(),
        ssid,
        4096,
        &mut psk,
    );
    psk
}

#[cfg(test)]
mod tests {
    use super::*;

    // IEEE Std 802.11i, Annex H.4.1 passphrase mapping vector.
    #[test]
    fn psk_mapping_known_vector() {
        let psk = psk_from_passphrase("password", b"IEEE");
        let expect = [
            0xf4, 0x2c, 0x6f, 0xc5, 0x2d, 0xf0, 0xeb, 0xef, 0x9e, 0xbb,
            0x4b, 0x90, 0xb3, 0x8a, 0x5f, 0x90, 0x2e, 0x83, 0xfe, 0x1b,
            0x13, 0x5a, 0x70, 0xe2, 0x3a, 0xed, 0x76, 0x2e, 0x97, 0x10,
            0xa1, 0x2e,
        ];
        assert_eq!(psk, expect);
    }

    // IEEE 802.11i Annex H.3 PRF test case 1, first 24 bytes.
    #[test]
    fn prf_known_vector() {
        let key = [0x0b; 20];
        let mut out = [0u8; 24];
        prf(&key, "prefix", b"Hi There", &mut out);
        let expect = [
            0xbc, 0xd4, 0xc6, 0x50, 0xb3, 0x0b, 0x96, 0x84, 0x95, 0x18,
            0x29, 0xe0, 0xd7, 0x5f, 0x9d, 0x54, 0xb8, 0x62, 0x17, 0x5e,
            0xd9, 0xf0, 0x06, 0x06,
        ];
        assert_eq!(out, expect);
    }

    // RFC 3394 section 4.1: wrap 128 bits with a 128-bit KEK.
    #[test]
    fn key_unwrap_rfc3394_vector() {
        let kek: [u8; 16] = [
            0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09,
            0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
        ];
        let wrapped = [
            0x1F, 0xA6, 0x8B, 0x0A, 0x81, 0x12, 0xB4, 0x47, 0xAE, 0xF3,
            0x4B, 0xD8, 0xFB, 0x5A, 0x7B, 0x82, 0x9D, 0x3E, 0x86, 0x23,
            0x71, 0xD2, 0xCF, 0xE5,
        ];
        let plain = [
            0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99,
            0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF,
        ];
        assert_eq!(unwrap_key(&kek, &wrapped).unwrap(), plain);

        // flip one ciphertext bit: integrity check must fail
        let mut bad = wrapped;
        bad[5] ^= 1;
        assert_eq!(unwrap_key(&kek, &bad), None);
    }

    #[test]
    fn unwrap_rejects_impossible_lengths() {
        let kek = [0u8; 16];
        assert_eq!(unwrap_key(&kek, &[0u8; 8]), None);
        assert_eq!(unwrap_key(&kek, &[0u8; 17]), None);
        assert_eq!(unwrap_key(&kek, &[]), None);
    }

    #[test]
    fn ptk_derivation_is_order_independent() {
        let pmk = [0x42u8; 32];
        let a = derive_ptk(
            &pmk,
            &[2, 0, 0, 0, 0, 1],
            &[2, 0, 0, 0, 0, 9],
            &[0x01; 32],
            &[0x02; 32],
        );
        let b = derive_ptk(
            &pmk,
            &[2, 0, 0, 0, 0, 9],
            &[2, 0, 0, 0, 0, 1],
            &[0x02; 32],
            &[0x01; 32],
        );
        assert_eq!(a, b);
        assert_ne!(a.kck, a.kek);
        assert_ne!(a.kek, a.tk);
    }

    #[test]
    fn mic_roundtrip_and_tamper_detection() {
        let kck = [0x11u8; 16];
        let frame = vec![0xA5u8; 99];
        let mic = make_mic(&kck, &frame);
        assert!(check_mic(&kck, &frame, &mic));

        let mut tampered = frame.clone();
        tampered[50] ^= 1;
        assert!(!check_mic(&kck, &tampered, &mic));

        let mut bad_mic = mic;
        bad_mic[0] ^= 1;
        assert!(!check_mic(&kck, &frame, &bad_mic));
    }
}
