// SPDX-License-Identifier: MIT

//! Key data elements carried inside EAPOL packet 3/4 and group rekey
//! frames. The unwrapped key data is a walk of `{0xDD, len, OUI,
//! type, data}` records; the GTK KDE is the only one we consume.

const KDE_MAGIC: u8 = 0xDD;
const KDE_HDR_LEN: usize = 6;

/// OUI 00:0F:AC, data type 1. Ref. IEEE 802.11-2012 Table 11-6.
const KDE_TYPE_GTK: [u8; 4] = [0x00, 0x0F, 0xAC, 0x01];

#[derive(Debug, PartialEq, Eq)]
pub struct GtkKde {
    pub index: u8,
    pub key: Vec<u8>,
}

/// Finds and extracts the GTK from unwrapped key data. The key is 16
/// bytes for CCMP and 32 for TKIP; for TKIP the two 8-byte Michael
/// MIC key halves arrive swapped relative to how the kernel wants
/// them, so they are swapped back here.
pub fn find_gtk(buf: &[u8], tkip_group: bool) -> Option<GtkKde> {
    let expect_len = if tkip_group { 32 } else { 16 };

    let mut offset = 0;
    while offset + KDE_HDR_LEN <= buf.len() {
        let magic = buf[offset];
        let len = buf[offset + 1] as usize;
        let next = offset + 2 + len;
        if next > buf.len() {
            break;
        }
        let body = &buf[offset + 2..next];
        offset = next;

        if magic != KDE_MAGIC || body.len() < 4 {
            continue;
        }
        if body[0..4] != KDE_TYPE_GTK {
            continue;
        }
        let data = &body[4..];
        // flags byte + reserved byte, then the key itself
        if data.len() < 2 + 16 {
            continue;
        }
        let index = data[0] & 0x3;
        if index == 0 {
            // key index zero is the pairwise slot, never a GTK
            return None;
        }
        let key = &data[2..];
        if key.len() != expect_len {
            return None;
        }

        let mut out = key[..16].to_vec();
        if tkip_group {
            out.extend_from_slice(&key[24..32]);
            out.extend_from_slice(&key[16..24]);
        }
        return Some(GtkKde { index, key: out });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gtk_kde(index: u8, key: &[u8]) -> Vec<u8> {
        let mut kde = vec![KDE_MAGIC, (4 + 2 + key.len()) as u8];
        kde.extend_from_slice(&KDE_TYPE_GTK);
        kde.push(index);
        kde.push(0);
        kde.extend_from_slice(key);
        kde
    }

    #[test]
    fn extracts_ccmp_gtk() {
        let key: Vec<u8> = (0..16).collect();
        let mut buf = vec![KDE_MAGIC, 0x04, 0x00, 0x0F, 0xAC, 0x03, 0x00, 0x00];
        buf.extend_from_slice(&gtk_kde(2, &key));
        let gtk = find_gtk(&buf, false).unwrap();
        assert_eq!(gtk.index, 2);
        assert_eq!(gtk.key, key);
    }

    #[test]
    fn tkip_gtk_swaps_mic_halves() {
        let mut key = vec![0u8; 32];
        for (i, b) in key.iter_mut().enumerate() {
            *b = i as u8;
        }
        let gtk = find_gtk(&gtk_kde(1, &key), true).unwrap();
        assert_eq!(&gtk.key[0..16], &key[0..16]);
        assert_eq!(&gtk.key[16..24], &key[24..32]);
        assert_eq!(&gtk.key[24..32], &key[16..24]);
    }

    #[test]
    fn zero_index_is_rejected() {
        let key = [0xABu8; 16];
        assert_eq!(find_gtk(&gtk_kde(0, &key), false), None);
    }

    #[test]
    fn wrong_key_length_is_rejected() {
        let key = [0xABu8; 24];
        assert_eq!(find_gtk(&gtk_kde(1, &key), false), None);
        assert_eq!(find_gtk(&gtk_kde(1, &key), true), None);
    }

    #[test]
    fn walk_is_total_over_garbage() {
        assert_eq!(find_gtk(&[], false), None);
        assert_eq!(find_gtk(&[0xDD], false), None);
        assert_eq!(find_gtk(&[0xDD, 0xFF, 0x00], false), None);
        // non-GTK vendor KDEs are skipped, not fatal
        let mut buf = vec![0xDD, 0x06, 0x00, 0x50, 0xF2, 0x01, 0x00, 0x00];
        buf.extend_from_slice(&gtk_kde(3, &[0x55u8; 16]));
        assert_eq!(find_gtk(&buf, false).unwrap().index, 3);
    }
}
