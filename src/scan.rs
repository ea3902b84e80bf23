// SPDX-License-Identifier: MIT

//! Bounded table of BSSes seen in the latest scan cycle. Entries are
//! keyed by BSSID; a slot with `freq == 0` is free. Between scans the
//! table is cleared wholesale, so nothing here ever ages gradually.

use std::cmp::Reverse;

use crate::config::PskStore;

pub const NSCANS: usize = 64;

bitflags::bitflags! {
    /// Security-relevant bits decoded from the station's IEs.
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct BssType: u32 {
        const WPA = 1 << 0;
        const WPS = 1 << 1;
        const RSN_P_TKIP = 1 << 2;
        const RSN_P_CCMP = 1 << 3;
        const RSN_G_TKIP = 1 << 4;
        const RSN_G_CCMP = 1 << 5;
        const RSN_PSK = 1 << 6;
        const _ = !0;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
    pub struct ScanFlags: u32 {
        /// We hold a PSK for this SSID.
        const PASS = 1 << 0;
        /// The advertised ciphers include a pair we implement.
        const GOOD = 1 << 1;
        /// Already attempted during the current connect round.
        const TRIED = 1 << 2;
    }
}

#[derive(Debug, Default, Clone)]
pub struct ScanEntry {
    pub bssid: [u8; 6],
    pub freq: u32,
    pub signal: i32,
    pub ssid: Vec<u8>,
    pub kind: BssType,
    pub flags: ScanFlags,
}

impl ScanEntry {
    pub fn is_free(&self) -> bool {
        self.freq == 0
    }

    /// CCMP pairwise is mandatory; a TKIP-only group cipher is
    /// tolerated, anything else is not ours to join.
    pub fn cipher_usable(&self) -> bool {
        self.kind.contains(BssType::RSN_PSK)
            && self.kind.contains(BssType::RSN_P_CCMP)
            && self
                .kind
                .intersects(BssType::RSN_G_CCMP | BssType::RSN_G_TKIP)
    }

    pub fn tkip_group(&self) -> bool {
        self.kind.contains(BssType::RSN_G_TKIP)
            && !self.kind.contains(BssType::RSN_G_CCMP)
    }
}

#[derive(Debug)]
pub struct ScanTable {
    entries: Vec<ScanEntry>,
}

impl Default for ScanTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanTable {
    pub fn new() -> Self {
        ScanTable {
            entries: vec![ScanEntry::default(); NSCANS],
        }
    }

    /// Starts a fresh scan cycle.
    pub fn clear(&mut self) {
        for e in &mut self.entries {
            *e = ScanEntry::default();
        }
    }

    /// Entry for this BSSID, allocating a free slot when the station
    /// is new. None when the table is full; the result is dropped,
    /// same as the original's fixed array.
    pub fn upsert(&mut self, bssid: [u8; 6]) -> Option<&mut ScanEntry> {
        if let Some(i) =
            self.entries.iter().position(|e| !e.is_free() && e.bssid == bssid)
        {
            return self.entries.get_mut(i);
        }
        let free = self.entries.iter().position(|e| e.is_free())?;
        let entry = &mut self.entries[free];
        entry.bssid = bssid;
        Some(entry)
    }

    pub fn occupied(&self) -> impl Iterator<Item = &ScanEntry> {
        self.entries.iter().filter(|e| !e.is_free())
    }

    /// Re-derives PASS and GOOD after a scan cycle completes.
    pub fn mark_flags(&mut self, store: &mut PskStore) {
        for e in self.entries.iter_mut().filter(|e| !e.is_free()) {
            e.flags.set(ScanFlags::PASS, store.got_psk_for(&e.ssid));
            e.flags.set(ScanFlags::GOOD, e.cipher_usable());
        }
    }

    /// Best untried candidate: PASS and GOOD, optionally restricted to
    /// one SSID, strongest signal first, lower frequency on ties.
    /// `require_pass` is lifted when the user just supplied a PSK that
    /// has not reached the store yet.
    pub fn select(
        &self,
        ssid: Option<&[u8]>,
        require_pass: bool,
    ) -> Option<&ScanEntry> {
        self.occupied()
            .filter(|e| {
                e.flags.contains(ScanFlags::GOOD)
                    && !e.flags.contains(ScanFlags::TRIED)
            })
            .filter(|e| {
                !require_pass || e.flags.contains(ScanFlags::PASS)
            })
            .filter(|e| ssid.is_none_or(|s| e.ssid == s))
            .max_by_key(|e| (e.signal, Reverse(e.freq)))
    }

    pub fn mark_tried(&mut self, bssid: &[u8; 6]) {
        for e in &mut self.entries {
            if !e.is_free() && e.bssid == *bssid {
                e.flags.insert(ScanFlags::TRIED);
            }
        }
    }

    pub fn clear_tried(&mut self) {
        for e in &mut self.entries {
            e.flags.remove(ScanFlags::TRIED);
        }
    }

    /// FORGET support: a dropped PSK takes PASS with it immediately.
    pub fn strip_pass(&mut self, ssid: &[u8]) {
        for e in &mut self.entries {
            if !e.is_free() && e.ssid == ssid {
                e.flags.remove(ScanFlags::PASS);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(
        table: &mut ScanTable,
        bssid: u8,
        freq: u32,
        signal: i32,
        ssid: &[u8],
        flags: ScanFlags,
    ) {
        let e = table.upsert([bssid, 0, 0, 0, 0, 0]).unwrap();
        e.freq = freq;
        e.signal = signal;
        e.ssid = ssid.to_vec();
        e.flags = flags;
    }

    #[test]
    fn selection_prefers_signal_then_lower_freq() {
        let mut t = ScanTable::new();
        let usable = ScanFlags::PASS | ScanFlags::GOOD;
        entry(&mut t, 1, 5180, -7000, b"Home", usable);
        entry(&mut t, 2, 2437, -4000, b"Home", usable);
        entry(&mut t, 3, 5745, -4000, b"Home", usable);
        entry(&mut t, 4, 2412, -3000, b"Other", ScanFlags::GOOD);

        // bssid 4 has the best signal but no PSK; 2 and 3 tie on
        // signal and the 2.4 GHz one wins.
        assert_eq!(t.select(None, true).unwrap().bssid[0], 2);
        assert_eq!(
            t.select(Some(b"Home".as_slice()), true).unwrap().bssid[0],
            2
        );

        t.mark_tried(&[2, 0, 0, 0, 0, 0]);
        assert_eq!(t.select(None, true).unwrap().bssid[0], 3);
        t.mark_tried(&[3, 0, 0, 0, 0, 0]);
        assert_eq!(t.select(None, true).unwrap().bssid[0], 1);
        t.mark_tried(&[1, 0, 0, 0, 0, 0]);
        assert!(t.select(None, true).is_none());

        t.clear_tried();
        assert_eq!(t.select(None, true).unwrap().bssid[0], 2);
    }

    #[test]
    fn upsert_reuses_slot_per_bssid() {
        let mut t = ScanTable::new();
        entry(&mut t, 9, 2412, -50, b"Net", ScanFlags::empty());
        let e = t.upsert([9, 0, 0, 0, 0, 0]).unwrap();
        assert_eq!(e.freq, 2412);
        assert_eq!(t.occupied().count(), 1);
    }

    #[test]
    fn table_capacity_is_bounded() {
        let mut t = ScanTable::new();
        for i in 0..NSCANS {
            entry(&mut t, i as u8, 2412, -50, b"N", ScanFlags::empty());
        }
        assert!(t.upsert([0xFF, 1, 2, 3, 4, 5]).is_none());
    }

    #[test]
    fn strip_pass_hits_matching_ssids_only() {
        let mut t = ScanTable::new();
        let usable = ScanFlags::PASS | ScanFlags::GOOD;
        entry(&mut t, 1, 2412, -50, b"Test", usable);
        entry(&mut t, 2, 2437, -60, b"Test", usable);
        entry(&mut t, 3, 2462, -60, b"Keep", usable);
        t.strip_pass(b"Test");
        assert!(t
            .occupied()
            .filter(|e| e.ssid == b"Test")
            .all(|e| !e.flags.contains(ScanFlags::PASS)));
        assert!(t
            .occupied()
            .any(|e| e.ssid == b"Keep" && e.flags.contains(ScanFlags::PASS)));
    }

    #[test]
    fn cipher_rules() {
        let mut e = ScanEntry {
            kind: BssType::RSN_PSK | BssType::RSN_P_CCMP | BssType::RSN_G_CCMP,
            ..Default::default()
        };
        assert!(e.cipher_usable());
        assert!(!e.tkip_group());

        e.kind = BssType::RSN_PSK | BssType::RSN_P_CCMP | BssType::RSN_G_TKIP;
        assert!(e.cipher_usable());
        assert!(e.tkip_group());

        // TKIP-only pairwise is not acceptable
        e.kind = BssType::RSN_PSK | BssType::RSN_P_TKIP | BssType::RSN_G_TKIP;
        assert!(!e.cipher_usable());

        // no PSK authentication, no dice
        e.kind = BssType::RSN_P_CCMP | BssType::RSN_G_CCMP;
        assert!(!e.cipher_usable());
    }
}
