// SPDX-License-Identifier: MIT

//! RSN 4-way handshake over the EAPOL link. Once the radio-level
//! connection exists there is an ethernet-style link to the AP that
//! passes nothing but 0x888E key negotiation frames; the AP speaks
//! first and the outcome is an installed PTK and GTK.
//!
//! The machine here is deliberately free of sockets and netlink: it
//! consumes raw frames and emits [`EapolOp`] values for the daemon to
//! execute, which is also what makes the handshake testable byte for
//! byte.

pub mod crypto;
pub mod frame;
pub mod kde;

use log::warn;
use rand::rngs::OsRng;
use rand::RngCore;

use self::crypto::{check_mic, derive_ptk, make_mic, unwrap_key, Ptk};
use self::frame::{
    mic_zeroed, KeyFrame, KeyInfo, EAPOL_KEY_RSN, MIC_LEN,
};
use self::kde::find_gtk;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum EapolState {
    #[default]
    Idle,
    Waiting14,
    Waiting24,
    Waiting34,
    Negotiated,
}

/// Side effects requested by the machine, in execution order.
#[derive(Debug, PartialEq, Eq)]
pub enum EapolOp {
    /// Transmit a key frame to the AP.
    Send(Vec<u8>),
    InstallPtk {
        tk: [u8; 16],
    },
    InstallGtk {
        key: Vec<u8>,
        index: u8,
        rsc: [u8; 6],
    },
    /// The handshake reached NEGOTIATED.
    Connected,
}

/// How a frame that produced no ops should be treated.
#[derive(Debug, PartialEq, Eq)]
pub enum EapolFault {
    /// Log and drop; the handshake continues waiting.
    Ignore(&'static str),
    /// The connection attempt is dead.
    Abort(&'static str),
}

#[derive(Debug, Default)]
pub struct Supplicant {
    pub state: EapolState,
    sends_allowed: bool,
    version: u8,
    smac: [u8; 6],
    amac: [u8; 6],
    anonce: [u8; 32],
    snonce: [u8; 32],
    replay: u64,
    psk: [u8; 32],
    ptk: Ptk,
    ies: Vec<u8>,
    tkip_group: bool,
}

impl Supplicant {
    /// Arms the machine before ASSOCIATE goes out. Packet 1/4 may
    /// arrive before the association completes, in which case it is
    /// consumed and the reply held back until [`allow_sends`].
    ///
    /// [`allow_sends`]: Supplicant::allow_sends
    pub fn prime(
        &mut self,
        smac: [u8; 6],
        bssid: [u8; 6],
        psk: [u8; 32],
        ies: Vec<u8>,
        tkip_group: bool,
    ) {
        self.reset();
        self.smac = smac;
        self.amac = bssid;
        self.psk = psk;
        self.ies = ies;
        self.tkip_group = tkip_group;
        self.state = EapolState::Waiting14;
    }

    /// The link is associated; replies may flow. If packet 1/4 was
    /// already handled this releases the prepared 2/4 immediately.
    pub fn allow_sends(&mut self) -> Vec<EapolOp> {
        match self.state {
            EapolState::Waiting14 => {
                self.sends_allowed = true;
                Vec::new()
            }
            EapolState::Waiting24 => self.send_packet_2(),
            _ => Vec::new(),
        }
    }

    /// Full zeroization; used on connection teardown and rfkill.
    pub fn reset(&mut self) {
        self.cleanup_keys();
        self.ptk.wipe();
        self.psk.fill(0);
        self.amac.fill(0);
        self.ies.clear();
        self.version = 0;
        self.sends_allowed = false;
        self.state = EapolState::Idle;
    }

    /// Zeroization at NEGOTIATED: nonces and transient key material
    /// go away, KCK and KEK stay for group rekeys.
    fn cleanup_keys(&mut self) {
        self.anonce.fill(0);
        self.snonce.fill(0);
        self.ptk.tk.fill(0);
        self.psk.fill(0);
    }

    pub fn handle_frame(
        &mut self,
        buf: &[u8],
        src: [u8; 6],
    ) -> Result<Vec<EapolOp>, EapolFault> {
        if src != self.amac {
            return Err(EapolFault::Ignore("stray packet"));
        }
        let frame = match KeyFrame::parse(buf) {
            Ok(f) => f,
            Err(e) => {
                warn!("EAPOL: {e}");
                return Err(EapolFault::Ignore("malformed packet"));
            }
        };
        match self.state {
            EapolState::Waiting14 => self.recv_packet_1(&frame),
            EapolState::Waiting34 => self.recv_packet_3(buf, &frame),
            EapolState::Negotiated => self.recv_group_1(buf, &frame),
            _ => Err(EapolFault::Ignore("unexpected packet")),
        }
    }

    fn recv_packet_1(
        &mut self,
        frame: &KeyFrame,
    ) -> Result<Vec<EapolOp>, EapolFault> {
        if frame.desc_type != EAPOL_KEY_RSN {
            return Err(EapolFault::Abort("packet 1/4 wrong type"));
        }
        if !frame.has_pattern(KeyInfo::PAIRWISE | KeyInfo::ACK) {
            return Err(EapolFault::Ignore("packet 1/4 wrong bits"));
        }

        self.version = frame.version;
        self.anonce = frame.nonce;
        self.replay = frame.replay;

        OsRng.fill_bytes(&mut self.snonce);
        self.ptk = derive_ptk(
            &self.psk,
            &self.smac,
            &self.amac,
            &self.snonce,
            &self.anonce,
        );

        if self.sends_allowed {
            Ok(self.send_packet_2())
        } else {
            self.state = EapolState::Waiting24;
            Ok(Vec::new())
        }
    }

    /// Packet 2/4 replays the IEs sent with ASSOCIATE; some APs check
    /// them and drop the handshake when they are missing.
    fn send_packet_2(&mut self) -> Vec<EapolOp> {
        let frame = KeyFrame {
            version: self.version,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::PAIRWISE | KeyInfo::MIC).bits(),
            keylen: 16,
            replay: self.replay,
            nonce: self.snonce,
            payload: self.ies.clone(),
            ..Default::default()
        };
        self.state = EapolState::Waiting34;
        vec![EapolOp::Send(self.seal(frame))]
    }

    fn recv_packet_3(
        &mut self,
        buf: &[u8],
        frame: &KeyFrame,
    ) -> Result<Vec<EapolOp>, EapolFault> {
        if frame.has_pattern(KeyInfo::PAIRWISE | KeyInfo::ACK) {
            return Err(EapolFault::Abort("packet 1/4 resend detected"));
        }
        let expect = KeyInfo::PAIRWISE
            | KeyInfo::ACK
            | KeyInfo::MIC
            | KeyInfo::ENCRYPTED
            | KeyInfo::SECURE;
        if !frame.has_pattern(expect) {
            return Err(EapolFault::Abort("packet 3/4 wrong bits"));
        }
        if frame.nonce != self.anonce {
            return Err(EapolFault::Abort("packet 3/4 nonce changed"));
        }
        if frame.replay <= self.replay {
            return Err(EapolFault::Abort("packet 3/4 replay fail"));
        }
        if !check_mic(&self.ptk.kck, &mic_zeroed(buf), &frame.mic) {
            return Err(EapolFault::Abort("packet 3/4 bad MIC"));
        }

        let Some(data) = unwrap_key(&self.ptk.kek, &frame.payload) else {
            return Err(EapolFault::Abort("packet 3/4 cannot unwrap"));
        };
        let Some(gtk) = find_gtk(&data, self.tkip_group) else {
            return Err(EapolFault::Abort("packet 3/4 cannot fetch GTK"));
        };

        let mut rsc = [0u8; 6];
        rsc.copy_from_slice(&frame.rsc[..6]);
        self.replay = frame.replay;

        let mut ops = self.send_packet_4();
        ops.push(EapolOp::InstallPtk { tk: self.ptk.tk });
        ops.push(EapolOp::InstallGtk {
            key: gtk.key,
            index: gtk.index,
            rsc,
        });
        ops.push(EapolOp::Connected);

        self.state = EapolState::Negotiated;
        self.cleanup_keys();

        Ok(ops)
    }

    fn send_packet_4(&mut self) -> Vec<EapolOp> {
        let frame = KeyFrame {
            version: self.version,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::PAIRWISE | KeyInfo::MIC | KeyInfo::SECURE)
                    .bits(),
            replay: self.replay,
            ..Default::default()
        };
        vec![EapolOp::Send(self.seal(frame))]
    }

    /// Group rekeys arrive whenever the AP feels like it, typically
    /// once in a few hours, and are the only reason the raw socket
    /// stays open past the initial negotiation. Anything arriving in
    /// NEGOTIATED is treated as one and dropped when it is not.
    fn recv_group_1(
        &mut self,
        buf: &[u8],
        frame: &KeyFrame,
    ) -> Result<Vec<EapolOp>, EapolFault> {
        if frame.desc_type != EAPOL_KEY_RSN {
            return Err(EapolFault::Ignore(
                "re-keying with a different key type",
            ));
        }
        let expect = KeyInfo::SECURE
            | KeyInfo::ENCRYPTED
            | KeyInfo::ACK
            | KeyInfo::MIC;
        if !frame.has_pattern(expect) {
            return Err(EapolFault::Ignore("not a rekey request packet"));
        }
        if frame.replay <= self.replay {
            return Err(EapolFault::Ignore("packet 1/2 replay"));
        }
        if !check_mic(&self.ptk.kck, &mic_zeroed(buf), &frame.mic) {
            return Err(EapolFault::Ignore("packet 1/2 bad MIC"));
        }

        let Some(data) = unwrap_key(&self.ptk.kek, &frame.payload) else {
            return Err(EapolFault::Abort("packet 1/2 cannot unwrap"));
        };
        let Some(gtk) = find_gtk(&data, self.tkip_group) else {
            return Err(EapolFault::Abort("packet 1/2 cannot fetch GTK"));
        };

        let mut rsc = [0u8; 6];
        rsc.copy_from_slice(&frame.rsc[..6]);
        self.replay = frame.replay;

        let mut ops = self.send_group_2();
        ops.push(EapolOp::InstallGtk {
            key: gtk.key,
            index: gtk.index,
            rsc,
        });
        Ok(ops)
    }

    fn send_group_2(&mut self) -> Vec<EapolOp> {
        let frame = KeyFrame {
            version: self.version,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::MIC | KeyInfo::SECURE).bits(),
            replay: self.replay,
            ..Default::default()
        };
        vec![EapolOp::Send(self.seal(frame))]
    }

    /// Emits the frame and writes the truncated HMAC-SHA1 over the
    /// zero-MIC form into the MIC field.
    fn seal(&self, frame: KeyFrame) -> Vec<u8> {
        let mut raw = frame.emit();
        let mic = make_mic(&self.ptk.kck, &raw);
        raw[81..81 + MIC_LEN].copy_from_slice(&mic);
        raw
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes_kw::KekAes128;

    const SMAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x02];
    const AMAC: [u8; 6] = [0x02, 0x00, 0x00, 0x00, 0x00, 0x01];
    const ANONCE: [u8; 32] = [0x01; 32];

    fn psk() -> [u8; 32] {
        crypto::psk_from_passphrase("password", b"Test")
    }

    fn ies() -> Vec<u8> {
        crate::ies::build_rsn_ie(false)
    }

    fn primed() -> Supplicant {
        let mut sup = Supplicant::default();
        sup.prime(SMAC, AMAC, psk(), ies(), false);
        sup
    }

    fn packet_1(replay: u64) -> Vec<u8> {
        KeyFrame {
            version: 2,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::PAIRWISE | KeyInfo::ACK).bits(),
            keylen: 16,
            replay,
            nonce: ANONCE,
            ..Default::default()
        }
        .emit()
    }

    /// Reads the SNonce out of the emitted packet 2/4 and derives the
    /// same PTK the supplicant did.
    fn ptk_from_packet_2(p2: &[u8]) -> Ptk {
        let frame = KeyFrame::parse(p2).unwrap();
        derive_ptk(&psk(), &SMAC, &AMAC, &frame.nonce, &ANONCE)
    }

    fn wrap_gtk_kde(kek: &[u8; 16], index: u8, gtk: &[u8; 16]) -> Vec<u8> {
        let mut kde = vec![0xDD, 22, 0x00, 0x0F, 0xAC, 0x01, index, 0x00];
        kde.extend_from_slice(gtk);
        let mut wrapped = vec![0u8; kde.len() + 8];
        KekAes128::from(*kek).wrap(&kde, &mut wrapped).unwrap();
        wrapped
    }

    fn sealed(frame: KeyFrame, kck: &[u8; 16]) -> Vec<u8> {
        let mut raw = frame.emit();
        let mic = make_mic(kck, &raw);
        raw[81..97].copy_from_slice(&mic);
        raw
    }

    fn packet_3(ptk: &Ptk, replay: u64, gtk: &[u8; 16]) -> Vec<u8> {
        let frame = KeyFrame {
            version: 2,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::PAIRWISE
                    | KeyInfo::ACK
                    | KeyInfo::MIC
                    | KeyInfo::SECURE
                    | KeyInfo::ENCRYPTED)
                    .bits(),
            keylen: 16,
            replay,
            nonce: ANONCE,
            rsc: [0x05, 0, 0, 0, 0, 0, 0, 0],
            payload: wrap_gtk_kde(&ptk.kek, 1, gtk),
            ..Default::default()
        };
        sealed(frame, &ptk.kck)
    }

    fn group_1(ptk: &Ptk, replay: u64, index: u8, gtk: &[u8; 16]) -> Vec<u8> {
        let frame = KeyFrame {
            version: 2,
            keyinfo: KeyInfo::VERSION_SHA1
                | (KeyInfo::SECURE
                    | KeyInfo::ENCRYPTED
                    | KeyInfo::ACK
                    | KeyInfo::MIC)
                    .bits(),
            replay,
            rsc: [0x09, 0, 0, 0, 0, 0, 0, 0],
            payload: wrap_gtk_kde(&ptk.kek, index, gtk),
            ..Default::default()
        };
        sealed(frame, &ptk.kck)
    }

    /// Drives a complete successful handshake and returns the machine
    /// in NEGOTIATED together with the derived PTK.
    fn negotiate(sup: &mut Supplicant) -> Ptk {
        assert!(sup.handle_frame(&packet_1(1), AMAC).unwrap().is_empty());
        assert_eq!(sup.state, EapolState::Waiting24);

        let ops = sup.allow_sends();
        let EapolOp::Send(p2) = &ops[0] else { panic!("no 2/4") };
        let ptk = ptk_from_packet_2(p2);

        let gtk = [0x33u8; 16];
        let ops = sup
            .handle_frame(&packet_3(&ptk, 2, &gtk), AMAC)
            .unwrap();
        assert_eq!(ops.len(), 4);
        assert!(matches!(ops[0], EapolOp::Send(_)));
        assert_eq!(ops[1], EapolOp::InstallPtk { tk: ptk.tk });
        assert_eq!(
            ops[2],
            EapolOp::InstallGtk {
                key: gtk.to_vec(),
                index: 1,
                rsc: [0x05, 0, 0, 0, 0, 0],
            }
        );
        assert_eq!(ops[3], EapolOp::Connected);
        assert_eq!(sup.state, EapolState::Negotiated);
        ptk
    }

    #[test]
    fn full_handshake_association_after_1_4() {
        let mut sup = primed();
        negotiate(&mut sup);
    }

    #[test]
    fn full_handshake_association_before_1_4() {
        let mut sup = primed();
        assert!(sup.allow_sends().is_empty());

        let ops = sup.handle_frame(&packet_1(1), AMAC).unwrap();
        let EapolOp::Send(p2) = &ops[0] else { panic!("no 2/4") };
        assert_eq!(sup.state, EapolState::Waiting34);

        // 2/4 carries our association IEs and a valid MIC
        let frame = KeyFrame::parse(p2).unwrap();
        assert_eq!(frame.payload, ies());
        assert_eq!(frame.keylen, 16);
        let ptk = ptk_from_packet_2(p2);
        assert!(check_mic(&ptk.kck, &mic_zeroed(p2), &frame.mic));
    }

    #[test]
    fn packet_4_has_the_right_shape() {
        let mut sup = primed();
        sup.handle_frame(&packet_1(1), AMAC).unwrap();
        let ops = sup.allow_sends();
        let EapolOp::Send(p2) = &ops[0] else { panic!() };
        let ptk = ptk_from_packet_2(p2);

        let ops = sup
            .handle_frame(&packet_3(&ptk, 2, &[0x33; 16]), AMAC)
            .unwrap();
        let EapolOp::Send(p4) = &ops[0] else { panic!("no 4/4") };
        let frame = KeyFrame::parse(p4).unwrap();
        assert!(frame.has_pattern(
            KeyInfo::PAIRWISE | KeyInfo::MIC | KeyInfo::SECURE
        ));
        assert_eq!(frame.keylen, 0);
        assert_eq!(frame.replay, 2);
        assert!(frame.payload.is_empty());
        assert!(check_mic(&ptk.kck, &mic_zeroed(p4), &frame.mic));
    }

    #[test]
    fn replay_counter_must_strictly_increase() {
        let mut sup = primed();
        sup.handle_frame(&packet_1(7), AMAC).unwrap();
        let ops = sup.allow_sends();
        let EapolOp::Send(p2) = &ops[0] else { panic!() };
        let ptk = ptk_from_packet_2(p2);

        // equal to stored: rejected
        assert_eq!(
            sup.handle_frame(&packet_3(&ptk, 7, &[0x33; 16]), AMAC),
            Err(EapolFault::Abort("packet 3/4 replay fail"))
        );
    }

    #[test]
    fn bad_mic_aborts() {
        let mut sup = primed();
        sup.handle_frame(&packet_1(1), AMAC).unwrap();
        let ops = sup.allow_sends();
        let EapolOp::Send(p2) = &ops[0] else { panic!() };
        let ptk = ptk_from_packet_2(p2);

        let mut p3 = packet_3(&ptk, 2, &[0x33; 16]);
        p3[85] ^= 1;
        assert_eq!(
            sup.handle_frame(&p3, AMAC),
            Err(EapolFault::Abort("packet 3/4 bad MIC"))
        );
    }

    #[test]
    fn changed_anonce_aborts() {
        let mut sup = primed();
        sup.handle_frame(&packet_1(1), AMAC).unwrap();
        let ops = sup.allow_sends();
        let EapolOp::Send(p2) = &ops[0] else { panic!() };
        let ptk = ptk_from_packet_2(p2);

        let mut p3 = packet_3(&ptk, 2, &[0x33; 16]);
        p3[17] ^= 1; // first ANonce byte
        // MIC is now wrong too, but the nonce check runs first
        assert_eq!(
            sup.handle_frame(&p3, AMAC),
            Err(EapolFault::Abort("packet 3/4 nonce changed"))
        );
    }

    #[test]
    fn stray_source_is_ignored() {
        let mut sup = primed();
        let other = [0x02, 0, 0, 0, 0, 0xEE];
        assert_eq!(
            sup.handle_frame(&packet_1(1), other),
            Err(EapolFault::Ignore("stray packet"))
        );
    }

    #[test]
    fn group_rekey_installs_new_gtk() {
        let mut sup = primed();
        let ptk = negotiate(&mut sup);

        let gtk2 = [0x44u8; 16];
        let ops = sup
            .handle_frame(&group_1(&ptk, 3, 2, &gtk2), AMAC)
            .unwrap();
        let EapolOp::Send(g2) = &ops[0] else { panic!("no group 2/2") };
        assert_eq!(
            ops[1],
            EapolOp::InstallGtk {
                key: gtk2.to_vec(),
                index: 2,
                rsc: [0x09, 0, 0, 0, 0, 0],
            }
        );

        let frame = KeyFrame::parse(g2).unwrap();
        assert!(frame.has_pattern(KeyInfo::MIC | KeyInfo::SECURE));
        assert_eq!(frame.replay, 3);
        assert!(check_mic(&ptk.kck, &mic_zeroed(g2), &frame.mic));
        assert_eq!(sup.state, EapolState::Negotiated);
    }

    #[test]
    fn group_rekey_replay_is_ignored_not_fatal() {
        let mut sup = primed();
        let ptk = negotiate(&mut sup);
        assert_eq!(
            sup.handle_frame(&group_1(&ptk, 2, 2, &[0x44; 16]), AMAC),
            Err(EapolFault::Ignore("packet 1/2 replay"))
        );
        assert_eq!(sup.state, EapolState::Negotiated);
    }

    #[test]
    fn tkip_group_key_handshake() {
        let mut sup = Supplicant::default();
        sup.prime(SMAC, AMAC, psk(), crate::ies::build_rsn_ie(true), true);
        sup.handle_frame(&packet_1(1), AMAC).unwrap();
        let ops = sup.allow_sends();
        let EapolOp::Send(p2) = &ops[0] else { panic!() };
        let frame = KeyFrame::parse(p2).unwrap();
        let ptk =
            derive_ptk(&psk(), &SMAC, &AMAC, &frame.nonce, &ANONCE);

        let mut gtk32 = [0u8; 32];
        for (i, b) in gtk32.iter_mut().enumerate() {
            *b = i as u8;
        }
        let mut kde = vec![0xDD, 38, 0x00, 0x0F, 0xAC, 0x01, 0x01, 0x00];
        kde.extend_from_slice(&gtk32);
        let mut wrapped = vec![0u8; kde.len() + 8];
        KekAes128::from(ptk.kek).wrap(&kde, &mut wrapped).unwrap();

        let p3 = sealed(
            KeyFrame {
                version: 2,
                keyinfo: KeyInfo::VERSION_SHA1
                    | (KeyInfo::PAIRWISE
                        | KeyInfo::ACK
                        | KeyInfo::MIC
                        | KeyInfo::SECURE
                        | KeyInfo::ENCRYPTED)
                        .bits(),
                keylen: 16,
                replay: 2,
                nonce: ANONCE,
                payload: wrapped,
                ..Default::default()
            },
            &ptk.kck,
        );

        let ops = sup.handle_frame(&p3, AMAC).unwrap();
        let EapolOp::InstallGtk { key, .. } = &ops[2] else {
            panic!("no GTK install")
        };
        assert_eq!(key.len(), 32);
        assert_eq!(&key[16..24], &gtk32[24..32]); // MIC halves swapped
    }

    #[test]
    fn reset_wipes_key_material() {
        let mut sup = primed();
        negotiate(&mut sup);
        sup.reset();
        assert_eq!(sup.state, EapolState::Idle);
        assert_eq!(sup.ptk, Ptk::default());
        assert_eq!(sup.psk, [0u8; 32]);
        assert_eq!(sup.anonce, [0u8; 32]);
    }
}
