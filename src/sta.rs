// SPDX-License-Identifier: MIT

//! Connection management: the operator-intent and link-layer state
//! machines, scan cycles, candidate rounds and the netlink event flow
//! that moves a connection from scan entry to negotiated keys.
//!
//! All of this runs inside the daemon's event loop; every method here
//! has exclusive access to the whole daemon state.

use log::{debug, warn};

use crate::control::proto::*;
use crate::control::{report_simple, report_station, CtrlAttr, CtrlMessage, Reply};
use crate::daemon::Daemon;
use crate::eapol::EapolOp;
use crate::ies::build_rsn_ie;
use crate::iface::{bring_iface_up, RawSock};
use crate::nl80211::{Nl80211Cmd, Nl80211Message};
use crate::rfkill::{Rfkill, RfkillEvent};
use crate::scan::ScanFlags;
use crate::{config, WsuppError, PINNED_AP_PATH, RFKILL_PATH};

/// What the operator asked for.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum OperMode {
    /// Sit idle; scan and report but do not connect.
    #[default]
    Neutral,
    /// One user-requested connect attempt round.
    OneShot,
    /// Maintain a connection, reconnecting as needed.
    Active,
    /// SIGTERM received, disconnect in flight.
    ExitReq,
    /// Event loop should wind down.
    Exit,
}

/// Link-layer state.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum AuthState {
    #[default]
    Idle,
    Connecting,
    Connected,
    /// Radio is down (rfkill); waiting for it to come back.
    NetDown,
    /// Somebody else associated the interface; observe only.
    External,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum ScanState {
    #[default]
    Idle,
    Scanning,
}

/// Seconds before a stuck connect attempt is abandoned.
const TIME_CONNECT: u64 = 15;
/// Back-off between failed rounds in Active mode.
const TIME_RETRY: u64 = 10;
/// Period of the background scan while connected.
const TIME_BG_SCAN: u64 = 600;

pub(crate) fn errno_of(err: &WsuppError) -> i32 {
    match err {
        WsuppError::NetlinkError(e) => {
            e.code.map(|c| -c.get()).unwrap_or(libc::EIO)
        }
        WsuppError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
        _ => libc::EIO,
    }
}

impl Daemon {
    // ------------------------------------------------------------------
    // reports

    async fn report(&mut self, cmd: i32) {
        self.server.send_report(&report_simple(cmd)).await;
    }

    async fn report_sta(&mut self, cmd: i32) {
        let msg = report_station(
            cmd,
            self.ap.bssid,
            &self.ap.ssid.clone(),
            self.ap.freq,
        );
        self.server.send_report(&msg).await;
    }

    // ------------------------------------------------------------------
    // scanning

    /// User-requested scan; unlike the routine scans this one reports
    /// errors back to the requesting client.
    pub(crate) async fn start_void_scan(&mut self) -> Result<(), i32> {
        if self.scanstate != ScanState::Idle {
            return Err(libc::EBUSY);
        }
        self.genl
            .trigger_scan(self.iface.index)
            .await
            .map_err(|e| errno_of(&e))?;
        self.scanstate = ScanState::Scanning;
        Ok(())
    }

    pub(crate) async fn routine_fg_scan(&mut self) {
        self.retry_rfkill();
        if self.scanstate != ScanState::Idle || self.rfkilled {
            return;
        }
        match self.genl.trigger_scan(self.iface.index).await {
            Ok(()) => self.scanstate = ScanState::Scanning,
            Err(e) => {
                warn!("scan trigger: {e}");
                self.set_timer(TIME_RETRY);
            }
        }
    }

    async fn routine_bg_scan(&mut self) {
        if self.scanstate == ScanState::Idle {
            if let Err(e) = self.genl.trigger_scan(self.iface.index).await
            {
                debug!("bg scan trigger: {e}");
            } else {
                self.scanstate = ScanState::Scanning;
            }
        }
        self.set_timer(TIME_BG_SCAN);
    }

    /// The rfkill device is module-provided and may appear late;
    /// reopening is retried whenever a scan cycle starts.
    fn retry_rfkill(&mut self) {
        if self.rfkill.is_none() {
            self.rfkill = Rfkill::open(RFKILL_PATH).ok();
        }
    }

    /// NEW_SCAN_RESULTS landed: pull the dump, rebuild the table,
    /// re-derive the flags and see where that leaves us.
    async fn scan_results_ready(&mut self) {
        self.scanstate = ScanState::Idle;

        let dump = match self.genl.dump_scan(self.iface.index).await {
            Ok(dump) => dump,
            Err(e) => {
                warn!("scan dump: {e}");
                self.report(REP_WI_SCAN_FAIL).await;
                return;
            }
        };

        self.scans.clear();
        for msg in &dump {
            self.fill_scan_entry(msg);
        }
        self.scans.mark_flags(&mut self.store);
        self.scanned_in_round = true;

        self.report(REP_WI_SCAN_DONE).await;

        if self.authstate == AuthState::Connected {
            self.set_timer(TIME_BG_SCAN);
        } else {
            self.reassess_wifi_situation().await;
        }
    }

    fn fill_scan_entry(&mut self, msg: &Nl80211Message) {
        use crate::nl80211::Nl80211BssAttr;

        let Some(bss) = msg.get_bss() else { return };

        let mut bssid = None;
        let mut freq = 0;
        let mut signal = 0;
        let mut ies: &[u8] = &[];
        for attr in bss {
            match attr {
                Nl80211BssAttr::Bssid(mac) => bssid = Some(*mac),
                Nl80211BssAttr::Frequency(f) => freq = *f,
                Nl80211BssAttr::SignalMbm(s) => signal = *s,
                Nl80211BssAttr::InformationElements(v) => ies = v,
                _ => (),
            }
        }
        let (Some(bssid), true) = (bssid, freq != 0) else { return };

        let sta = crate::ies::parse_station_ies(ies);
        let Some(entry) = self.scans.upsert(bssid) else { return };
        entry.freq = freq;
        entry.signal = signal;
        entry.ssid = sta.ssid;
        entry.kind = sta.kind;
    }

    // ------------------------------------------------------------------
    // connect / disconnect

    /// Starts a fresh attempt round: nothing tried yet, table stale.
    pub(crate) fn start_new_round(&mut self) {
        self.scans.clear_tried();
        self.scanned_in_round = false;
    }

    /// The heart of auto-connect. Runs whenever circumstances change:
    /// picks the best remaining candidate and goes for it, rescans
    /// once per round when the table has nothing, gives up with
    /// NO_CONNECT when the round is spent.
    pub(crate) async fn reassess_wifi_situation(&mut self) {
        if self.authstate != AuthState::Idle || self.rfkilled {
            return;
        }
        if !matches!(self.opermode, OperMode::OneShot | OperMode::Active)
        {
            return;
        }
        loop {
            if self.scanstate != ScanState::Idle {
                return; // a scan is running; its completion re-enters
            }
            let pinned =
                self.ap.fixed.then(|| self.ap.ssid.clone());
            let require_pass = self.pending_psk.is_none();
            let Some(entry) =
                self.scans.select(pinned.as_deref(), require_pass)
            else {
                if !self.scanned_in_round {
                    self.scanned_in_round = true;
                    self.routine_fg_scan().await;
                } else {
                    self.no_more_candidates().await;
                }
                return;
            };

            let bssid = entry.bssid;
            let freq = entry.freq;
            let ssid = entry.ssid.clone();
            let tkip = entry.tkip_group();
            self.scans.mark_tried(&bssid);

            match self.start_connect_to(bssid, freq, ssid, tkip).await {
                Ok(()) => return,
                Err(e) => {
                    warn!("connect attempt: {e}");
                    continue;
                }
            }
        }
    }

    async fn start_connect_to(
        &mut self,
        bssid: [u8; 6],
        freq: u32,
        ssid: Vec<u8>,
        tkip_group: bool,
    ) -> Result<(), WsuppError> {
        let psk = match self.pending_psk {
            Some(psk) => psk,
            None => self
                .store
                .load_psk(&ssid)?
                .ok_or_else(|| {
                    WsuppError::Fatal("no stored PSK".into())
                })?,
        };

        self.ap.bssid = bssid;
        self.ap.freq = freq;
        self.ap.ssid = ssid.clone();
        self.ap.tkip_group = tkip_group;
        self.ap.ies = build_rsn_ie(tkip_group);
        self.ap.assoc_sent = false;

        if self.rawsock.is_none() {
            self.rawsock = Some(RawSock::open(self.iface.index)?);
        }

        // primed before AUTHENTICATE so an early packet 1/4 is caught
        self.eapol.prime(
            self.iface.mac,
            bssid,
            psk,
            self.ap.ies.clone(),
            tkip_group,
        );

        self.genl
            .authenticate(self.iface.index, bssid, freq, ssid)
            .await?;

        self.authstate = AuthState::Connecting;
        self.set_timer(TIME_CONNECT);
        Ok(())
    }

    async fn no_more_candidates(&mut self) {
        self.report(REP_WI_NO_CONNECT).await;
        self.scans.clear_tried();
        match self.opermode {
            OperMode::OneShot => self.opermode = OperMode::Neutral,
            OperMode::Active => self.set_timer(TIME_RETRY),
            _ => (),
        }
    }

    pub(crate) async fn start_disconnect(&mut self) -> Result<(), i32> {
        match self.authstate {
            AuthState::Connecting | AuthState::Connected => (),
            _ => return Err(libc::EALREADY),
        }
        self.genl
            .disconnect(self.iface.index)
            .await
            .map_err(|e| errno_of(&e))?;
        Ok(())
    }

    /// Kills the current attempt or connection on our own initiative
    /// (timeout, EAPOL failure, transmit failure) and moves on.
    pub(crate) async fn abort_connection(&mut self) {
        if matches!(
            self.authstate,
            AuthState::Connecting | AuthState::Connected
        ) {
            let _ = self.genl.disconnect(self.iface.index).await;
            self.report_sta(REP_WI_DISCONNECT).await;
        }
        self.dhcp.kill();
        self.eapol.reset();
        self.authstate = AuthState::Idle;
        self.clr_timer();
        if self.opermode == OperMode::ExitReq {
            self.opermode = OperMode::Exit;
            return;
        }
        self.reassess_wifi_situation().await;
    }

    /// EAPOL negotiation finished; the link is usable.
    async fn handle_connect(&mut self) {
        self.authstate = AuthState::Connected;
        self.clr_timer();

        // persist the PSK only now that it demonstrably works
        if let Some(mut psk) = self.pending_psk.take() {
            if let Err(e) = self.store.save_psk(&self.ap.ssid, &psk) {
                warn!("saving PSK: {e}");
            }
            psk.fill(0);
        }

        if self.opermode == OperMode::OneShot {
            self.opermode = OperMode::Active;
        }

        self.report_sta(REP_WI_CONNECTED).await;
        self.dhcp.trigger(&self.iface.name.clone());
        self.start_new_round();
        self.set_timer(TIME_BG_SCAN);
    }

    pub(crate) async fn run_eapol_ops(&mut self, ops: Vec<EapolOp>) {
        for op in ops {
            match op {
                EapolOp::Send(frame) => {
                    let sent = match &self.rawsock {
                        Some(sock) => sock
                            .send_to(&frame, self.ap.bssid)
                            .map_err(|e| warn!("EAPOL send: {e}"))
                            .is_ok(),
                        None => false,
                    };
                    if !sent {
                        self.abort_connection().await;
                        return;
                    }
                }
                EapolOp::InstallPtk { tk } => {
                    if let Err(e) = self
                        .genl
                        .install_ptk(self.iface.index, self.ap.bssid, tk)
                        .await
                    {
                        warn!("PTK upload: {e}");
                        self.abort_connection().await;
                        return;
                    }
                }
                EapolOp::InstallGtk { key, index, rsc } => {
                    if let Err(e) = self
                        .genl
                        .install_gtk(
                            self.iface.index,
                            key,
                            index,
                            rsc,
                            self.ap.tkip_group,
                        )
                        .await
                    {
                        warn!("GTK upload: {e}");
                        if self.authstate != AuthState::Connected {
                            self.abort_connection().await;
                            return;
                        }
                    }
                }
                EapolOp::Connected => self.handle_connect().await,
            }
        }
    }

    // ------------------------------------------------------------------
    // netlink events

    pub(crate) async fn handle_netlink(&mut self, msg: Nl80211Message) {
        if let Some(ifi) = msg.get_ifindex() {
            if ifi != self.iface.index {
                return;
            }
        }
        match msg.cmd {
            Nl80211Cmd::ScanTrigger => {
                self.report(REP_WI_SCANNING).await
            }
            Nl80211Cmd::ScanResults => self.scan_results_ready().await,
            Nl80211Cmd::ScanAborted => {
                self.scanstate = ScanState::Idle;
                self.report(REP_WI_SCAN_FAIL).await;
            }
            Nl80211Cmd::Authenticate => self.handle_auth_event().await,
            Nl80211Cmd::Associate | Nl80211Cmd::Connect => {
                self.handle_assoc_event(&msg).await
            }
            Nl80211Cmd::Deauthenticate
            | Nl80211Cmd::Disassociate
            | Nl80211Cmd::Disconnect => {
                self.handle_disconnect_event().await
            }
            _ => (),
        }
    }

    async fn handle_auth_event(&mut self) {
        if self.authstate != AuthState::Connecting || self.ap.assoc_sent
        {
            return;
        }
        let res = self
            .genl
            .associate(
                self.iface.index,
                self.ap.bssid,
                self.ap.freq,
                self.ap.ssid.clone(),
                self.ap.ies.clone(),
            )
            .await;
        match res {
            Ok(()) => self.ap.assoc_sent = true,
            Err(e) => {
                warn!("ASSOCIATE: {e}");
                self.abort_connection().await;
            }
        }
    }

    /// Association completed (or the kernel reported a connect
    /// result). EAPOL replies may flow from here on. An association
    /// that was not ours puts the daemon in observe-only mode.
    async fn handle_assoc_event(&mut self, msg: &Nl80211Message) {
        match self.authstate {
            AuthState::Connecting => {
                if let Some(code) = msg.get_status_code() {
                    if code != 0 {
                        warn!("association failed with status {code}");
                        self.abort_connection().await;
                        return;
                    }
                }
                let ops = self.eapol.allow_sends();
                self.run_eapol_ops(ops).await;
            }
            AuthState::Idle => {
                debug!("external association detected");
                self.authstate = AuthState::External;
            }
            _ => (),
        }
    }

    async fn handle_disconnect_event(&mut self) {
        match self.authstate {
            AuthState::Idle | AuthState::NetDown => (),
            AuthState::External => self.authstate = AuthState::Idle,
            AuthState::Connecting | AuthState::Connected => {
                let was_connected =
                    self.authstate == AuthState::Connected;
                self.dhcp.kill();
                self.eapol.reset();
                self.report_sta(REP_WI_DISCONNECT).await;
                self.clr_timer();

                if self.rfkilled {
                    self.authstate = AuthState::NetDown;
                    self.report(REP_WI_NET_DOWN).await;
                    return;
                }
                self.authstate = AuthState::Idle;

                match self.opermode {
                    OperMode::ExitReq => {
                        self.opermode = OperMode::Exit
                    }
                    OperMode::OneShot | OperMode::Active => {
                        if was_connected {
                            self.start_new_round();
                        }
                        self.reassess_wifi_situation().await;
                    }
                    _ => (),
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // rfkill

    pub(crate) async fn handle_rfkill_event(&mut self, ev: RfkillEvent) {
        let ifname = self.iface.name.clone();
        let Some(rk) = self.rfkill.as_mut() else { return };
        if !rk.claims(&ev, &ifname) {
            return;
        }

        if ev.blocked() {
            self.rfkilled = true;
            self.clr_timer();
            if matches!(
                self.authstate,
                AuthState::Connecting | AuthState::Connected
            ) {
                self.dhcp.kill();
                self.eapol.reset();
                let _ = self.genl.disconnect(self.iface.index).await;
                self.authstate = AuthState::NetDown;
                self.report(REP_WI_NET_DOWN).await;
            }
        } else {
            self.rfkilled = false;
            if let Err(e) = bring_iface_up(&ifname) {
                warn!("bringing {ifname} up: {e}");
            }
            self.handle_rfrestored().await;
        }
    }

    /// Radio is back: fresh sockets, fresh auth state, fresh scan.
    async fn handle_rfrestored(&mut self) {
        if self.rawsock.is_none() {
            self.rawsock = RawSock::open(self.iface.index).ok();
        }
        if self.authstate == AuthState::NetDown {
            self.authstate = AuthState::Idle;
        }
        self.eapol.reset();
        self.routine_fg_scan().await;
    }

    // ------------------------------------------------------------------
    // timer

    /// The single-shot timer dispatch: what expiry means depends
    /// entirely on where the daemon currently stands.
    pub(crate) async fn timer_expired(&mut self) {
        match self.authstate {
            AuthState::NetDown => {
                if !self.rfkilled {
                    self.opermode = OperMode::Exit;
                } else {
                    self.authstate = AuthState::Idle;
                }
            }
            AuthState::Connected => self.routine_bg_scan().await,
            AuthState::Idle => {
                self.routine_fg_scan().await;
            }
            _ => self.abort_connection().await,
        }
    }

    // ------------------------------------------------------------------
    // persisted state

    /// Restores the pinned AP saved by a previous instance. The file
    /// is consumed either way; a pin without a stored PSK is useless
    /// and dropped.
    pub(crate) fn load_state(&mut self) {
        let Some(ssid) =
            config::load_pinned(std::path::Path::new(PINNED_AP_PATH))
        else {
            return;
        };
        if !self.store.got_psk_for(&ssid) {
            return;
        }
        self.ap.ssid = ssid;
        self.ap.fixed = true;
        self.opermode = OperMode::Active;
    }

    pub(crate) fn save_state(&mut self) {
        if self.ap.fixed {
            config::save_pinned(
                std::path::Path::new(PINNED_AP_PATH),
                &self.ap.ssid,
            );
        }
    }

    // ------------------------------------------------------------------
    // control commands

    pub(crate) async fn handle_command(
        &mut self,
        i: usize,
        msg: CtrlMessage,
    ) {
        let reply: Reply = match msg.cmd {
            CMD_WI_STATUS => self.cmd_status(i),
            CMD_WI_DEVICE => self.cmd_device(),
            CMD_WI_SCAN => self.cmd_scan(i).await,
            CMD_WI_NEUTRAL => self.cmd_neutral(i).await,
            CMD_WI_CONNECT => self.cmd_connect(i, &msg),
            CMD_WI_FORGET => self.cmd_forget(&msg),
            _ => Err(libc::ENOSYS),
        };
        let connect_accepted =
            msg.cmd == CMD_WI_CONNECT && reply.is_ok();

        // the synchronous reply must precede any report the command
        // induces, so connection work starts only after this write
        self.server.send_reply(i, reply).await;

        if connect_accepted {
            self.clr_timer();
            self.start_new_round();
            self.reassess_wifi_situation().await;
        }
    }

    fn common_wifi_state(&self) -> u32 {
        match self.authstate {
            AuthState::Connected => WS_CONNECTED,
            AuthState::NetDown if self.rfkilled => WS_RFKILLED,
            AuthState::NetDown => WS_NETDOWN,
            AuthState::External => WS_EXTERNAL,
            AuthState::Connecting => WS_CONNECTING,
            AuthState::Idle if self.scanstate != ScanState::Idle => {
                WS_SCANNING
            }
            AuthState::Idle => WS_IDLE,
        }
    }

    /// STATUS doubles as the unsubscribe command: a client polling
    /// for state does not want reports in its reply stream.
    fn cmd_status(&mut self, i: usize) -> Reply {
        self.server.subscribe(i, false);

        let mut msg = CtrlMessage::new(0);
        msg.attrs
            .push(CtrlAttr::IfIndex(self.iface.index as i32));
        msg.attrs.push(CtrlAttr::Name(self.iface.name.clone()));
        msg.attrs.push(CtrlAttr::State(self.common_wifi_state()));

        if self.authstate != AuthState::Idle || self.ap.fixed {
            msg.attrs.push(CtrlAttr::Ssid(self.ap.ssid.clone()));
        }
        if self.authstate != AuthState::Idle {
            msg.attrs.push(CtrlAttr::Bssid(self.ap.bssid));
            msg.attrs.push(CtrlAttr::Freq(self.ap.freq as i32));
        }

        for e in self.scans.occupied() {
            let mut nest = vec![
                CtrlAttr::Freq(e.freq as i32),
                CtrlAttr::Type(e.kind.bits()),
                CtrlAttr::Signal(e.signal),
                CtrlAttr::Bssid(e.bssid),
                CtrlAttr::Ssid(e.ssid.clone()),
            ];
            if e.flags.contains(ScanFlags::PASS | ScanFlags::GOOD) {
                nest.push(CtrlAttr::Prio);
            }
            msg.attrs.push(CtrlAttr::Scan(nest));
        }
        Ok(msg)
    }

    fn cmd_device(&self) -> Reply {
        let mut msg = CtrlMessage::new(0);
        msg.attrs
            .push(CtrlAttr::IfIndex(self.iface.index as i32));
        msg.attrs.push(CtrlAttr::Name(self.iface.name.clone()));
        Ok(msg)
    }

    async fn cmd_scan(&mut self, i: usize) -> Reply {
        self.start_void_scan().await?;
        self.server.subscribe(i, true);
        Ok(CtrlMessage::new(0))
    }

    async fn cmd_neutral(&mut self, i: usize) -> Reply {
        self.opermode = OperMode::Neutral;
        self.start_disconnect().await?;
        self.server.subscribe(i, true);
        self.clr_timer();
        Ok(CtrlMessage::new(0))
    }

    fn cmd_connect(&mut self, i: usize, msg: &CtrlMessage) -> Reply {
        if self.authstate != AuthState::Idle {
            return Err(libc::EBUSY);
        }
        if self.scanstate != ScanState::Idle {
            return Err(libc::EBUSY);
        }
        self.configure_station(msg)?;
        self.opermode = OperMode::OneShot;
        self.server.subscribe(i, true);
        Ok(CtrlMessage::new(0))
    }

    /// CONNECT with no SSID is free auto-connect. An SSID pins the
    /// station; the PSK either rides along (32 bytes, held until the
    /// handshake proves it) or must already be stored.
    fn configure_station(
        &mut self,
        msg: &CtrlMessage,
    ) -> Result<(), i32> {
        self.ap.fixed = false;
        self.ap.ssid.clear();
        self.pending_psk = None;

        let Some(ssid) = msg.get_ssid() else { return Ok(()) };
        let ssid = ssid.to_vec();

        match msg.get_psk() {
            None => {
                if !self.store.got_psk_for(&ssid) {
                    return Err(libc::ENOKEY);
                }
            }
            Some(psk) if psk.len() == 32 => {
                let mut fixed = [0u8; 32];
                fixed.copy_from_slice(psk);
                self.pending_psk = Some(fixed);
            }
            Some(psk) => {
                warn!("invalid PSK length {}", psk.len());
                return Err(libc::EINVAL);
            }
        }

        self.ap.ssid = ssid;
        self.ap.fixed = true;
        Ok(())
    }

    fn cmd_forget(&mut self, msg: &CtrlMessage) -> Reply {
        let Some(ssid) = msg.get_ssid() else {
            return Err(libc::EINVAL);
        };
        let ssid = ssid.to_vec();

        match self.store.drop_psk(&ssid) {
            Ok(true) => (),
            Ok(false) => return Err(libc::ENOENT),
            Err(e) => {
                return Err(e.raw_os_error().unwrap_or(libc::EIO))
            }
        }
        self.scans.strip_pass(&ssid);
        Ok(CtrlMessage::new(0))
    }
}
