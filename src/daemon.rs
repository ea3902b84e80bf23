// SPDX-License-Identifier: MIT

//! The single-threaded event loop. One `next_event()` call multiplexes
//! every input the daemon has (netlink events, the raw EAPOL socket,
//! the control listener and its clients, rfkill, the single-shot
//! timer, signals, the DHCP child) and hands back one owned [`Event`]
//! at a time, so every handler runs with exclusive access to all
//! state and nothing needs a lock.

use std::process::ExitStatus;

use log::warn;
use tokio::net::UnixStream;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tokio::time::Instant;

use crate::config::PskStore;
use crate::control::ControlServer;
use crate::dhcp::DhcpChild;
use crate::eapol::{EapolFault, Supplicant};
use crate::iface::{setup_iface, Iface, RawSock};
use crate::nl80211::{
    new_connection, Nl80211Events, Nl80211Handle, Nl80211Message,
};
use crate::rfkill::{Rfkill, RfkillEvent};
use crate::scan::ScanTable;
use crate::sta::{AuthState, OperMode, ScanState};
use crate::WsuppError;
use crate::{CONFIG_PATH, CONTROL_PATH, RFKILL_PATH};

/// The station we are talking to, or trying to. `ssid` and `fixed`
/// survive disconnects to support reconnect; the rest is only
/// meaningful outside AuthState::Idle.
#[derive(Debug, Default)]
pub(crate) struct Ap {
    pub ssid: Vec<u8>,
    pub fixed: bool,
    pub bssid: [u8; 6],
    pub freq: u32,
    pub ies: Vec<u8>,
    pub tkip_group: bool,
    /// ASSOCIATE already went out for the current attempt.
    pub assoc_sent: bool,
}

pub(crate) enum Event {
    Netlink(Nl80211Message),
    NetlinkGone,
    Eapol(Vec<u8>, [u8; 6]),
    RawsockGone,
    Accept(UnixStream),
    ControlGone,
    Client(usize),
    Rfkill(RfkillEvent),
    RfkillGone,
    Timer,
    Shutdown,
    DhcpExit(ExitStatus),
}

pub struct Daemon {
    pub(crate) iface: Iface,
    pub(crate) genl: Nl80211Handle,
    events: Nl80211Events,
    pub(crate) rawsock: Option<RawSock>,
    pub(crate) rfkill: Option<Rfkill>,
    pub(crate) rfkilled: bool,
    pub(crate) server: ControlServer,
    pub(crate) store: PskStore,
    pub(crate) scans: ScanTable,
    pub(crate) eapol: Supplicant,
    pub(crate) dhcp: DhcpChild,
    pub(crate) opermode: OperMode,
    pub(crate) authstate: AuthState,
    pub(crate) scanstate: ScanState,
    pub(crate) ap: Ap,
    /// PSK given with the last CONNECT, persisted once the handshake
    /// succeeds and wiped either way.
    pub(crate) pending_psk: Option<[u8; 32]>,
    pub(crate) scanned_in_round: bool,
    timer: Option<Instant>,
    sigint: Signal,
    sigterm: Signal,
    /// Never polled; registering the handler stops SIGHUP from
    /// killing the daemon (SIGPIPE is already ignored by the runtime).
    _sighup: Signal,
}

impl Daemon {
    /// Brings up every fd the daemon owns. Failures here are fatal
    /// startup errors, except rfkill which opens lazily anyway.
    pub async fn new(ifname: &str) -> Result<Self, WsuppError> {
        let iface = setup_iface(ifname)?;

        let (conn, mut genl, _) = new_connection()?;
        tokio::spawn(conn);
        let events = Nl80211Events::new(&mut genl).await?;

        let rawsock = Some(RawSock::open(iface.index)?);
        let rfkill = match Rfkill::open(RFKILL_PATH) {
            Ok(rk) => Some(rk),
            Err(e) => {
                warn!("{RFKILL_PATH}: {e}");
                None
            }
        };
        let server = ControlServer::bind(CONTROL_PATH)?;

        Ok(Daemon {
            iface,
            genl,
            events,
            rawsock,
            rfkill,
            rfkilled: false,
            server,
            store: PskStore::new(CONFIG_PATH),
            scans: ScanTable::new(),
            eapol: Supplicant::default(),
            dhcp: DhcpChild::default(),
            opermode: OperMode::Neutral,
            authstate: AuthState::Idle,
            scanstate: ScanState::Idle,
            ap: Ap::default(),
            pending_psk: None,
            scanned_in_round: false,
            timer: None,
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            _sighup: signal(SignalKind::hangup())?,
        })
    }

    pub(crate) fn set_timer(&mut self, seconds: u64) {
        self.timer = Some(
            Instant::now() + std::time::Duration::from_secs(seconds),
        );
    }

    pub(crate) fn clr_timer(&mut self) {
        self.timer = None;
    }

    async fn next_event(&mut self) -> Event {
        let timer = self.timer;
        tokio::select! {
            msg = self.events.next() => match msg {
                Some(msg) => Event::Netlink(msg),
                None => Event::NetlinkGone,
            },
            res = rawsock_recv(&self.rawsock) => match res {
                Ok((frame, src)) => Event::Eapol(frame, src),
                Err(e) => {
                    warn!("EAPOL socket: {e}");
                    Event::RawsockGone
                }
            },
            res = self.server.accept() => match res {
                Ok(stream) => Event::Accept(stream),
                Err(e) => {
                    warn!("control accept: {e}");
                    Event::ControlGone
                }
            },
            i = self.server.conn_readable() => Event::Client(i),
            res = rfkill_next(&mut self.rfkill) => match res {
                Ok(ev) => Event::Rfkill(ev),
                Err(e) => {
                    warn!("rfkill: {e}");
                    Event::RfkillGone
                }
            },
            () = timer_wait(timer) => Event::Timer,
            _ = self.sigint.recv() => Event::Shutdown,
            _ = self.sigterm.recv() => Event::Shutdown,
            status = self.dhcp.wait() => Event::DhcpExit(status),
        }
    }

    async fn handle_event(
        &mut self,
        event: Event,
    ) -> Result<(), WsuppError> {
        match event {
            Event::Netlink(msg) => self.handle_netlink(msg).await,
            Event::NetlinkGone => {
                return Err(WsuppError::Fatal(
                    "lost netlink connection".into(),
                ))
            }
            Event::Eapol(frame, src) => {
                self.handle_eapol_frame(&frame, src).await
            }
            Event::RawsockGone => self.rawsock = None,
            Event::Accept(stream) => self.server.add_conn(stream),
            Event::ControlGone => {
                return Err(WsuppError::Fatal(
                    "lost control socket".into(),
                ))
            }
            Event::Client(i) => {
                let msgs = self.server.read_conn(i);
                for msg in msgs {
                    self.handle_command(i, msg).await;
                }
            }
            Event::Rfkill(ev) => self.handle_rfkill_event(ev).await,
            Event::RfkillGone => self.rfkill = None,
            Event::Timer => {
                self.timer = None;
                self.timer_expired().await;
            }
            Event::Shutdown => self.xshutdown().await?,
            Event::DhcpExit(status) => DhcpChild::log_exit(status),
        }
        Ok(())
    }

    async fn handle_eapol_frame(&mut self, frame: &[u8], src: [u8; 6]) {
        match self.eapol.handle_frame(frame, src) {
            Ok(ops) => self.run_eapol_ops(ops).await,
            Err(EapolFault::Ignore(why)) => warn!("EAPOL {why}"),
            Err(EapolFault::Abort(why)) => {
                warn!("EAPOL {why}");
                self.abort_connection().await;
            }
        }
    }

    /// A second exit request while one is draining forces the issue.
    async fn xshutdown(&mut self) -> Result<(), WsuppError> {
        match self.opermode {
            OperMode::Exit | OperMode::ExitReq => {
                return Err(WsuppError::Fatal(
                    "second exit request".into(),
                ))
            }
            _ => (),
        }
        match self.authstate {
            AuthState::Idle | AuthState::NetDown | AuthState::External => {
                self.opermode = OperMode::Exit;
                return Ok(());
            }
            _ => (),
        }

        if self.start_disconnect().await.is_err() {
            self.opermode = OperMode::Exit;
        } else {
            self.opermode = OperMode::ExitReq;
        }
        Ok(())
    }

    pub async fn run(&mut self) -> Result<(), WsuppError> {
        self.load_state();
        self.routine_fg_scan().await;

        while self.opermode != OperMode::Exit {
            let event = self.next_event().await;
            self.handle_event(event).await?;
            self.store.save_config();
        }

        self.finalize();
        Ok(())
    }

    fn finalize(&mut self) {
        self.save_state();
        self.dhcp.kill();
        self.store.drop_config();
        self.server.unlink();
    }
}

async fn rawsock_recv(
    sock: &Option<RawSock>,
) -> std::io::Result<(Vec<u8>, [u8; 6])> {
    match sock {
        Some(sock) => sock.recv().await,
        None => std::future::pending().await,
    }
}

async fn rfkill_next(
    rfkill: &mut Option<Rfkill>,
) -> std::io::Result<RfkillEvent> {
    match rfkill {
        Some(rk) => rk.next_event().await,
        None => std::future::pending().await,
    }
}

async fn timer_wait(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
