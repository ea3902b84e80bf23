// SPDX-License-Identifier: MIT

//! Control socket server half: client slots, framed reads, replies
//! and asynchronous report fan-out. Command semantics live with the
//! daemon; this file only moves bytes.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::warn;
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

use super::wire::{CtrlAttr, CtrlBuf, CtrlMessage};

/// Client connection slots; a busy box has the status tool and maybe
/// one script attached, so contention here means something is wrong.
pub const NCONNS: usize = 8;

/// A stuck subscriber must not stall the daemon; writes get this long
/// and then the connection goes away (the ITIMER_REAL trick of the
/// original, in clock form).
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

const READ_CHUNK: usize = 1024;

pub type Reply = Result<CtrlMessage, i32>;

pub struct ClientConn {
    stream: UnixStream,
    buf: CtrlBuf,
    /// Receives REP_WI_* notifications until it asks for STATUS.
    pub subscribed: bool,
}

pub struct ControlServer {
    listener: UnixListener,
    path: PathBuf,
    conns: Vec<Option<ClientConn>>,
}

impl ControlServer {
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let listener = UnixListener::bind(&path)?;
        let mut conns = Vec::with_capacity(NCONNS);
        conns.resize_with(NCONNS, || None);
        Ok(ControlServer {
            listener,
            path,
            conns,
        })
    }

    pub async fn accept(&self) -> io::Result<UnixStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }

    /// Parks the new client in a free slot; with all slots taken the
    /// stream is dropped, closing the connection.
    pub fn add_conn(&mut self, stream: UnixStream) {
        if let Some(slot) = self.conns.iter_mut().find(|c| c.is_none()) {
            *slot = Some(ClientConn {
                stream,
                buf: CtrlBuf::new(),
                subscribed: false,
            });
        }
    }

    /// Pends until some client connection is readable and says which.
    /// With no clients attached this pends forever.
    pub async fn conn_readable(&self) -> usize {
        let futs: Vec<_> = self
            .conns
            .iter()
            .enumerate()
            .filter_map(|(i, c)| {
                c.as_ref().map(|c| {
                    Box::pin(async move {
                        // an error also reads as readiness; the
                        // subsequent read surfaces it
                        let _ = c.stream.readable().await;
                        i
                    })
                })
            })
            .collect();
        if futs.is_empty() {
            return std::future::pending().await;
        }
        let (i, _, _) = futures::future::select_all(futs).await;
        i
    }

    /// Drains whatever the client has sent and returns the complete
    /// requests in it. A closed or misbehaving connection is dropped
    /// here and yields no messages.
    pub fn read_conn(&mut self, i: usize) -> Vec<CtrlMessage> {
        let mut msgs = Vec::new();
        let mut dead = false;

        let Some(conn) = self.conns.get_mut(i).and_then(Option::as_mut)
        else {
            return msgs;
        };

        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match conn.stream.try_read(&mut chunk) {
                Ok(0) => {
                    dead = true;
                    break;
                }
                Ok(n) => conn.buf.push(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    dead = true;
                    break;
                }
            }
        }

        if !dead {
            loop {
                match conn.buf.next_message() {
                    Ok(Some(msg)) => msgs.push(msg),
                    Ok(None) => break,
                    Err(e) => {
                        warn!("control: dropping client: {e}");
                        dead = true;
                        break;
                    }
                }
            }
        }

        if dead {
            // requests already framed still get handled; their
            // replies just have nowhere to go
            self.conns[i] = None;
        }
        msgs
    }

    pub fn subscribe(&mut self, i: usize, on: bool) {
        if let Some(conn) = self.conns.get_mut(i).and_then(Option::as_mut)
        {
            conn.subscribed = on;
        }
    }

    /// Sends the synchronous reply for one command: cmd 0 with
    /// attributes on success, bare negative errno otherwise.
    pub async fn send_reply(&mut self, i: usize, reply: Reply) {
        let msg = match reply {
            Ok(msg) => msg,
            Err(errno) => CtrlMessage::new(-errno.abs()),
        };
        let raw = msg.emit();
        let Some(conn) = self.conns.get_mut(i).and_then(Option::as_mut)
        else {
            return;
        };
        if write_bounded(&mut conn.stream, &raw).await.is_err() {
            self.conns[i] = None;
        }
    }

    /// Fans a report out to every subscribed client, in slot order.
    /// Slow or dead subscribers are dropped on the spot.
    pub async fn send_report(&mut self, msg: &CtrlMessage) {
        let raw = msg.emit();
        for slot in &mut self.conns {
            let Some(conn) = slot else { continue };
            if !conn.subscribed {
                continue;
            }
            if write_bounded(&mut conn.stream, &raw).await.is_err() {
                *slot = None;
            }
        }
    }

    pub fn unlink(&self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

async fn write_bounded(
    stream: &mut UnixStream,
    raw: &[u8],
) -> io::Result<()> {
    match timeout(WRITE_TIMEOUT, stream.write_all(raw)).await {
        Ok(res) => res,
        Err(_elapsed) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            "client write stalled",
        )),
    }
}

/// Simple report with no attributes.
pub fn report_simple(cmd: i32) -> CtrlMessage {
    CtrlMessage::new(cmd)
}

/// Station report carrying the AP identity.
pub fn report_station(
    cmd: i32,
    bssid: [u8; 6],
    ssid: &[u8],
    freq: u32,
) -> CtrlMessage {
    let mut msg = CtrlMessage::new(cmd);
    msg.attrs.push(CtrlAttr::Bssid(bssid));
    msg.attrs.push(CtrlAttr::Ssid(ssid.to_vec()));
    msg.attrs.push(CtrlAttr::Freq(freq as i32));
    msg
}
