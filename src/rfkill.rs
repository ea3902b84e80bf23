// SPDX-License-Identifier: MIT

//! `/dev/rfkill` watcher. When a card is rf-killed the link loses
//! IFF_UP, but un-kill produces no rtnetlink notification at all; the
//! only somewhat reliable signal is the rfkill event device. The
//! device is provided by a module that may not be loaded, so failure
//! to open is a degraded state and reopening is retried on suitable
//! occasions.
//!
//! Event indices do not match netdev ifindexes. The binding trick is
//! to look for `rfkill*` entries under the interface's `phy80211`
//! sysfs directory; the association is stable at least as long as the
//! fd stays open.

use std::fs;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use tokio::io::unix::AsyncFd;

pub const RFKILL_TYPE_WLAN: u8 = 1;

const EVENT_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RfkillEvent {
    pub idx: u32,
    pub kind: u8,
    pub op: u8,
    pub soft: bool,
    pub hard: bool,
}

impl RfkillEvent {
    pub fn blocked(&self) -> bool {
        self.soft || self.hard
    }

    /// Parses one event record. Kernels newer than the original 8-byte
    /// layout append fields; anything past the first 8 bytes is
    /// irrelevant here.
    pub fn parse(buf: &[u8]) -> Option<Self> {
        if buf.len() < EVENT_LEN {
            return None;
        }
        Some(RfkillEvent {
            idx: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            kind: buf[4],
            op: buf[5],
            soft: buf[6] != 0,
            hard: buf[7] != 0,
        })
    }
}

/// True when the interface's PHY exposes any rfkill node. The numeric
/// suffix is deliberately not compared; see DESIGN.md.
fn match_rfkill(ifname: &str) -> bool {
    let dir = format!("/sys/class/net/{ifname}/phy80211");
    match_rfkill_in(Path::new(&dir))
}

fn match_rfkill_in(dir: &Path) -> bool {
    let Ok(entries) = fs::read_dir(dir) else {
        return false;
    };
    entries
        .flatten()
        .any(|e| e.file_name().to_string_lossy().starts_with("rfkill"))
}

pub struct Rfkill {
    fd: AsyncFd<OwnedFd>,
    idx: Option<u32>,
}

impl Rfkill {
    pub fn open(path: &str) -> io::Result<Self> {
        let cpath = std::ffi::CString::new(path).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "bad rfkill path")
        })?;
        let fd = unsafe {
            let ret = libc::open(
                cpath.as_ptr(),
                libc::O_RDONLY | libc::O_NONBLOCK | libc::O_CLOEXEC,
            );
            if ret < 0 {
                return Err(io::Error::last_os_error());
            }
            OwnedFd::from_raw_fd(ret)
        };
        Ok(Rfkill {
            fd: AsyncFd::new(fd)?,
            idx: None,
        })
    }

    /// Next WLAN event. An I/O error means the device went away; the
    /// caller closes and later retries the open.
    pub async fn next_event(&mut self) -> io::Result<RfkillEvent> {
        loop {
            let mut guard = self.fd.readable().await?;
            let res = guard.try_io(|inner| {
                read_event(inner.get_ref().as_raw_fd())
            });
            match res {
                Ok(Ok(Some(ev))) if ev.kind == RFKILL_TYPE_WLAN => {
                    return Ok(ev)
                }
                Ok(Ok(_)) => continue, // short record or other radio
                Ok(Err(e)) => return Err(e),
                Err(_would_block) => continue,
            }
        }
    }

    /// Decides whether an event concerns our interface, binding the
    /// event index on first sight.
    pub fn claims(&mut self, ev: &RfkillEvent, ifname: &str) -> bool {
        match self.idx {
            Some(idx) => ev.idx == idx,
            None => {
                if match_rfkill(ifname) {
                    self.idx = Some(ev.idx);
                    true
                } else {
                    false
                }
            }
        }
    }
}

fn read_event(fd: RawFd) -> io::Result<Option<RfkillEvent>> {
    let mut buf = [0u8; 128];
    let read = unsafe {
        libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
    };
    if read < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(RfkillEvent::parse(&buf[..read as usize]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_record_parses() {
        let ev = RfkillEvent::parse(&[2, 0, 0, 0, 1, 2, 1, 0]).unwrap();
        assert_eq!(ev.idx, 2);
        assert_eq!(ev.kind, RFKILL_TYPE_WLAN);
        assert!(ev.soft);
        assert!(!ev.hard);
        assert!(ev.blocked());

        let ev = RfkillEvent::parse(&[2, 0, 0, 0, 1, 2, 0, 0]).unwrap();
        assert!(!ev.blocked());
    }

    #[test]
    fn extended_records_are_accepted_short_ones_not() {
        // rfkill_event_ext appends a reason byte
        assert!(RfkillEvent::parse(&[1, 0, 0, 0, 1, 0, 0, 1, 9]).is_some());
        assert!(RfkillEvent::parse(&[1, 0, 0, 0, 1, 0, 0]).is_none());
    }

    #[test]
    fn sysfs_match_looks_for_rfkill_prefix() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!match_rfkill_in(dir.path()));
        fs::create_dir(dir.path().join("rfkill3")).unwrap();
        assert!(match_rfkill_in(dir.path()));
    }
}
