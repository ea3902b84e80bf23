// SPDX-License-Identifier: MIT

//! On-disk PSK database. The file is a line-per-network text format,
//!
//! ```text
//! 001122...EEFF Blackhole
//! 91234A...47AC public\x09net
//! ```
//!
//! read into memory on first use, edited in place, and written back
//! whole when dirty. SSIDs are arbitrary byte strings; backslash,
//! space and control bytes are escaped so a line always splits on
//! plain whitespace.

use std::fs;
use std::io;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use log::warn;

pub const PSK_LEN: usize = 32;
pub const MAX_CONFIG_SIZE: u64 = 64 * 1024;

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

fn is_space(b: u8) -> bool {
    b == b' ' || b == b'\t' || b == b'\n'
}

fn escape_ssid(ssid: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(ssid.len());
    for &b in ssid {
        match b {
            b'\\' => out.extend_from_slice(b"\\\\"),
            b' ' => out.extend_from_slice(b"\\ "),
            b if b <= 0x20 => {
                out.push(b'\\');
                out.push(b'x');
                out.push(HEX_DIGITS[(b >> 4) as usize]);
                out.push(HEX_DIGITS[(b & 0xF) as usize]);
            }
            b => out.push(b),
        }
    }
    out
}

fn hex_val(b: u8) -> Option<u8> {
    HEX_DIGITS.iter().position(|d| *d == b).map(|i| i as u8)
}

/// Inverse of [`escape_ssid`]. Returns None on a malformed escape.
fn unescape_ssid(chunk: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(chunk.len());
    let mut i = 0;
    while i < chunk.len() {
        if chunk[i] != b'\\' {
            out.push(chunk[i]);
            i += 1;
            continue;
        }
        match chunk.get(i + 1)? {
            b'\\' => out.push(b'\\'),
            b' ' => out.push(b' '),
            b'x' => {
                let hi = hex_val(*chunk.get(i + 2)?)?;
                let lo = hex_val(*chunk.get(i + 3)?)?;
                out.push(hi << 4 | lo);
                i += 2;
            }
            _ => return None,
        }
        i += 2;
    }
    Some(out)
}

fn format_psk(psk: &[u8; PSK_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 * PSK_LEN);
    for &b in psk {
        out.push(HEX_DIGITS[(b >> 4) as usize]);
        out.push(HEX_DIGITS[(b & 0xF) as usize]);
    }
    out
}

fn parse_psk(chunk: &[u8]) -> Option<[u8; PSK_LEN]> {
    if chunk.len() != 2 * PSK_LEN {
        return None;
    }
    let mut psk = [0u8; PSK_LEN];
    for (i, pair) in chunk.chunks_exact(2).enumerate() {
        psk[i] = hex_val(pair[0])? << 4 | hex_val(pair[1])?;
    }
    Some(psk)
}

/// Splits a line into whitespace-delimited chunks; a backslash makes
/// the following byte part of the chunk.
fn split_line(line: &[u8]) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut i = 0;
    while i < line.len() {
        while i < line.len() && is_space(line[i]) {
            i += 1;
        }
        if i >= line.len() {
            break;
        }
        let start = i;
        while i < line.len() && !is_space(line[i]) {
            if line[i] == b'\\' && i + 1 < line.len() {
                i += 1;
            }
            i += 1;
        }
        chunks.push(&line[start..i]);
    }
    chunks
}

#[derive(Debug)]
pub struct PskStore {
    path: PathBuf,
    buf: Option<Vec<u8>>,
    modified: bool,
}

impl PskStore {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        PskStore {
            path: path.into(),
            buf: None,
            modified: false,
        }
    }

    fn load(&mut self) -> io::Result<&mut Vec<u8>> {
        if self.buf.is_none() {
            let data = match fs::metadata(&self.path) {
                Ok(md) if md.len() > MAX_CONFIG_SIZE => {
                    return Err(io::Error::from_raw_os_error(libc::E2BIG));
                }
                Ok(_) => fs::read(&self.path)?,
                Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
                Err(e) => return Err(e),
            };
            self.buf = Some(data);
            self.modified = false;
        }
        Ok(self.buf.as_mut().unwrap())
    }

    /// Byte range of the line whose second chunk equals the escaped
    /// ssid, end exclusive of the newline.
    fn find_ssid_line(
        buf: &[u8],
        ssid: &[u8],
    ) -> Option<(usize, usize)> {
        let needle = escape_ssid(ssid);
        let mut start = 0;
        while start < buf.len() {
            let end = buf[start..]
                .iter()
                .position(|b| *b == b'\n')
                .map(|p| start + p)
                .unwrap_or(buf.len());
            let chunks = split_line(&buf[start..end]);
            if chunks.len() >= 2 && chunks[1] == needle.as_slice() {
                return Some((start, end));
            }
            start = end + 1;
        }
        None
    }

    pub fn got_psk_for(&mut self, ssid: &[u8]) -> bool {
        match self.load() {
            Ok(buf) => Self::find_ssid_line(buf, ssid).is_some(),
            Err(e) => {
                warn!("config: {e}");
                false
            }
        }
    }

    pub fn load_psk(
        &mut self,
        ssid: &[u8],
    ) -> io::Result<Option<[u8; PSK_LEN]>> {
        let buf = self.load()?;
        let Some((start, end)) = Self::find_ssid_line(buf, ssid) else {
            return Ok(None);
        };
        let chunks = split_line(&buf[start..end]);
        Ok(parse_psk(chunks[0]))
    }

    /// Inserts a record, or replaces the line in place when the SSID
    /// is already present. The file never holds duplicate SSIDs.
    pub fn save_psk(
        &mut self,
        ssid: &[u8],
        psk: &[u8; PSK_LEN],
    ) -> io::Result<()> {
        let mut line = format_psk(psk);
        line.push(b' ');
        line.extend_from_slice(&escape_ssid(ssid));

        let buf = self.load()?;
        match Self::find_ssid_line(buf, ssid) {
            Some((start, end)) => {
                buf.splice(start..end, line);
            }
            None => {
                buf.extend_from_slice(&line);
                buf.push(b'\n');
            }
        }
        self.modified = true;
        Ok(())
    }

    /// Removes the record. Ok(false) when the SSID was not stored.
    pub fn drop_psk(&mut self, ssid: &[u8]) -> io::Result<bool> {
        let buf = self.load()?;
        let Some((start, end)) = Self::find_ssid_line(buf, ssid) else {
            return Ok(false);
        };
        let end = if end < buf.len() { end + 1 } else { end };
        buf.drain(start..end);
        self.modified = true;
        Ok(true)
    }

    /// Flushes the buffer back to disk if anything changed. Failure to
    /// write is logged and retried on the next flush.
    pub fn save_config(&mut self) {
        if !self.modified {
            return;
        }
        let Some(buf) = self.buf.as_ref() else { return };

        let res = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&self.path)
            .and_then(|mut f| f.write_all(buf));

        match res {
            Ok(()) => self.modified = false,
            Err(e) => warn!("cannot write {}: {e}", self.path.display()),
        }
    }

    /// Flushes and releases the in-memory copy.
    pub fn drop_config(&mut self) {
        self.save_config();
        self.buf = None;
        self.modified = false;
    }

    #[cfg(test)]
    fn is_loaded(&self) -> bool {
        self.buf.is_some()
    }

    #[cfg(test)]
    fn is_modified(&self) -> bool {
        self.modified
    }
}

/// Reads the pinned-AP record (raw SSID bytes) and unlinks it, so a
/// crash loop cannot keep chasing a stale network.
pub fn load_pinned(path: &Path) -> Option<Vec<u8>> {
    let data = fs::read(path).ok()?;
    let _ = fs::remove_file(path);
    if data.is_empty() || data.len() > 32 {
        return None;
    }
    Some(data)
}

pub fn save_pinned(path: &Path, ssid: &[u8]) {
    let res = fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .and_then(|mut f| f.write_all(ssid));
    if let Err(e) = res {
        warn!("cannot write {}: {e}", path.display());
    }
}
