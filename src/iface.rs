// SPDX-License-Identifier: MIT

//! The non-netlink kernel surface: interface ioctls and the AF_PACKET
//! socket the EAPOL handshake runs over.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use log::warn;
use tokio::io::unix::AsyncFd;

/// EtherType for EAPOL (802.1X port access entity) frames.
pub const ETH_P_PAE: u16 = 0x888E;

const ARPHRD_ETHER: u16 = 1;

/// Maximum EAPOL frame this daemon will look at; anything bigger is
/// not a key frame.
pub const EAPOL_BUF_SIZE: usize = 1024;

#[derive(Debug, Clone)]
pub struct Iface {
    pub name: String,
    pub index: u32,
    pub mac: [u8; 6],
}

fn check(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

fn check_len(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

fn ifreq_for(name: &str) -> io::Result<libc::ifreq> {
    let mut ifr: libc::ifreq = unsafe { mem::zeroed() };
    let bytes = name.as_bytes();
    if bytes.len() >= ifr.ifr_name.len() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("interface name too long: {name}"),
        ));
    }
    for (dst, src) in ifr.ifr_name.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    Ok(ifr)
}

/// Short-lived datagram socket for interface ioctls.
struct IoctlSock(OwnedFd);

impl IoctlSock {
    fn open() -> io::Result<Self> {
        let fd = check(unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_DGRAM | libc::SOCK_CLOEXEC,
                0,
            )
        })?;
        Ok(IoctlSock(unsafe { OwnedFd::from_raw_fd(fd) }))
    }

    fn ioctl(
        &self,
        request: libc::Ioctl,
        ifr: &mut libc::ifreq,
    ) -> io::Result<()> {
        check(unsafe {
            libc::ioctl(self.0.as_raw_fd(), request, ifr as *mut _)
        })
        .map(|_| ())
    }
}

/// Resolves the interface index and hardware address, the two pieces
/// of identity everything else keys on.
pub fn setup_iface(name: &str) -> io::Result<Iface> {
    let sock = IoctlSock::open()?;

    let mut ifr = ifreq_for(name)?;
    sock.ioctl(libc::SIOCGIFINDEX, &mut ifr)?;
    let index = unsafe { ifr.ifr_ifru.ifru_ifindex } as u32;

    let mut ifr = ifreq_for(name)?;
    sock.ioctl(libc::SIOCGIFHWADDR, &mut ifr)?;
    let hwaddr = unsafe { ifr.ifr_ifru.ifru_hwaddr };
    if hwaddr.sa_family != ARPHRD_ETHER {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unexpected hwaddr family on {name}"),
        ));
    }
    let mut mac = [0u8; 6];
    for (dst, src) in mac.iter_mut().zip(hwaddr.sa_data.iter()) {
        *dst = *src as u8;
    }

    Ok(Iface {
        name: name.to_string(),
        index,
        mac,
    })
}

/// `ifconfig <iface> up`, done with plain ioctls; setting up rtnetlink
/// for this one flag is not worth it.
pub fn bring_iface_up(name: &str) -> io::Result<()> {
    let sock = IoctlSock::open()?;

    let mut ifr = ifreq_for(name)?;
    sock.ioctl(libc::SIOCGIFFLAGS, &mut ifr)?;
    let flags = unsafe { ifr.ifr_ifru.ifru_flags };
    if flags & libc::IFF_UP as libc::c_short != 0 {
        return Ok(());
    }
    ifr.ifr_ifru.ifru_flags = flags | libc::IFF_UP as libc::c_short;
    sock.ioctl(libc::SIOCSIFFLAGS, &mut ifr)
}

/// AF_PACKET socket bound to the interface and the PAE EtherType. A
/// socket bound to an interface enters a failed state when the
/// interface goes down under rfkill; the daemon drops it and reopens
/// on restore.
pub struct RawSock {
    fd: AsyncFd<OwnedFd>,
    ifindex: u32,
}

impl RawSock {
    pub fn open(ifindex: u32) -> io::Result<Self> {
        let proto = ETH_P_PAE.to_be() as libc::c_int;
        let fd = check(unsafe {
            libc::socket(
                libc::AF_PACKET,
                libc::SOCK_DGRAM
                    | libc::SOCK_NONBLOCK
                    | libc::SOCK_CLOEXEC,
                proto,
            )
        })?;
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_PAE.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;

        check(unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })?;

        Ok(RawSock {
            fd: AsyncFd::new(fd)?,
            ifindex,
        })
    }

    /// One frame and its source MAC. Pends until the socket is
    /// readable; an error means the socket is dead and should be
    /// dropped.
    pub async fn recv(&self) -> io::Result<(Vec<u8>, [u8; 6])> {
        loop {
            let mut guard = self.fd.readable().await?;
            match guard.try_io(|inner| {
                recv_from(inner.get_ref().as_raw_fd())
            }) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Sends a key frame to the AP. Failure here means the handshake
    /// cannot proceed; the caller aborts the connection.
    pub fn send_to(&self, frame: &[u8], dest: [u8; 6]) -> io::Result<()> {
        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as libc::sa_family_t;
        addr.sll_protocol = ETH_P_PAE.to_be();
        addr.sll_ifindex = self.ifindex as libc::c_int;
        addr.sll_halen = 6;
        addr.sll_addr[..6].copy_from_slice(&dest);

        let sent = check_len(unsafe {
            libc::sendto(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        })?;

        if sent != frame.len() {
            warn!("EAPOL send incomplete");
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "short EAPOL send",
            ));
        }
        Ok(())
    }
}

fn recv_from(fd: RawFd) -> io::Result<(Vec<u8>, [u8; 6])> {
    let mut buf = vec![0u8; EAPOL_BUF_SIZE];
    let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
    let mut addrlen =
        mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;

    let read = check_len(unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
            0,
            &mut addr as *mut _ as *mut libc::sockaddr,
            &mut addrlen,
        )
    })?;

    buf.truncate(read);
    let mut src = [0u8; 6];
    src.copy_from_slice(&addr.sll_addr[..6]);
    Ok((buf, src))
}
