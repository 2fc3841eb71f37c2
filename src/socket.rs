//! Raw `AF_PACKET` socket primitives (the socket half of C3).
//!
//! Adapted directly from the teacher crate's `socket.rs`: a thin,
//! directly-`libc` wrapper around `socket()`/`setsockopt()`/`bind()`/
//! `ioctl()`, no abstraction layer in between. Constant values not yet
//! exposed by the `libc` crate are defined locally, matching
//! `<linux/if_packet.h>`, the same way the teacher crate does.

use libc::{
    bind, c_char, c_int, c_short, c_uint, c_ulong, c_void, getsockopt, if_indextoname,
    if_nametoindex, ioctl, recvfrom, sockaddr, sockaddr_ll, setsockopt, socket, socklen_t,
    timeval, AF_PACKET, EAGAIN, ETH_ALEN, EWOULDBLOCK, IF_NAMESIZE, SOCK_RAW, SOL_PACKET,
    SOL_SOCKET, SO_RCVTIMEO,
};

use crate::worker::Direction;

use std::ffi::CString;
use std::io::{self, Error, ErrorKind};
use std::mem;

const ETH_P_ALL: u16 = 0x0003;
const IFREQUNIONSIZE: usize = 24;

/// `sll_pkttype` value the kernel stamps on a frame the host itself sent,
/// versus every other value which means the frame arrived off the wire
/// (§4.5 step 4, `<linux/if_packet.h>`).
const PACKET_OUTGOING: u8 = 4;

const SIOCGIFFLAGS: c_ulong = 0x8913;
const SIOCSIFFLAGS: c_ulong = 0x8914;
pub const IFF_PROMISC: c_short = 0x100;

pub const PACKET_RX_RING: c_int = 5;
pub const PACKET_TX_RING: c_int = 13;
pub const PACKET_STATISTICS: c_int = 6;
pub const PACKET_FANOUT: c_int = 18;

/// `struct tpacket_req` with every field zeroed: a no-op `PACKET_RX_RING`/
/// `PACKET_TX_RING` configuration, retained per §4.3 as a placeholder for
/// a future uplift to memory-mapped rings. The engine never mmaps
/// anything; this socket option is set purely for parity with tools that
/// expect it to be present.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TpacketReqZero {
    pub tp_block_size: c_uint,
    pub tp_block_nr: c_uint,
    pub tp_frame_size: c_uint,
    pub tp_frame_nr: c_uint,
}

/// Matches `struct tpacket_stats` from `<linux/if_packet.h>`.
#[derive(Clone, Copy, Debug, Default)]
#[repr(C)]
pub struct TpacketStats {
    pub tp_packets: c_uint,
    pub tp_drops: c_uint,
}

#[repr(C)]
struct IfReq {
    ifr_name: [c_char; IF_NAMESIZE],
    data: [u8; IFREQUNIONSIZE],
}

impl IfReq {
    fn as_short(&self) -> c_short {
        c_short::from_ne_bytes([self.data[0], self.data[1]])
    }

    fn from_short(i: c_short) -> IfReq {
        let mut req = IfReq::default();
        let bytes = i.to_ne_bytes();
        req.data[0] = bytes[0];
        req.data[1] = bytes[1];
        req
    }

    fn with_if_name(if_name: &str) -> io::Result<IfReq> {
        let mut if_req = IfReq::default();

        if if_name.len() >= if_req.ifr_name.len() {
            return Err(Error::new(ErrorKind::Other, "interface name too long"));
        }

        for (dst, src) in if_req.ifr_name.iter_mut().zip(if_name.bytes()) {
            *dst = src as c_char;
        }

        Ok(if_req)
    }

    fn ifr_flags(&self) -> c_short {
        self.as_short()
    }
}

impl Default for IfReq {
    fn default() -> IfReq {
        IfReq {
            ifr_name: [0; IF_NAMESIZE],
            data: [0; IFREQUNIONSIZE],
        }
    }
}

/// One ring's `AF_PACKET` socket, bound to an interface (or none, for
/// "any"). Owns the raw fd for its lifetime.
#[derive(Debug)]
pub struct Socket {
    pub fd: c_int,
    pub if_name: String,
    pub if_index: c_uint,
}

impl Socket {
    /// Opens a raw, layer-2 socket capturing every protocol. `if_index`
    /// of `0` is "any interface" and is resolved by the caller before
    /// construction (§4.3: binding happens as a separate, later step).
    pub fn open(if_name: &str, if_index: c_uint) -> io::Result<Socket> {
        let fd = unsafe { socket(AF_PACKET, SOCK_RAW, (ETH_P_ALL.to_be() as c_int).to_be()) };
        if fd < 0 {
            return Err(Error::last_os_error());
        }

        Ok(Socket {
            fd,
            if_name: if_name.to_string(),
            if_index,
        })
    }

    fn ioctl(&self, ident: c_ulong, if_req: IfReq) -> io::Result<IfReq> {
        let mut req = if_req;
        match unsafe { ioctl(self.fd, ident, &mut req as *mut IfReq) } {
            -1 => Err(Error::last_os_error()),
            _ => Ok(req),
        }
    }

    fn get_flags(&self) -> io::Result<IfReq> {
        self.ioctl(SIOCGIFFLAGS, IfReq::with_if_name(&self.if_name)?)
    }

    /// Ors `flag` into the interface's current flags. Used to enable
    /// promiscuous mode (§4.4): enabled once, never disabled by the
    /// engine, persisting for the lifetime of the process.
    pub fn set_flag(&self, flag: c_short) -> io::Result<()> {
        let current = self.get_flags()?.ifr_flags();
        let mut if_req = IfReq::with_if_name(&self.if_name)?;
        if_req.data = IfReq::from_short(current | flag).data;
        self.ioctl(SIOCSIFFLAGS, if_req)?;
        Ok(())
    }

    fn setsockopt<T>(&self, level: c_int, opt: c_int, opt_val: &T) -> io::Result<()> {
        match unsafe {
            setsockopt(
                self.fd,
                level,
                opt,
                opt_val as *const T as *const c_void,
                mem::size_of::<T>() as socklen_t,
            )
        } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    fn getsockopt<T: Default>(&self, level: c_int, opt: c_int) -> io::Result<T> {
        let mut val = T::default();
        let mut len = mem::size_of::<T>() as socklen_t;
        match unsafe { getsockopt(self.fd, level, opt, &mut val as *mut T as *mut c_void, &mut len) } {
            0 => Ok(val),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Installs a zero-sized, no-op `PACKET_RX_RING`/`PACKET_TX_RING`
    /// configuration (§4.3).
    pub fn set_ring_options_noop(&self) -> io::Result<()> {
        let req = TpacketReqZero::default();
        self.setsockopt(SOL_PACKET, PACKET_RX_RING, &req)?;
        self.setsockopt(SOL_PACKET, PACKET_TX_RING, &req)?;
        Ok(())
    }

    /// Sets the receive timeout so worker loops can poll their shutdown
    /// flags instead of blocking on `recvfrom` indefinitely.
    pub fn set_recv_timeout(&self, micros: i64) -> io::Result<()> {
        let tv = timeval {
            tv_sec: micros / 1_000_000,
            tv_usec: (micros % 1_000_000) as libc::suseconds_t,
        };
        self.setsockopt(SOL_SOCKET, SO_RCVTIMEO, &tv)
    }

    /// Binds to `self.if_index` (`0` means any interface), accepting
    /// every packet type (host, broadcast, multicast, other-host,
    /// outgoing).
    pub fn bind(&self) -> io::Result<()> {
        let mut addr: sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = AF_PACKET as u16;
        addr.sll_protocol = ETH_P_ALL.to_be();
        addr.sll_ifindex = self.if_index as c_int;
        addr.sll_halen = ETH_ALEN as u8;

        let size = mem::size_of::<sockaddr_ll>() as socklen_t;
        let addr_ptr = &mut addr as *mut sockaddr_ll as *mut sockaddr;

        match unsafe { bind(self.fd, addr_ptr, size) } {
            0 => Ok(()),
            _ => Err(io::Error::last_os_error()),
        }
    }

    /// Joins fanout group `group_id` using `mode` (the caller encodes
    /// any auxiliary data fd requirement into the mode value itself,
    /// matching `PACKET_FANOUT`'s wire format of `group_id | mode << 16`).
    pub fn join_fanout_group(&self, group_id: u16, mode: c_int) -> io::Result<()> {
        let arg: c_int = (group_id as c_int) | (mode << 16);
        self.setsockopt(SOL_PACKET, PACKET_FANOUT, &arg)
    }

    /// Reads and resets the kernel's per-socket `tp_packets`/`tp_drops`
    /// counters (reset on every call, per `packet(7)`).
    pub fn read_tpacket_stats(&self) -> io::Result<TpacketStats> {
        self.getsockopt(SOL_PACKET, PACKET_STATISTICS)
    }

    /// Receives one frame into `buf`, reporting its direction from the
    /// kernel's `sll_pkttype` (§4.5 step 3-4). Returns `Ok(None)` on the
    /// socket's receive timeout (`EAGAIN`/`EWOULDBLOCK`) rather than
    /// blocking indefinitely, so worker loops can poll their shutdown
    /// flags.
    pub fn recv_with_direction(&self, buf: &mut [u8]) -> io::Result<Option<(usize, Direction)>> {
        let mut addr: sockaddr_ll = unsafe { mem::zeroed() };
        let mut addr_len = mem::size_of::<sockaddr_ll>() as socklen_t;

        let n = unsafe {
            recvfrom(
                self.fd,
                buf.as_mut_ptr() as *mut c_void,
                buf.len(),
                0,
                &mut addr as *mut sockaddr_ll as *mut sockaddr,
                &mut addr_len,
            )
        };

        if n < 0 {
            let err = Error::last_os_error();
            return match err.raw_os_error() {
                Some(code) if code == EAGAIN || code == EWOULDBLOCK => Ok(None),
                _ => Err(err),
            };
        }

        let direction = if addr.sll_pkttype == PACKET_OUTGOING {
            Direction::Tx
        } else {
            Direction::Rx
        };

        Ok(Some((n as usize, direction)))
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

/// Resolves an interface name to its kernel ifindex. Empty name resolves
/// to `0` ("any interface"), matching the Descriptor's convention (§3).
pub fn get_if_index(name: &str) -> io::Result<c_uint> {
    if name.is_empty() {
        return Ok(0);
    }
    let cname = CString::new(name)?;
    let index = unsafe { if_nametoindex(cname.as_ptr()) };
    if index == 0 {
        return Err(io::Error::new(
            ErrorKind::NotFound,
            format!("no such interface '{name}'"),
        ));
    }
    Ok(index)
}

/// Resolves a kernel ifindex back to its interface name, the reverse of
/// [`get_if_index`], used when a Descriptor is configured by ifindex
/// directly rather than by name.
pub fn get_if_name(ifindex: c_uint) -> io::Result<String> {
    let mut buf = [0 as c_char; IF_NAMESIZE];
    let ptr = unsafe { if_indextoname(ifindex, buf.as_mut_ptr()) };
    if ptr.is_null() {
        return Err(io::Error::last_os_error());
    }
    let cstr = unsafe { std::ffi::CStr::from_ptr(ptr) };
    Ok(cstr.to_string_lossy().into_owned())
}

/// Opens a throwaway socket on `if_name` and enables `IFF_PROMISC`. The
/// kernel retains promiscuity for the interface regardless of this
/// socket's lifetime, so the socket is dropped immediately after (§4.4:
/// enabled once, never disabled by the engine).
pub fn set_promiscuous(if_name: &str) -> io::Result<()> {
    let socket = Socket::open(if_name, 0)?;
    socket.set_flag(IFF_PROMISC)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_if_index_any_interface_is_zero() {
        assert_eq!(get_if_index("").unwrap(), 0);
    }

    #[test]
    fn get_if_index_rejects_unknown_interface() {
        assert!(get_if_index("definitely-not-a-real-iface0").is_err());
    }
}
