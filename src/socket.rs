//! Per-fd socket state (spec §3) and `SockInfo` materialization (§4.5).

use serde::Serialize;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::event::SockAddrCapture;
use crate::event::SockEvent;

const SOCK_TYPE_MASK: i32 = 0b1111;

/// Domain/type/protocol/flags, captured once when a socket is created
/// or first observed. Copied verbatim onto duplicated entries (accept,
/// dup family) so a socket born from `accept()` carries the same
/// `SockInfo` as its listening parent, per spec §4.4's duplication rule.
#[derive(Clone, Copy, Debug, Default, Serialize)]
pub struct SockInfo {
    pub domain: i32,
    #[serde(rename = "type")]
    pub sock_type: i32,
    pub protocol: i32,
    pub cloexec: bool,
    pub nonblock: bool,
    pub filled: bool,
}

impl SockInfo {
    /// `fill_sock_info` (sock_events.c:180-192): used on `socket()`,
    /// where domain/type/protocol are the caller's own arguments.
    pub fn from_socket_args(domain: i32, sock_type: i32, protocol: i32) -> SockInfo {
        SockInfo {
            domain,
            sock_type: sock_type & SOCK_TYPE_MASK,
            protocol,
            cloexec: sock_type & libc::SOCK_CLOEXEC != 0,
            nonblock: sock_type & libc::SOCK_NONBLOCK != 0,
            filled: true,
        }
    }

    /// `fill_sock_info_from_fd` (sock_events.c:194-212): used for ghost
    /// entries and other internal queries, where we only have the fd.
    pub fn from_fd(fd: RawFd) -> SockInfo {
        let domain = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_DOMAIN).unwrap_or(0);
        let protocol = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_PROTOCOL).unwrap_or(0);
        let raw_type = getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TYPE).unwrap_or(0);
        SockInfo {
            domain,
            sock_type: raw_type & SOCK_TYPE_MASK,
            protocol,
            cloexec: raw_type & libc::SOCK_CLOEXEC != 0,
            nonblock: raw_type & libc::SOCK_NONBLOCK != 0,
            filled: true,
        }
    }
}

/// Issues the *real* `getsockopt`, bypassing any recording wrapper —
/// mirrors `my_getsockopt` (lib.c:30-42), which resolves the original
/// libc symbol via `dlsym` precisely so introspection never re-enters
/// the recording path. This crate has no interposition layer to avoid
/// re-entering, but keeps the same discipline: these calls never
/// themselves produce a recorded event.
fn getsockopt_int(fd: RawFd, level: i32, optname: i32) -> Option<i32> {
    let mut val: i32 = 0;
    let mut len = std::mem::size_of::<i32>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            &mut val as *mut i32 as *mut libc::c_void,
            &mut len,
        )
    };
    if rc == 0 {
        Some(val)
    } else {
        log::error!("getsockopt() failed: {}", std::io::Error::last_os_error());
        None
    }
}

/// `is_socket`/`is_inet_socket`/`is_tcp_socket` (lib.c:47-95), used to
/// gate TCP-info sampling (§4.7) and AF_PACKET exclusion during capture
/// (§6). `capture_in_progress` is the crate's `CONF_OPT_C`.
pub fn is_socket(fd: RawFd) -> bool {
    let mut statbuf: libc::stat = unsafe { std::mem::zeroed() };
    if unsafe { libc::fstat(fd, &mut statbuf) } != 0 {
        log::error!("fstat() failed: {}", std::io::Error::last_os_error());
        return false;
    }
    statbuf.st_mode & libc::S_IFMT == libc::S_IFSOCK
}

pub fn is_inet_socket(fd: RawFd, capture_in_progress: bool) -> bool {
    if !is_socket(fd) {
        return false;
    }
    match getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_DOMAIN) {
        // pcap_open_live() opens an AF_PACKET socket; tracing it while a
        // capture is in progress would recursively trace our own
        // side-car's socket activity and deadlock the capture path.
        Some(d) => d == libc::AF_INET || d == libc::AF_INET6 || (!capture_in_progress && d == libc::AF_PACKET),
        None => false,
    }
}

pub fn is_tcp_socket(fd: RawFd, capture_in_progress: bool) -> bool {
    if !is_inet_socket(fd, capture_in_progress) {
        return false;
    }
    matches!(getsockopt_int(fd, libc::SOL_SOCKET, libc::SO_TYPE), Some(t) if t == libc::SOCK_STREAM)
}

/// One live fd's accumulated state (spec §3).
#[derive(Debug)]
pub struct Socket {
    pub id: u64,
    pub fd: RawFd,
    pub sock_info: SockInfo,
    pub bound: bool,
    pub bound_addr: Option<SockAddrCapture>,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub last_info_dump_micros: u64,
    pub last_info_dump_bytes: u64,
    pub rtt: u32,
    pub events: Vec<SockEvent>,
    pub capture_handle: Option<crate::capture::CaptureHandle>,
}

impl Socket {
    pub fn new(id: u64, fd: RawFd) -> Socket {
        Socket {
            id,
            fd,
            sock_info: SockInfo::default(),
            bound: false,
            bound_addr: None,
            bytes_sent: 0,
            bytes_received: 0,
            last_info_dump_micros: 0,
            last_info_dump_bytes: 0,
            rtt: 0,
            events: Vec::new(),
            capture_handle: None,
        }
    }

    /// Per-socket sequence number for the next event (`events.count` in
    /// the original).
    pub fn next_event_id(&self) -> u64 {
        self.events.len() as u64
    }

    pub fn push_event(&mut self, ev: SockEvent) {
        self.events.push(ev);
    }

    /// `should_dump_tcp_info` (sock_events.c:376-392).
    pub fn should_dump_tcp_info(&self, interval_usec: u64, byte_threshold: u64, now: u64) -> bool {
        if interval_usec > 0 && now.saturating_sub(self.last_info_dump_micros) > interval_usec {
            return true;
        }
        if byte_threshold > 0 {
            let cur_bytes = self.bytes_sent + self.bytes_received;
            if cur_bytes.saturating_sub(self.last_info_dump_bytes) > byte_threshold {
                return true;
            }
        }
        false
    }

    /// Grace period before the capture side-car is told to stop, so
    /// in-flight packets still land in the pcap file (spec §4.8 step 5).
    pub fn capture_grace_period(&self) -> Duration {
        Duration::from_micros(2 * self.rtt as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_socket_args_masks_type_and_extracts_flags() {
        let si = SockInfo::from_socket_args(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_CLOEXEC | libc::SOCK_NONBLOCK,
            0,
        );
        assert_eq!(si.sock_type, libc::SOCK_STREAM & SOCK_TYPE_MASK);
        assert!(si.cloexec);
        assert!(si.nonblock);
        assert!(si.filled);
    }

    #[test]
    fn tcp_info_sampling_fires_on_byte_threshold() {
        let mut sock = Socket::new(0, 3);
        sock.bytes_sent = 20_000;
        assert!(sock.should_dump_tcp_info(0, 10_000, 0));
        assert!(!sock.should_dump_tcp_info(0, 30_000, 0));
    }

    #[test]
    fn tcp_info_sampling_fires_on_time_interval() {
        let mut sock = Socket::new(0, 3);
        sock.last_info_dump_micros = 1_000;
        assert!(sock.should_dump_tcp_info(500, 0, 2_000));
        assert!(!sock.should_dump_tcp_info(5_000, 0, 2_000));
    }

    #[test]
    fn event_ids_increase_with_each_push() {
        let sock = Socket::new(0, 3);
        assert_eq!(sock.next_event_id(), 0);
    }
}
