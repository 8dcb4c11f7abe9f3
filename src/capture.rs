//! Packet-capture integration (spec §4.8). The capture side-car process
//! itself ("a process that begins/ends a capture given a BPF-style
//! filter and output path") is an external collaborator per spec §1;
//! `TcpdumpSidecar` is a real, minimal implementation of that boundary
//! so the crate is runnable end to end, not a stand-in for reimplementing
//! libpcap's BPF compiler.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};
use std::process::{Child, Command};
use std::time::Duration;

use crate::error::TracerError;

/// `MIN_PORT`/`MAX_PORT` in `force_bind` (sock_events.c:292-293):
/// `cat /proc/sys/net/ipv4/ip_local_port_range` on a typical Linux host.
pub const FORCE_BIND_MIN_PORT: u16 = 32768;
pub const FORCE_BIND_MAX_PORT: u16 = 60999;

/// Opaque token identifying a running capture, handed back by
/// `CaptureSidecar::start` and threaded through to `stop`.
#[derive(Debug)]
pub struct CaptureHandle(Child);

pub trait CaptureSidecar: Send + Sync {
    fn start(&self, filter: &str, pcap_path: &Path) -> Result<CaptureHandle, TracerError>;
    fn stop(&self, handle: CaptureHandle, grace: Duration);
}

/// Spawns `tcpdump` as the capture side-car and stops it with `SIGTERM`
/// after the grace period, matching `start_capture`/`stop_capture`'s
/// black-box signature in spec §6.
pub struct TcpdumpSidecar {
    pub interface: String,
}

impl Default for TcpdumpSidecar {
    fn default() -> Self {
        TcpdumpSidecar {
            interface: "any".to_string(),
        }
    }
}

impl CaptureSidecar for TcpdumpSidecar {
    fn start(&self, filter: &str, pcap_path: &Path) -> Result<CaptureHandle, TracerError> {
        Command::new("tcpdump")
            .arg("-i")
            .arg(&self.interface)
            .arg("-w")
            .arg(pcap_path)
            .arg(filter)
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map(CaptureHandle)
            .map_err(|e| TracerError::CaptureStart(e.to_string()))
    }

    fn stop(&self, mut handle: CaptureHandle, grace: Duration) {
        std::thread::sleep(grace);
        let pid = nix::unistd::Pid::from_raw(handle.0.id() as i32);
        if let Err(e) = nix::sys::signal::kill(pid, nix::sys::signal::Signal::SIGTERM) {
            log::error!("failed to signal capture side-car: {e}");
        }
        let _ = handle.0.wait();
    }
}

/// Attempts to bind `fd` to an ephemeral port on the wildcard address of
/// the given family, so a capture filter can be scoped to a concrete
/// local port. Grounded verbatim on `force_bind` (sock_events.c:294-327):
/// iterate the port range, stop on the first success, abandon (don't
/// retry forever) on anything other than `EADDRINUSE`.
pub fn force_bind(fd: RawFd, ipv6: bool) -> Result<u16, TracerError> {
    use nix::sys::socket::{bind, SockaddrIn, SockaddrIn6};

    for port in FORCE_BIND_MIN_PORT..=FORCE_BIND_MAX_PORT {
        let result = if ipv6 {
            let addr = SockaddrIn6::from(std::net::SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0));
            bind(fd, &addr)
        } else {
            let addr = SockaddrIn::from(std::net::SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            bind(fd, &addr)
        };
        match result {
            Ok(()) => return Ok(port),
            Err(nix::errno::Errno::EADDRINUSE) => continue,
            Err(e) => {
                log::error!("bind() failed: {e}");
                return Err(TracerError::ForceBindExhausted);
            }
        }
    }
    Err(TracerError::ForceBindExhausted)
}

/// Builds a BPF-style filter string from the (optional) local address
/// and the destination address, matching spec §4.8 step 3 and scenario
/// 6 ("a capture filter scoped to that port and the destination
/// 5-tuple").
pub fn build_filter(bound: Option<(IpAddr, u16)>, peer: (IpAddr, u16)) -> String {
    let (peer_ip, peer_port) = peer;
    let mut filter = format!("host {peer_ip} and port {peer_port}");
    if let Some((local_ip, local_port)) = bound {
        filter.push_str(&format!(" and host {local_ip} and port {local_port}"));
    }
    filter
}

/// `{output_dir}/{connection_id}.pcap` — the pcap counterpart of the
/// JSON dump path built in `dump.rs`.
pub fn pcap_path(output_dir: &Path, connection_id: u64) -> PathBuf {
    output_dir.join(format!("{connection_id}.pcap"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_includes_peer_and_local_when_bound() {
        let filter = build_filter(
            Some((IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)), 32800)),
            (IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80),
        );
        assert_eq!(filter, "host 1.2.3.4 and port 80 and host 10.0.0.1 and port 32800");
    }

    #[test]
    fn filter_is_destination_only_when_unbound() {
        let filter = build_filter(None, (IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4)), 80));
        assert_eq!(filter, "host 1.2.3.4 and port 80");
    }

    #[test]
    fn force_bind_picks_a_port_in_range() {
        use nix::sys::socket::{socket, AddressFamily, SockFlag, SockType};
        let fd = socket(AddressFamily::Inet, SockType::Stream, SockFlag::empty(), None).unwrap();
        let port = force_bind(std::os::fd::AsRawFd::as_raw_fd(&fd), false).unwrap();
        assert!((FORCE_BIND_MIN_PORT..=FORCE_BIND_MAX_PORT).contains(&port));
    }

    #[test]
    fn pcap_path_is_connection_scoped() {
        let p = pcap_path(Path::new("/tmp/out"), 7);
        assert_eq!(p, PathBuf::from("/tmp/out/7.pcap"));
    }
}
