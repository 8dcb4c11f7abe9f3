//! The process-wide tracer singleton (REDESIGN FLAGS: "ambient global
//! tables" — the original's file-scope `ra` (ResizableArray),
//! `connections_count`, and config globals are gathered here into one
//! owned struct instead of scattered statics). `Tracer` is not itself a
//! global; `init()`/`tracer()` below give it process-wide lifetime the
//! way `isgasho-rd`'s `Flags::get()` (src/flags.rs) gives its config
//! singleton process-wide lifetime, via `std::sync::OnceLock`.

use std::os::unix::io::RawFd;
use std::sync::{Mutex, OnceLock};

use crate::capture::{CaptureSidecar, TcpdumpSidecar};
use crate::config::TracerConfig;
use crate::socket_table::SocketTable;

/// Owns every piece of mutable tracer state: the fd table, the
/// configuration snapshot taken at `init`, the connection-id counter
/// (spec §5: "a dedicated mutex, always the leaf lock"), and the
/// packet-capture side-car.
pub struct Tracer {
    pub(crate) table: SocketTable,
    pub(crate) config: TracerConfig,
    pub(crate) sidecar: Box<dyn CaptureSidecar>,
    connections_count: Mutex<u64>,
}

impl Tracer {
    pub fn new(config: TracerConfig, sidecar: Box<dyn CaptureSidecar>) -> Tracer {
        Tracer {
            table: SocketTable::new(),
            config,
            sidecar,
            connections_count: Mutex::new(0),
        }
    }

    /// A no-op placeholder matching the original's `init_tcpsnitch()`
    /// prelude call — every entry point in `recorder.rs` calls this
    /// first. There is nothing left to lazily set up once `Tracer`
    /// itself exists (construction already did it), but the call site
    /// is kept so the entry points read the same way the original's do.
    pub(crate) fn ensure_initialized(&self) {}

    pub(crate) fn next_connection_id(&self) -> u64 {
        let mut count = self.connections_count.lock().unwrap();
        let id = *count;
        *count += 1;
        id
    }

    /// Post-`fork()` hook (spec §4.6): every fd that survived the fork
    /// gets a fresh entry (history cleared, a single synthetic
    /// `ForkedSocket` event carrying a copy of its `SockInfo`), and the
    /// connection-id counter restarts at 0. Mirrors `sock_ev_reset`
    /// (sock_events.c:1124-1133).
    pub fn reset(&self) {
        let sockets = self.table.take_all();
        *self.connections_count.lock().unwrap() = 0;
        for sock in sockets {
            self.sock_ev_forked_socket(sock.fd, sock.id, sock.sock_info);
        }
    }

    /// Tracee-shutdown teardown: flushes every remaining tracked socket
    /// to disk (stopping any live capture first) and empties the table.
    pub fn dump_all(&self) {
        for sock in self.table.take_all() {
            self.finish_socket(sock);
        }
    }

    /// Number of fds currently tracked. Exposed for diagnostics/tests;
    /// not part of the original's public surface.
    pub fn tracked_count(&self) -> usize {
        self.table.present_count()
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Tracer {
        Tracer::new(TracerConfig::default(), Box::new(NoopSidecar))
    }

    #[cfg(test)]
    pub(crate) fn for_tests_with_config(config: TracerConfig) -> Tracer {
        Tracer::new(config, Box::new(NoopSidecar))
    }
}

/// A side-car that records nothing and starts no subprocess, for tests
/// that don't want a real `tcpdump` on the test-runner `PATH`.
#[cfg(test)]
struct NoopSidecar;

#[cfg(test)]
impl CaptureSidecar for NoopSidecar {
    fn start(&self, _filter: &str, _pcap_path: &std::path::Path) -> Result<crate::capture::CaptureHandle, crate::error::TracerError> {
        Err(crate::error::TracerError::CaptureStart("no-op sidecar never starts".to_string()))
    }
    fn stop(&self, _handle: crate::capture::CaptureHandle, _grace: std::time::Duration) {}
}

static GLOBAL: OnceLock<Tracer> = OnceLock::new();

/// Initializes the process-wide tracer from the environment, if it
/// hasn't been already. Idempotent, matching `init_tcpsnitch()`'s
/// "called from every entry point, does nothing after the first time"
/// contract — here backed by `OnceLock::get_or_init` instead of a
/// hand-checked boolean flag.
pub fn init() {
    GLOBAL.get_or_init(|| Tracer::new(TracerConfig::from_env(), Box::new(TcpdumpSidecar::default())));
}

/// Returns the process-wide tracer, initializing it from the
/// environment on first use.
pub fn global() -> &'static Tracer {
    init();
    GLOBAL.get().expect("global tracer initialized by init()")
}

/// Convenience used by a hosting interception layer on a fresh fd,
/// matching `is_present(fd)` checks the original performs before
/// deciding whether a recorded entry already exists.
pub fn is_tracked(fd: RawFd) -> bool {
    global().table.is_present(fd)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_preserves_sock_info_and_restarts_ids() {
        let tracer = Tracer::for_tests();
        tracer.sock_ev_socket(5, libc::AF_INET, libc::SOCK_STREAM, 0);
        tracer.sock_ev_write(5, 10, 0, 10);

        tracer.reset();

        let guard = tracer.table.get_and_lock(5).unwrap();
        let sock = guard.as_ref().unwrap();
        assert_eq!(sock.events.len(), 1);
        assert_eq!(sock.sock_info.domain, libc::AF_INET);
        assert_eq!(sock.events[0].header().id, 0);
        guard.unlock();

        // Next socket() call after reset restarts the connection-id
        // counter at 0 too.
        tracer.sock_ev_socket(6, libc::AF_INET, libc::SOCK_DGRAM, 0);
        let guard = tracer.table.get_and_lock(6).unwrap();
        assert_eq!(guard.as_ref().unwrap().id, 0);
        guard.unlock();
    }

    #[test]
    fn dump_all_empties_the_table() {
        let dir = std::env::temp_dir().join(format!("sockwatch-dumpall-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let tracer = Tracer::for_tests_with_config(TracerConfig {
            output_dir: Some(dir.clone()),
            ..Default::default()
        });
        tracer.sock_ev_socket(7, libc::AF_INET, libc::SOCK_STREAM, 0);

        tracer.dump_all();

        assert_eq!(tracer.tracked_count(), 0);
        assert!(!tracer.table.is_present(7));
        std::fs::remove_dir_all(&dir).ok();
    }
}
