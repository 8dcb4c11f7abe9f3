//! Dump & reset (spec §4.9): flushing a socket's accumulated event list
//! to a per-connection, newline-delimited JSON file, and draining the
//! whole table at tracee shutdown.

use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::TracerError;
use crate::socket::Socket;

/// `{output_dir}/{connection_id}.json` — stands in for the original's
/// unspecified `alloc_json_path_str`.
pub fn json_path(output_dir: &Path, connection_id: u64) -> PathBuf {
    output_dir.join(format!("{connection_id}.json"))
}

/// Opens the connection's output file in append mode, writes one JSON
/// line per pending event, and empties the list — mirroring
/// `dump_events_as_json` (sock_events.c:329-366), including freeing
/// each event as it's serialized (here: draining the `Vec` so dropped
/// events release their owned buffers immediately rather than waiting
/// for the whole socket to be dropped).
pub fn dump_events_as_json(output_dir: Option<&Path>, sock: &mut Socket) -> Result<(), TracerError> {
    let Some(output_dir) = output_dir else {
        // OPT_D absent: dumping is a no-op, not an error.
        return Ok(());
    };
    if sock.events.is_empty() {
        return Ok(());
    }

    let path = json_path(output_dir, sock.id);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| TracerError::DumpOpen {
            id: sock.id,
            path,
            source,
        })?;

    for ev in sock.events.drain(..) {
        let json = serde_json::to_string(&ev)?;
        writeln!(file, "{json}").map_err(|source| TracerError::DumpWrite { id: sock.id, source })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventHeader, EvListen, SockEvent};

    fn sample_event(id: u64) -> SockEvent {
        SockEvent::Listen(EvListen {
            header: EventHeader::new(1, 0, 0, id, 1, -1),
            backlog: 16,
        })
    }

    #[test]
    fn dump_drains_events_and_writes_ndjson() {
        let dir = tempdir();
        let mut sock = Socket::new(3, 9);
        sock.push_event(sample_event(0));
        sock.push_event(sample_event(1));

        dump_events_as_json(Some(dir.path()), &mut sock).unwrap();
        assert!(sock.events.is_empty());

        let contents = std::fs::read_to_string(json_path(dir.path(), 3)).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn dump_twice_does_not_duplicate_records() {
        let dir = tempdir();
        let mut sock = Socket::new(4, 10);
        sock.push_event(sample_event(0));

        dump_events_as_json(Some(dir.path()), &mut sock).unwrap();
        dump_events_as_json(Some(dir.path()), &mut sock).unwrap();

        let contents = std::fs::read_to_string(json_path(dir.path(), 4)).unwrap();
        assert_eq!(contents.lines().count(), 1);
    }

    #[test]
    fn dump_is_noop_without_output_dir() {
        let mut sock = Socket::new(5, 11);
        sock.push_event(sample_event(0));
        dump_events_as_json(None, &mut sock).unwrap();
        // Events are untouched when dumping is disabled.
        assert_eq!(sock.events.len(), 1);
    }

    fn tempdir() -> TempDir {
        TempDir::new()
    }

    /// A tiny self-cleaning temp directory, since this crate doesn't
    /// otherwise depend on a tempfile crate for its non-test code.
    struct TempDir(PathBuf);
    impl TempDir {
        fn new() -> Self {
            let path = std::env::temp_dir().join(format!(
                "sockwatch-test-{}-{}",
                std::process::id(),
                crate::clock::now_micros()
            ));
            std::fs::create_dir_all(&path).unwrap();
            TempDir(path)
        }
        fn path(&self) -> &Path {
            &self.0
        }
    }
    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }
}
