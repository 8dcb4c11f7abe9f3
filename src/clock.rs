//! Microsecond wall clock and thread identity, used to stamp every
//! recorded event.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds-since-epoch * 1_000_000 + microseconds. Returns 0 (and logs)
/// if the system clock is somehow before the epoch.
pub fn now_micros() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_micros() as u64,
        Err(e) => {
            log::warn!("system clock before UNIX_EPOCH: {e}");
            0
        }
    }
}

/// OS-level thread id, stable for the thread's lifetime.
pub fn thread_id() -> i32 {
    nix::unistd::gettid().as_raw()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_micros_is_monotonic_enough() {
        let a = now_micros();
        std::thread::sleep(std::time::Duration::from_micros(10));
        let b = now_micros();
        assert!(b >= a);
    }

    #[test]
    fn thread_id_nonzero() {
        assert!(thread_id() > 0);
    }
}
