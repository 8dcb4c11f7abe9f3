//! Concurrent, fd-indexed socket table (spec §4.1, `ResizableArray` in
//! the original). Per-slot locking so independent tracee threads
//! operating on independent fds never contend with each other; the only
//! table-wide operation is growth, which takes the outer `RwLock`
//! exclusively.
//!
//! `get_and_lock`/`unlock` are an explicit, non-RAII pair rather than a
//! guard, because spec §4.4's duplication-family recording path must
//! release the source fd's lock, touch an unrelated destination slot,
//! and then re-acquire the source lock — a sequence RAII guards can't
//! express without fighting the borrow checker. `parking_lot::RawMutex`
//! exists for exactly this: a lock you can acquire and release as two
//! separate calls.

use lock_api::RawMutex as _;
use parking_lot::RawMutex;
use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use crate::socket::Socket;

struct Slot {
    present: AtomicBool,
    raw: RawMutex,
    data: UnsafeCell<Option<Socket>>,
}

impl Slot {
    fn empty() -> Slot {
        Slot {
            present: AtomicBool::new(false),
            raw: RawMutex::INIT,
            data: UnsafeCell::new(None),
        }
    }
}

// SAFETY: all access to `data` happens while `raw` is held locked by the
// accessing thread (enforced by `SocketTable`'s API, which never hands
// out a reference without first locking `raw`).
unsafe impl Sync for Slot {}

/// A handle returned by `get_and_lock`. Holding one means the caller
/// holds the slot's lock; dropping it without calling `unlock` is a
/// programming error caught in debug builds (spec: "it is a programming
/// error to unlock a slot one does not hold" — the converse, forgetting
/// to unlock, is just as much a bug, so we assert on it).
pub struct SocketGuard {
    slot: Arc<Slot>,
    fd: RawFd,
    unlocked: bool,
}

impl SocketGuard {
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Releases the per-slot lock. Consumes the guard so it cannot be
    /// used afterwards.
    pub fn unlock(mut self) {
        self.unlocked = true;
        // SAFETY: this thread acquired `raw` to produce this guard, and
        // no reference derived from it outlives this call.
        unsafe { self.slot.raw.unlock() };
    }
}

impl std::ops::Deref for SocketGuard {
    type Target = Option<Socket>;
    fn deref(&self) -> &Option<Socket> {
        // SAFETY: `raw` is held locked for the lifetime of this guard.
        unsafe { &*self.slot.data.get() }
    }
}

impl std::ops::DerefMut for SocketGuard {
    fn deref_mut(&mut self) -> &mut Option<Socket> {
        // SAFETY: `raw` is held locked for the lifetime of this guard.
        unsafe { &mut *self.slot.data.get() }
    }
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        debug_assert!(
            self.unlocked,
            "SocketGuard for fd {} dropped without calling unlock()",
            self.fd
        );
        if !self.unlocked {
            // Release so a missed unlock() in a release build doesn't
            // deadlock the slot forever.
            unsafe { self.slot.raw.unlock() };
        }
    }
}

/// The socket table itself. Growth doubles capacity (§4.1: "Growth is
/// amortized (doubling); shrinking is not required").
pub struct SocketTable {
    slots: RwLock<Vec<Arc<Slot>>>,
}

impl SocketTable {
    pub fn new() -> SocketTable {
        SocketTable {
            slots: RwLock::new(Vec::new()),
        }
    }

    fn ensure_capacity(&self, fd: RawFd) {
        let needed = fd as usize + 1;
        {
            let slots = self.slots.read().unwrap();
            if slots.len() >= needed {
                return;
            }
        }
        let mut slots = self.slots.write().unwrap();
        if slots.len() >= needed {
            return;
        }
        let mut new_len = slots.len().max(1);
        while new_len < needed {
            new_len *= 2;
        }
        let additional = new_len - slots.len();
        slots
            .try_reserve(additional)
            .unwrap_or_else(|_| {
                log::error!("socket table allocation failed growing to {new_len} slots");
                std::process::abort();
            });
        while slots.len() < new_len {
            slots.push(Arc::new(Slot::empty()));
        }
    }

    fn slot(&self, fd: RawFd) -> Option<Arc<Slot>> {
        if fd < 0 {
            return None;
        }
        let slots = self.slots.read().unwrap();
        slots.get(fd as usize).cloned()
    }

    /// Installs `entry` at `fd`, growing the table if needed.
    pub fn put(&self, fd: RawFd, entry: Socket) {
        self.ensure_capacity(fd);
        let slot = self.slot(fd).expect("slot just grown into existence");
        slot.raw.lock();
        // SAFETY: just locked `raw` above.
        unsafe { *slot.data.get() = Some(entry) };
        slot.present.store(true, Ordering::Release);
        unsafe { slot.raw.unlock() };
    }

    /// Nonblocking occupancy check; never takes the per-slot lock.
    pub fn is_present(&self, fd: RawFd) -> bool {
        match self.slot(fd) {
            Some(slot) => slot.present.load(Ordering::Acquire),
            None => false,
        }
    }

    /// Blocks until the slot's lock is free, then returns a handle to
    /// it. Returns `None` if the slot is out of range or empty.
    pub fn get_and_lock(&self, fd: RawFd) -> Option<SocketGuard> {
        let slot = self.slot(fd)?;
        slot.raw.lock();
        if !slot.present.load(Ordering::Acquire) {
            unsafe { slot.raw.unlock() };
            return None;
        }
        Some(SocketGuard {
            slot,
            fd,
            unlocked: false,
        })
    }

    /// Removes and returns the entry at `fd`, atomically with respect
    /// to presence. The caller receives exclusive ownership.
    pub fn remove(&self, fd: RawFd) -> Option<Socket> {
        let slot = self.slot(fd)?;
        slot.raw.lock();
        if !slot.present.load(Ordering::Acquire) {
            unsafe { slot.raw.unlock() };
            return None;
        }
        // SAFETY: `raw` held locked.
        let taken = unsafe { (*slot.data.get()).take() };
        slot.present.store(false, Ordering::Release);
        unsafe { slot.raw.unlock() };
        taken
    }

    /// Current capacity (not population).
    pub fn size(&self) -> usize {
        self.slots.read().unwrap().len()
    }

    /// Number of slots currently occupied. Diagnostics only; not part of
    /// the spec's `ResizableArray` contract (which exposes capacity via
    /// `size()`, not population).
    pub fn present_count(&self) -> usize {
        self.slots
            .read()
            .unwrap()
            .iter()
            .filter(|slot| slot.present.load(Ordering::Acquire))
            .count()
    }

    /// Removes and returns every present entry, e.g. for a post-fork
    /// reset or a final teardown dump. Each slot is locked only for the
    /// instant it takes that slot's entry.
    pub fn take_all(&self) -> Vec<Socket> {
        let slots = self.slots.read().unwrap();
        let mut out = Vec::new();
        for slot in slots.iter() {
            slot.raw.lock();
            if slot.present.load(Ordering::Acquire) {
                // SAFETY: `raw` held locked.
                if let Some(sock) = unsafe { (*slot.data.get()).take() } {
                    out.push(sock);
                }
                slot.present.store(false, Ordering::Release);
            }
            unsafe { slot.raw.unlock() };
        }
        out
    }
}

impl Default for SocketTable {
    fn default() -> Self {
        SocketTable::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_is_present_without_locking() {
        let table = SocketTable::new();
        assert!(!table.is_present(5));
        table.put(5, Socket::new(0, 5));
        assert!(table.is_present(5));
    }

    #[test]
    fn get_and_lock_absent_returns_none() {
        let table = SocketTable::new();
        assert!(table.get_and_lock(3).is_none());
    }

    #[test]
    fn remove_clears_presence() {
        let table = SocketTable::new();
        table.put(2, Socket::new(0, 2));
        let sock = table.remove(2).unwrap();
        assert_eq!(sock.fd, 2);
        assert!(!table.is_present(2));
        assert!(table.remove(2).is_none());
    }

    #[test]
    fn grows_to_accommodate_large_fds() {
        let table = SocketTable::new();
        table.put(100, Socket::new(0, 100));
        assert!(table.size() > 100);
        assert!(table.is_present(100));
    }

    #[test]
    fn concurrent_threads_touch_independent_fds() {
        let table = Arc::new(SocketTable::new());
        let mut handles = Vec::new();
        for fd in 0..8 {
            let table = Arc::clone(&table);
            handles.push(std::thread::spawn(move || {
                table.put(fd, Socket::new(fd as u64, fd));
                let guard = table.get_and_lock(fd).unwrap();
                assert_eq!(guard.as_ref().unwrap().fd, fd);
                guard.unlock();
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        for fd in 0..8 {
            assert!(table.is_present(fd));
        }
    }

    #[test]
    fn take_all_drains_only_present_slots() {
        let table = SocketTable::new();
        table.put(1, Socket::new(0, 1));
        table.put(3, Socket::new(1, 3));
        table.remove(1);

        let drained = table.take_all();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].fd, 3);
        assert!(!table.is_present(1));
        assert!(!table.is_present(3));
    }

    #[test]
    fn lock_blocks_a_second_holder_until_unlocked() {
        let table = Arc::new(SocketTable::new());
        table.put(9, Socket::new(0, 9));
        let guard = table.get_and_lock(9).unwrap();

        let table2 = Arc::clone(&table);
        let (tx, rx) = std::sync::mpsc::channel();
        let t = std::thread::spawn(move || {
            let g = table2.get_and_lock(9).unwrap();
            tx.send(()).unwrap();
            g.unlock();
        });

        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(rx.try_recv().is_err(), "second locker should still be blocked");
        guard.unlock();
        t.join().unwrap();
    }
}
