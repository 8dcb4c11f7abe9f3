//! `fcntl`'s argument shape, classified up front instead of extracted
//! variadically at each call site (REDESIGN FLAGS: "dispatch by shape
//! rather than variadic extraction"). Grounded on the `switch (cmd)` in
//! `sock_ev_fcntl` (sock_events.c:996-1043).

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FcntlArgShape {
    /// F_GETFD, F_GETFL, F_GETOWN, F_GETSIG, F_GETLEASE, F_GETPIPE_SZ
    Void,
    /// F_DUPFD, F_DUPFD_CLOEXEC, F_SETFD, F_SETFL, F_SETOWN, F_SETSIG,
    /// F_SETLEASE, F_NOTIFY, F_SETPIPE_SZ
    Int,
    /// F_SETLK, F_SETLKW, F_GETLK, and the platform OFD/64-bit variants.
    /// Only `cmd` is recorded for this shape, so the lock-command
    /// constants don't need distinct arms.
    StructPointer,
    /// F_GETOWN_EX, F_SETOWN_EX
    OwnerEx,
    /// Logged at WARN and dropped — the syscall itself still succeeds
    /// in the tracee, only its arguments go unrecorded.
    Unknown,
}

// Not exposed by the `libc` crate on the glibc target (only on musl); the
// numeric values are part of the stable Linux fcntl.h ABI across all arches.
const F_SETSIG: i32 = 10;
const F_GETSIG: i32 = 11;
const F_SETOWN_EX: i32 = 15;
const F_GETOWN_EX: i32 = 16;

pub fn classify(cmd: i32) -> FcntlArgShape {
    match cmd {
        libc::F_GETFD | libc::F_GETFL | libc::F_GETOWN | libc::F_GETLEASE | libc::F_GETPIPE_SZ => {
            FcntlArgShape::Void
        }
        F_GETSIG => FcntlArgShape::Void,
        libc::F_DUPFD
        | libc::F_DUPFD_CLOEXEC
        | libc::F_SETFD
        | libc::F_SETFL
        | libc::F_SETOWN
        | libc::F_SETLEASE
        | libc::F_NOTIFY
        | libc::F_SETPIPE_SZ => FcntlArgShape::Int,
        F_SETSIG => FcntlArgShape::Int,
        libc::F_SETLK | libc::F_SETLKW | libc::F_GETLK | libc::F_OFD_SETLK | libc::F_OFD_SETLKW | libc::F_OFD_GETLK => {
            FcntlArgShape::StructPointer
        }
        F_GETOWN_EX | F_SETOWN_EX => FcntlArgShape::OwnerEx,
        _ => FcntlArgShape::Unknown,
    }
}

/// `cmd`s that duplicate the descriptor, triggering the same
/// new-entry-creation path as `accept`/`dup`/`dup2`/`dup3`.
pub fn is_dup_cmd(cmd: i32) -> bool {
    cmd == libc::F_DUPFD || cmd == libc::F_DUPFD_CLOEXEC
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_known_shapes() {
        assert_eq!(classify(libc::F_GETFD), FcntlArgShape::Void);
        assert_eq!(classify(libc::F_SETFL), FcntlArgShape::Int);
        assert_eq!(classify(libc::F_SETLK), FcntlArgShape::StructPointer);
        assert_eq!(classify(F_GETOWN_EX), FcntlArgShape::OwnerEx);
    }

    #[test]
    fn unknown_cmd_is_dropped_not_fatal() {
        assert_eq!(classify(0x7fff_ffff), FcntlArgShape::Unknown);
    }

    #[test]
    fn dup_cmds_recognized() {
        assert!(is_dup_cmd(libc::F_DUPFD));
        assert!(is_dup_cmd(libc::F_DUPFD_CLOEXEC));
        assert!(!is_dup_cmd(libc::F_GETFD));
    }
}
