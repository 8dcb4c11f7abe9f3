//! sockwatch: a socket syscall tracer core (spec: userspace recorder of
//! libc socket-family calls, keyed by fd, dumped as newline-delimited
//! JSON per connection). This crate is the recording engine only — it
//! expects a host interception layer (ptrace, `LD_PRELOAD`, or similar)
//! to call its entry points with the syscall's arguments and outcome.

pub mod capture;
pub mod clock;
pub mod config;
pub mod dump;
pub mod error;
pub mod event;
pub mod fcntl_class;
pub mod recorder;
pub mod socket;
pub mod socket_table;
pub mod tracer;

pub use config::TracerConfig;
pub use error::TracerError;
pub use event::SockEvent;
pub use socket::{Socket, SockInfo};
pub use tracer::{global, init, is_tracked, Tracer};
