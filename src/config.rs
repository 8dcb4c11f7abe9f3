//! Configuration inputs read by the core (the loading mechanism itself —
//! env vars vs. platform properties — is an external collaborator per
//! spec; this module only defines the shape and the tolerant parsing
//! rules the original applies via `get_env_as_long`/`parse_long`).

use std::path::PathBuf;

/// Snapshot of the environment at `Tracer::init` time.
#[derive(Clone, Debug, Default)]
pub struct TracerConfig {
    /// `OPT_D`. Dumping is skipped entirely when this is `None`.
    pub output_dir: Option<PathBuf>,
    /// `CONF_OPT_U`, microseconds. 0 disables time-based TCP-info sampling.
    pub tcp_info_interval_usec: u64,
    /// `CONF_OPT_B`, bytes. 0 disables byte-based TCP-info sampling.
    pub tcp_info_byte_threshold: u64,
    /// `CONF_OPT_C`. When true, AF_PACKET sockets are excluded from INET
    /// classification to avoid recursive tracing of the capture side-car.
    pub capture_in_progress: bool,
}

impl TracerConfig {
    pub fn from_env() -> TracerConfig {
        TracerConfig {
            output_dir: std::env::var_os("OPT_D").map(PathBuf::from),
            tcp_info_interval_usec: get_env_as_u64_or_default("CONF_OPT_U", 0),
            tcp_info_byte_threshold: get_env_as_u64_or_default("CONF_OPT_B", 0),
            capture_in_progress: std::env::var("CONF_OPT_C")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(false),
        }
    }
}

/// Mirrors `get_long_opt_or_defaultval`: a missing or malformed value is
/// logged at WARN and replaced by `default`, never a hard error.
fn get_env_as_u64_or_default(var: &str, default: u64) -> u64 {
    match std::env::var(var) {
        Err(_) => default,
        Ok(s) => match s.trim().parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                log::warn!("{var} incorrect. Defaults to {default}.");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malformed_value_falls_back_to_default() {
        std::env::set_var("CONF_OPT_U_TEST", "not-a-number");
        assert_eq!(get_env_as_u64_or_default("CONF_OPT_U_TEST", 42), 42);
        std::env::remove_var("CONF_OPT_U_TEST");
    }

    #[test]
    fn absent_value_falls_back_to_default() {
        std::env::remove_var("CONF_OPT_B_TEST_ABSENT");
        assert_eq!(get_env_as_u64_or_default("CONF_OPT_B_TEST_ABSENT", 7), 7);
    }
}
