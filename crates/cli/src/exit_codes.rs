//! CLI Exit Code Registry
//!
//! Single source of truth for the `sqlbridge` exit codes. Editors that
//! launch the host read them, so they do not change.
//!
//! | Code | Meaning                                        |
//! |------|------------------------------------------------|
//! | 0    | Success (clean EOF or `exit`)                  |
//! | 1    | General error                                  |
//! | 2    | Usage error (bad arguments, bad log level)     |
//! | 20   | Settings file unreadable or invalid            |
//! | 21   | Transport failure (framing error, broken pipe) |
//! | 22   | Could not bind the `--listen` address          |

use sqlbridge_host::HostError;

/// Success.
pub const EXIT_SUCCESS: u8 = 0;

/// General error. Prefer a specific code.
pub const EXIT_ERROR: u8 = 1;

/// Bad arguments.
pub const EXIT_USAGE: u8 = 2;

/// Settings file could not be read or parsed.
pub const EXIT_CONFIG: u8 = 20;

/// The client stream broke: malformed frame, I/O error.
pub const EXIT_TRANSPORT: u8 = 21;

/// The listen address could not be bound.
pub const EXIT_BIND: u8 = 22;

/// Exit code for a host failure.
pub fn host_exit_code(err: &HostError) -> u8 {
    match err {
        HostError::Framing(_) | HostError::Io(_) | HostError::Dispatch(_) => EXIT_TRANSPORT,
        HostError::Bind { .. } => EXIT_BIND,
        _ => EXIT_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlbridge_host::FramingError;

    #[test]
    fn test_host_errors_map_to_codes() {
        assert_eq!(host_exit_code(&HostError::Framing(FramingError::MissingContentLength)), EXIT_TRANSPORT);
        let bind = HostError::Bind {
            addr: "127.0.0.1:1".into(),
            source: std::io::Error::new(std::io::ErrorKind::AddrInUse, "in use"),
        };
        assert_eq!(host_exit_code(&bind), EXIT_BIND);
        assert_eq!(host_exit_code(&HostError::Internal("x".into())), EXIT_ERROR);
    }

    #[test]
    fn test_codes_are_distinct() {
        let codes = [EXIT_SUCCESS, EXIT_ERROR, EXIT_USAGE, EXIT_CONFIG, EXIT_TRANSPORT, EXIT_BIND];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
