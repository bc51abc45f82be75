//! Environment-variable configuration for the singleton [`crate::Context`]:
//! `{PREFIX}IO_THREADS`, `{PREFIX}MAX_SOCKETS`, `{PREFIX}LINGER`,
//! `{PREFIX}SNDHWM`, `{PREFIX}RCVHWM`, `{PREFIX}PIPEHWM`, `{PREFIX}IPV6`.
//!
//! A missing or unparsable variable falls back to the library default and
//! is logged at `debug!` — never fatal.

/// Read `{prefix}{name}` as a decimal integer, defaulting on absence or
/// parse failure.
pub fn env_i32(prefix: &str, name: &str, default: i32) -> i32 {
    let key = format!("{prefix}{name}");
    match std::env::var(&key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            tracing::debug!(key = %key, value = %raw, default, "ignoring unparsable env override");
            default
        }),
        Err(_) => default,
    }
}

/// Read `{prefix}{name}` as a boolean (`"1"`/`"0"`), defaulting otherwise.
pub fn env_bool(prefix: &str, name: &str, default: bool) -> bool {
    let key = format!("{prefix}{name}");
    match std::env::var(&key) {
        Ok(raw) => match raw.as_str() {
            "1" => true,
            "0" => false,
            _ => {
                tracing::debug!(key = %key, value = %raw, default, "ignoring unparsable env override");
                default
            }
        },
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_var_falls_back_to_default() {
        assert_eq!(env_i32("QMQ_TEST_MISSING_", "IO_THREADS", 7), 7);
    }

    #[test]
    fn parses_present_var() {
        std::env::set_var("QMQ_TEST_PRESENT_LINGER", "42");
        assert_eq!(env_i32("QMQ_TEST_PRESENT_", "LINGER", 0), 42);
        std::env::remove_var("QMQ_TEST_PRESENT_LINGER");
    }
}
