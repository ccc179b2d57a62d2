//! Shared logging initialization for panpan binaries.

use std::sync::OnceLock;

use tracing::Level;

/// Environment variable selecting the log level (`trace` through `error`).
pub const LOG_ENV: &str = "PANPAN_LOG";

static INIT: OnceLock<()> = OnceLock::new();

/// Level named by `value`, case-insensitively. Unknown names fall back to
/// `INFO`.
fn level_from(value: Option<&str>) -> Level {
    value
        .and_then(|name| name.trim().parse::<Level>().ok())
        .unwrap_or(Level::INFO)
}

fn env_level() -> Level {
    level_from(std::env::var(LOG_ENV).ok().as_deref())
}

/// Initialize process-level tracing output from [`LOG_ENV`].
///
/// Safe to call multiple times; only the first call installs the subscriber.
/// Best-effort, never returns an error.
pub fn init() {
    init_with_level(env_level());
}

/// Initialize tracing output at an explicit level, ignoring [`LOG_ENV`].
///
/// Used by the daemon's `--verbose` flag.
pub fn init_with_level(level: Level) {
    if INIT.get().is_some() {
        return;
    }
    let _ = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
    let _ = INIT.set(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn test_level_names() {
        assert_eq!(level_from(None), Level::INFO);
        assert_eq!(level_from(Some("DEBUG")), Level::DEBUG);
        assert_eq!(level_from(Some(" warn ")), Level::WARN);
        assert_eq!(level_from(Some("nonsense")), Level::INFO);
    }

    #[test]
    #[serial]
    fn test_env_level() {
        let original = std::env::var(LOG_ENV).ok();
        unsafe { std::env::remove_var(LOG_ENV) };
        assert_eq!(env_level(), Level::INFO);

        unsafe { std::env::set_var(LOG_ENV, "error") };
        assert_eq!(env_level(), Level::ERROR);

        unsafe {
            match original {
                Some(v) => std::env::set_var(LOG_ENV, v),
                None => std::env::remove_var(LOG_ENV),
            }
        }
    }

    #[test]
    fn test_init_is_idempotent() {
        init();
        init_with_level(Level::TRACE);
    }
}
