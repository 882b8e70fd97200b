//! Logger initialisation on top of `env_logger`.
//! `RUST_LOG` wins over the configured level when both are present.

use crate::error::{PduError, Result};
use log::LevelFilter;
use std::str::FromStr;

pub fn parse_level(level: &str) -> Result<LevelFilter> {
    LevelFilter::from_str(level.trim())
        .map_err(|_| PduError::Config(format!("log_level - unknown level '{}'", level)))
}

/// Installs the global logger. Calling it twice is harmless.
pub fn init(level: &str) -> Result<()> {
    let filter = parse_level(level)?;
    let _ = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(filter.as_str().to_ascii_lowercase()),
    )
    .format_timestamp_millis()
    .try_init();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_level("INFO").unwrap(), LevelFilter::Info);
        assert_eq!(parse_level("trace").unwrap(), LevelFilter::Trace);
        assert!(parse_level("chatty").is_err());
    }

    #[test]
    fn init_is_idempotent() {
        assert!(init("debug").is_ok());
        assert!(init("debug").is_ok());
        assert!(init("nope").is_err());
    }
}
