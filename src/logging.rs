//! Scoped log configuration.
//!
//! The level for a run is installed as the thread's default subscriber and
//! restored when the returned guard drops, on success, error or panic alike.
//! Nothing here touches a process-global logger.

use anyhow::{Context, Result};
use tracing::subscriber::DefaultGuard;
use tracing_subscriber::EnvFilter;

pub fn scoped(level: &str) -> Result<DefaultGuard> {
    let filter = EnvFilter::try_new(level)
        .with_context(|| format!("Invalid log level/filter: {level}"))?;
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .finish();
    Ok(tracing::subscriber::set_default(subscriber))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scoped_subscriber_is_restored_on_drop() -> Result<()> {
        assert!(!tracing::enabled!(tracing::Level::DEBUG));
        {
            let _guard = scoped("debug")?;
            assert!(tracing::enabled!(tracing::Level::DEBUG));
            {
                let _inner = scoped("error")?;
                assert!(!tracing::enabled!(tracing::Level::WARN));
            }
            assert!(tracing::enabled!(tracing::Level::DEBUG));
        }
        assert!(!tracing::enabled!(tracing::Level::DEBUG));
        Ok(())
    }

    #[test]
    fn rejects_malformed_filter() {
        assert!(scoped("=[").is_err());
    }
}
