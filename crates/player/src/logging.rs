// Logger installation for binaries and hosts embedding the player

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Install `env_logger` once. Defaults to `info`; `RUST_LOG` overrides.
/// The library never calls this itself.
pub fn init_logging() {
    INIT_LOGGER.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
            .format_timestamp_millis()
            .is_test(false)
            .try_init();
        log::info!("[player] logging initialised");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init_logging();
        init_logging();
        assert!(INIT_LOGGER.is_completed());
    }
}
