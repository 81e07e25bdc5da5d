//! Built-in logger initialization.
//!
//! Uses the `env_logger` crate behind the default Cargo feature
//! "builtin_env_logger". When enabled, [`try_init`] is called from
//! `GarbageCollector::set_up` and shows logs of level INFO or lower.
//! Embedders that integrate with their own logging framework can disable the
//! feature and register a `log` implementation themselves.

/// Attempt to initialize the built-in env_logger.
/// Does nothing if the "builtin_env_logger" feature is disabled.
pub(crate) fn try_init() {
    cfg_if::cfg_if! {
        if #[cfg(feature = "builtin_env_logger")] {
            let result = env_logger::try_init_from_env(
                env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
            );

            match result {
                Ok(()) => {
                    debug!("magpie initialized the logger.");
                }
                Err(e) => {
                    // `log::SetLoggerError` can only mean a logger is already installed.
                    debug!("magpie did not initialize the built-in env_logger: {e}");
                }
            }
        } else {
            debug!("Built-in env_logger not compiled in.");
        }
    }
}
