/// Default `env_logger` filter for a verbosity count (0=warn, 1=info,
/// 2=debug, 3+=trace). `RUST_LOG` overrides it.
pub fn default_filter(verbose: u8) -> &'static str {
    match verbose {
        0 => "quota_dirlock=warn",
        1 => "quota_dirlock=info",
        2 => "quota_dirlock=debug",
        _ => "quota_dirlock=trace",
    }
}

/// Initialize the logger with the specified verbosity level
pub fn setup_logger(verbose: u8) {
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter(verbose)),
    )
    .format_timestamp(None)
    .format_module_path(false)
    .format_target(false)
    .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_raises_the_level() {
        assert_eq!(default_filter(0), "quota_dirlock=warn");
        assert_eq!(default_filter(2), "quota_dirlock=debug");
        assert_eq!(default_filter(9), "quota_dirlock=trace");
    }
}
