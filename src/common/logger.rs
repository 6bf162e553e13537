use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::Config;

/// Initialize the global tracing subscriber from the `logging.level` keys.
///
/// `logging.level.root` sets the default directive and
/// `logging.level.lavalink` scopes this crate, mirroring the upstream
/// configuration surface.
pub fn init(config: &Config) {
    let root = normalize(&config.logging.level.root);
    let own = normalize(&config.logging.level.lavalink);

    let filter_str = format!("{root},volcanic={own}");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter_str));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();
}

/// The YAML carries Spring-style uppercase level names.
fn normalize(level: &str) -> String {
    let lower = level.to_ascii_lowercase();
    match lower.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => lower,
        "warning" => "warn".into(),
        "off" => "error".into(),
        _ => "info".into(),
    }
}

#[cfg(test)]
mod tests {
    use super::normalize;

    #[test]
    fn accepts_spring_level_names() {
        assert_eq!(normalize("INFO"), "info");
        assert_eq!(normalize("WARNING"), "warn");
        assert_eq!(normalize("bogus"), "info");
    }
}
