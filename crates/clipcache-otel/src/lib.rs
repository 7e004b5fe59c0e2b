//! Tracing setup shared by the clipcache binaries: console output filtered by
//! `RUST_LOG`, plus an optional rolling file that receives only `http.access`
//! events.

use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

/// Target used for one-line-per-request access records.
pub const ACCESS_TARGET: &str = "http.access";

static ACCESS_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
}

impl Rotation {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "hourly" => Rotation::Hourly,
            "minutely" => Rotation::Minutely,
            _ => Rotation::Daily,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessLogSettings {
    pub dir: String,
    pub prefix: String,
    pub rotation: Rotation,
}

impl AccessLogSettings {
    /// Read `CLIPCACHE_ACCESS_LOG_*` through `lookup`; `None` unless rolling is enabled.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        if lookup("CLIPCACHE_ACCESS_LOG_ROLL").as_deref().map(str::trim) != Some("1") {
            return None;
        }
        let dir = lookup("CLIPCACHE_ACCESS_LOG_DIR")
            .or_else(|| lookup("CLIPCACHE_LOGS_DIR"))
            .unwrap_or_else(|| "logs".to_string());
        let prefix =
            lookup("CLIPCACHE_ACCESS_LOG_PREFIX").unwrap_or_else(|| "http-access".to_string());
        let rotation = lookup("CLIPCACHE_ACCESS_LOG_ROTATION")
            .map(|raw| Rotation::parse(&raw))
            .unwrap_or(Rotation::Daily);
        Some(Self {
            dir,
            prefix,
            rotation,
        })
    }

    pub fn from_env() -> Option<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn appender(&self) -> tracing_appender::rolling::RollingFileAppender {
        match self.rotation {
            Rotation::Hourly => tracing_appender::rolling::hourly(&self.dir, &self.prefix),
            Rotation::Minutely => tracing_appender::rolling::minutely(&self.dir, &self.prefix),
            Rotation::Daily => tracing_appender::rolling::daily(&self.dir, &self.prefix),
        }
    }
}

/// Install the global subscriber. Safe to call more than once; later calls
/// are ignored.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(fmt::layer().with_filter(filter));

    let Some(settings) = AccessLogSettings::from_env() else {
        let _ = registry.try_init();
        return;
    };
    if std::fs::create_dir_all(&settings.dir).is_err() {
        eprintln!("clipcache: failed to create access log directory {}", settings.dir);
    }
    let (writer, guard) = tracing_appender::non_blocking(settings.appender());
    let _ = ACCESS_GUARD.set(guard);
    let access_layer = fmt::layer()
        .with_ansi(false)
        .with_target(false)
        .with_writer(writer)
        .with_filter(Targets::new().with_target(ACCESS_TARGET, tracing::Level::INFO));
    let _ = registry.with(access_layer).try_init();
    tracing::info!(
        directory = %settings.dir,
        rotation = ?settings.rotation,
        "access log enabled"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn access_log_is_off_unless_enabled() {
        assert_eq!(AccessLogSettings::from_lookup(lookup(&[])), None);
        assert_eq!(
            AccessLogSettings::from_lookup(lookup(&[("CLIPCACHE_ACCESS_LOG_ROLL", "0")])),
            None
        );
    }

    #[test]
    fn access_log_settings_fall_back_to_defaults() {
        let settings =
            AccessLogSettings::from_lookup(lookup(&[("CLIPCACHE_ACCESS_LOG_ROLL", "1")])).unwrap();
        assert_eq!(settings.dir, "logs");
        assert_eq!(settings.prefix, "http-access");
        assert_eq!(settings.rotation, Rotation::Daily);

        let settings = AccessLogSettings::from_lookup(lookup(&[
            ("CLIPCACHE_ACCESS_LOG_ROLL", "1"),
            ("CLIPCACHE_LOGS_DIR", "/var/log/clipcache"),
            ("CLIPCACHE_ACCESS_LOG_ROTATION", "Hourly"),
        ]))
        .unwrap();
        assert_eq!(settings.dir, "/var/log/clipcache");
        assert_eq!(settings.rotation, Rotation::Hourly);
    }

    #[test]
    fn init_twice_is_harmless() {
        init();
        init();
    }
}
