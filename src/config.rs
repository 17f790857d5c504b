//! Process-wide configuration, from the `DXILT_CONFIG` environment variable.

use lazy_static::lazy_static;
use serde::Deserialize;
use std::path::PathBuf;

pub const ENV_VAR: &str = "DXILT_CONFIG";

#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Compile on a single worker.
    pub serial_compilation: bool,

    /// Compile workers, 0 meaning one per core.
    pub workers: usize,

    pub log_instrumentation: bool,
    pub log_rejected_keys: bool,

    /// Initial value for waiting on instrumentation when recording.
    pub synchronous_recording_default: bool,

    pub debug_dump_dir: Option<PathBuf>,
}

lazy_static! {
    pub static ref CONFIG: Config = Config::from_env();
}

impl Config {
    /// Parse `DXILT_CONFIG`, as `+`-separated parts (empty if unset).
    pub fn from_env() -> Self {
        match std::env::var(ENV_VAR) {
            Ok(contents) => Self::parse(&contents),
            Err(_) => Config::default(),
        }
    }

    pub fn parse(contents: &str) -> Self {
        let mut config = Config::default();
        for part in contents.split('+').filter(|s| !s.is_empty()) {
            if part == "serial" {
                config.serial_compilation = true;
            } else if part == "log-instrumentation" {
                config.log_instrumentation = true;
            } else if part == "log-rejected-keys" {
                config.log_rejected_keys = true;
            } else if part == "sync" {
                config.synchronous_recording_default = true;
            } else if let Some(workers) = part.strip_prefix("workers=") {
                match workers.parse() {
                    Ok(n) => config.workers = n,
                    Err(e) => tracing::warn!("`{ENV_VAR}`: bad worker count `{workers}`: {e}"),
                }
            } else if let Some(path) = part.strip_prefix("dump=") {
                config.debug_dump_dir = Some(PathBuf::from(path));
            } else {
                tracing::warn!(
                    "`{ENV_VAR}` should contain `+`-separated \
                     `serial`/`log-instrumentation`/`log-rejected-keys`/`sync`/`workers=N`/`dump=PATH`, \
                     ignoring `{part}`"
                );
            }
        }
        config
    }

    /// Worker count to actually use.
    pub fn worker_count(&self) -> usize {
        if self.serial_compilation {
            1
        } else {
            self.workers
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parts() {
        let config = Config::parse("serial+log-rejected-keys+workers=3+dump=/tmp/dxil+bogus");
        assert_eq!(
            config,
            Config {
                serial_compilation: true,
                workers: 3,
                log_rejected_keys: true,
                debug_dump_dir: Some(PathBuf::from("/tmp/dxil")),
                ..Config::default()
            }
        );
        assert_eq!(config.worker_count(), 1);
        assert_eq!(Config::parse(""), Config::default());
    }

    #[test]
    fn from_json() {
        let config: Config =
            serde_json::from_str(r#"{"workers": 2, "synchronous_recording_default": true}"#)
                .unwrap();
        assert_eq!(config.worker_count(), 2);
        assert!(config.synchronous_recording_default);
    }
}
