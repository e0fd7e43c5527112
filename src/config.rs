//! Interpreter configuration: limits, dispatch policy and library search path.
//!
//! Values come from defaults, a TOML file, the environment, and finally CLI
//! flags, each layer overriding the previous one.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Environment variable holding extra library directories, in `PATH` syntax.
pub const REXXPATH: &str = "REXXPATH";
const FAIL_FAST_VAR: &str = "REXX_FAIL_FAST";
const INTERPRET_DEPTH_VAR: &str = "REXX_MAX_INTERPRET_DEPTH";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    /// Nested INTERPRET levels allowed before Resource Exhaustion.
    pub max_interpret_depth: usize,
    /// Active CALL levels allowed before Resource Exhaustion.
    pub max_call_depth: usize,
    /// Treat handler errors as fatal instead of a failed dispatch.
    pub fail_fast: bool,
    /// ADDRESS target active when a run starts.
    pub default_address: String,
    /// Directories searched for REXX source libraries.
    pub library_path: Vec<PathBuf>,
    /// Collect SAY output into `RunOutcome::output` instead of stdout.
    pub capture_output: bool,
    /// Longest string COPIES or a padding built-in may produce.
    pub max_string_length: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_interpret_depth: 100,
            max_call_depth: 1000,
            fail_fast: false,
            default_address: "SYSTEM".to_string(),
            library_path: Vec::new(),
            capture_output: false,
            max_string_length: 16 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("reading configuration from {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing configuration: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Config {
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults overlaid with `REXXPATH`, `REXX_FAIL_FAST` and
    /// `REXX_MAX_INTERPRET_DEPTH`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Overlay settings read through `var`. Unparseable values are ignored.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(path) = var(REXXPATH) {
            self.library_path.extend(
                std::env::split_paths(&path).filter(|dir| !dir.as_os_str().is_empty()),
            );
        }
        if let Some(flag) = var(FAIL_FAST_VAR) {
            match flag.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.fail_fast = true,
                "0" | "false" | "no" | "off" => self.fail_fast = false,
                other => tracing::warn!(value = other, "ignoring {FAIL_FAST_VAR}"),
            }
        }
        if let Some(depth) = var(INTERPRET_DEPTH_VAR) {
            match depth.trim().parse() {
                Ok(n) => self.max_interpret_depth = n,
                Err(_) => tracing::warn!(value = %depth, "ignoring {INTERPRET_DEPTH_VAR}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.max_interpret_depth, 100);
        assert_eq!(config.max_call_depth, 1000);
        assert!(!config.fail_fast);
        assert_eq!(config.default_address, "SYSTEM");
        assert!(config.library_path.is_empty());
        assert_eq!(config.max_string_length, 16 * 1024 * 1024);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str("fail_fast = true\nlibrary_path = [\"/opt/rexx\"]\n")
            .unwrap();
        assert!(config.fail_fast);
        assert_eq!(config.library_path, [PathBuf::from("/opt/rexx")]);
        assert_eq!(config.max_call_depth, 1000);
    }

    #[test]
    fn bad_toml_is_an_error() {
        assert!(matches!(
            Config::from_toml_str("max_call_depth = \"lots\""),
            Err(ConfigError::Toml(_))
        ));
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rexx.toml");
        std::fs::write(&path, "default_address = \"ECHO\"\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.default_address, "ECHO");
        assert!(matches!(
            Config::from_file(&dir.path().join("missing.toml")),
            Err(ConfigError::Io { .. })
        ));
    }

    #[test]
    fn environment_overlay() {
        let vars: HashMap<&str, &str> = [
            (REXXPATH, "/a::/b"),
            ("REXX_FAIL_FAST", "yes"),
            ("REXX_MAX_INTERPRET_DEPTH", "7"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| vars.get(k).map(ToString::to_string));
        assert_eq!(config.library_path, [PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(config.fail_fast);
        assert_eq!(config.max_interpret_depth, 7);
    }

    #[test]
    fn unparseable_environment_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == "REXX_MAX_INTERPRET_DEPTH").then(|| "deep".to_string()));
        assert_eq!(config.max_interpret_depth, 100);
    }
}
