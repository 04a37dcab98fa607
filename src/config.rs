//! Configuration management for servdeck.
//!
//! This module defines the structure of the `launcher.toml` configuration file
//! and provides functionality to load and parse it. The file describes where the
//! server runtime lives and which `-Dkey=value` pointers each server receives.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::slot::SlotId;

/// Default maximum heap handed to every JVM, in megabytes.
pub const DEFAULT_MAX_HEAP_MB: u32 = 600;
/// Default number of console lines kept per slot.
pub const DEFAULT_MAX_LINES: usize = 5000;

/// Top-level configuration structure corresponding to `launcher.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Path to the java executable (defaults to `$JAVA_HOME/bin/java`, then `java`).
    pub java: Option<String>,
    /// Classpath entries, joined with the platform separator.
    #[serde(default)]
    pub classpath: Vec<String>,
    /// Maximum heap size in megabytes.
    pub max_heap_mb: Option<u32>,
    /// Extra JVM options, split with shell quoting rules.
    pub jvm_args: Option<String>,
    /// Working directory for every server process.
    pub working_dir: Option<String>,
    /// Maximum number of console lines to keep per slot.
    pub max_lines: Option<usize>,
    /// Delay before a stop request is escalated to a forced kill.
    pub kill_after_ms: Option<u64>,
    /// Properties injected into every server.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Center server settings.
    #[serde(default)]
    pub center: ServerConfig,
    /// Login server settings.
    #[serde(default)]
    pub login: ServerConfig,
    /// Game world servers.
    #[serde(default, rename = "game")]
    pub games: Vec<GameConfig>,
    /// Shop server settings.
    #[serde(default)]
    pub shop: ShopConfig,
}

/// Per-server launch settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    /// Main class override.
    pub main_class: Option<String>,
    /// Properties for this server; they override shared ones with the same key.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
    /// Raw program to run instead of assembling a JVM command line.
    pub program: Option<String>,
    /// Extra arguments appended after the main class (or after `program`).
    #[serde(default)]
    pub args: Vec<String>,
}

/// A numbered game world entry (`[[game]]`).
#[derive(Debug, Clone, Deserialize)]
pub struct GameConfig {
    /// World id in `0..=127`.
    pub id: u64,
    #[serde(flatten)]
    pub server: ServerConfig,
}

/// Shop server entry; the slot only exists when `enabled` is set.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShopConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(flatten)]
    pub server: ServerConfig,
}

impl Config {
    /// Slots enabled by this configuration, in tab order.
    pub fn enabled_slots(&self) -> Result<Vec<SlotId>> {
        let mut slots = vec![SlotId::Center, SlotId::Login];
        let mut seen = BTreeSet::new();
        for game in &self.games {
            let slot = SlotId::game(game.id)?;
            if !seen.insert(slot) {
                bail!("game {} is configured more than once", game.id);
            }
        }
        slots.extend(seen);
        if self.shop.enabled {
            slots.push(SlotId::Shop);
        }
        Ok(slots)
    }

    /// Settings for a slot, if it has any configured.
    pub fn server(&self, slot: SlotId) -> Option<&ServerConfig> {
        match slot {
            SlotId::Center => Some(&self.center),
            SlotId::Login => Some(&self.login),
            SlotId::Game(id) => self
                .games
                .iter()
                .find(|game| game.id == u64::from(id))
                .map(|game| &game.server),
            SlotId::Shop => Some(&self.shop.server),
        }
    }

    pub fn max_heap_mb(&self) -> u32 {
        self.max_heap_mb.unwrap_or(DEFAULT_MAX_HEAP_MB)
    }

    pub fn max_lines(&self) -> usize {
        self.max_lines.unwrap_or(DEFAULT_MAX_LINES).max(1)
    }
}

/// Loads and parses the configuration from a file path.
pub fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = toml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    config
        .enabled_slots()
        .with_context(|| format!("invalid slot list in {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
java = "/opt/jdk/bin/java"
classpath = ["dist/server.jar", "lib/mysql.jar"]
max_heap_mb = 512
jvm_args = "-server -Dfile.encoding=UTF-8"
working_dir = "/srv/world"
max_lines = 200
kill_after_ms = 5000

[properties]
"java.util.logging.config.file" = "logging.properties"
"argonms.db.config.file" = "db.properties"

[center]
properties = { "argonms.center.config.file" = "center.properties" }

[login]
main_class = "custom.Login"

[[game]]
id = 1
properties = { "argonms.game.config.file" = "game1.properties" }

[[game]]
id = 0

[shop]
enabled = true
program = "./shop.sh"
args = ["--verbose"]
"#;

    #[test]
    fn parses_full_config() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(config.java.as_deref(), Some("/opt/jdk/bin/java"));
        assert_eq!(config.classpath.len(), 2);
        assert_eq!(config.max_heap_mb(), 512);
        assert_eq!(config.max_lines(), 200);
        assert_eq!(config.kill_after_ms, Some(5000));
        assert_eq!(config.properties.len(), 2);
        assert_eq!(config.login.main_class.as_deref(), Some("custom.Login"));
        assert_eq!(config.games.len(), 2);
        assert!(config.shop.enabled);
        assert_eq!(config.shop.server.program.as_deref(), Some("./shop.sh"));
        assert_eq!(config.shop.server.args, vec!["--verbose"]);
    }

    #[test]
    fn enabled_slots_are_sorted() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert_eq!(
            config.enabled_slots().unwrap(),
            vec![
                SlotId::Center,
                SlotId::Login,
                SlotId::Game(0),
                SlotId::Game(1),
                SlotId::Shop
            ]
        );
    }

    #[test]
    fn empty_config_has_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.max_heap_mb(), DEFAULT_MAX_HEAP_MB);
        assert_eq!(config.max_lines(), DEFAULT_MAX_LINES);
        assert_eq!(
            config.enabled_slots().unwrap(),
            vec![SlotId::Center, SlotId::Login]
        );
    }

    #[test]
    fn rejects_duplicate_and_out_of_range_games() {
        let dup: Config = toml::from_str("[[game]]\nid = 2\n[[game]]\nid = 2\n").unwrap();
        assert!(dup.enabled_slots().is_err());
        let big: Config = toml::from_str("[[game]]\nid = 200\n").unwrap();
        assert!(big.enabled_slots().is_err());
    }

    #[test]
    fn load_config_reads_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.games.len(), 2);
    }

    #[test]
    fn load_config_reports_unknown_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"bogus = 1\n").unwrap();
        let err = load_config(file.path()).unwrap_err();
        assert!(format!("{:#}", err).contains("failed to parse config file"));
    }
}
