//! Command-line construction for server slots.
//!
//! Every slot is launched from a fully resolved [`CommandSpec`]. For JVM servers
//! the vector is assembled from the shared configuration (java path, classpath,
//! heap limit, JVM options) followed by the `-Dkey=value` pointers that tell the
//! server where its own configuration lives.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use crate::config::{Config, ServerConfig};
use crate::error::LaunchError;
use crate::slot::SlotId;

/// Property carrying the world id handed to game servers.
pub const GAME_ID_PROPERTY: &str = "argonms.game.serverid";

/// A resolved command: program, ordered arguments and working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        f.write_str(&shell_words::join(parts))
    }
}

/// Resolves a slot to the command that launches it.
///
/// Called once per `start`, so configuration edits apply to the next run.
pub trait CommandSource: Send + Sync {
    fn resolve(&self, slot: SlotId) -> Result<CommandSpec, LaunchError>;
}

fn default_main_class(slot: SlotId) -> &'static str {
    match slot {
        SlotId::Center => "argonms.center.CenterServer",
        SlotId::Login => "argonms.login.LoginServer",
        SlotId::Game(_) => "argonms.game.GameServer",
        SlotId::Shop => "argonms.shop.ShopServer",
    }
}

fn java_executable(config: &Config) -> String {
    if let Some(java) = &config.java {
        return java.clone();
    }
    if let Some(home) = std::env::var_os("JAVA_HOME") {
        let mut path = PathBuf::from(home);
        path.push("bin");
        path.push("java");
        return path.to_string_lossy().into_owned();
    }
    "java".to_string()
}

fn join_classpath(slot: SlotId, entries: &[String]) -> Result<String, LaunchError> {
    let joined = std::env::join_paths(entries).map_err(|err| LaunchError::Command {
        slot,
        reason: format!("invalid classpath entry: {}", err),
    })?;
    Ok(joined.to_string_lossy().into_owned())
}

/// Builds the command for `slot` from `config`.
pub fn build_command(config: &Config, slot: SlotId) -> Result<CommandSpec, LaunchError> {
    let fallback = ServerConfig::default();
    let server = config.server(slot).unwrap_or(&fallback);

    let mut spec = if let Some(program) = &server.program {
        CommandSpec::new(program.clone()).args(server.args.iter().cloned())
    } else {
        build_jvm_command(config, server, slot)?
    };
    if let Some(dir) = &config.working_dir {
        spec = spec.cwd(dir);
    }
    Ok(spec)
}

fn build_jvm_command(
    config: &Config,
    server: &ServerConfig,
    slot: SlotId,
) -> Result<CommandSpec, LaunchError> {
    let mut spec = CommandSpec::new(java_executable(config));
    if !config.classpath.is_empty() {
        spec = spec
            .arg("-classpath")
            .arg(join_classpath(slot, &config.classpath)?);
    }
    spec = spec.arg(format!("-Xmx{}m", config.max_heap_mb()));
    if let Some(options) = &config.jvm_args {
        let options = shell_words::split(options).map_err(|err| LaunchError::Command {
            slot,
            reason: format!("cannot parse jvm_args: {}", err),
        })?;
        spec = spec.args(options);
    }

    let mut properties: BTreeMap<&str, &str> = config
        .properties
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    for (key, value) in &server.properties {
        properties.insert(key, value);
    }
    let game_id = match slot {
        SlotId::Game(id) => Some(id.to_string()),
        _ => None,
    };
    if let Some(id) = &game_id {
        properties.insert(GAME_ID_PROPERTY, id);
    }
    spec = spec.args(
        properties
            .iter()
            .map(|(key, value)| format!("-D{}={}", key, value)),
    );

    let main_class = server
        .main_class
        .as_deref()
        .unwrap_or_else(|| default_main_class(slot));
    Ok(spec.arg(main_class).args(server.args.iter().cloned()))
}

impl CommandSource for Config {
    fn resolve(&self, slot: SlotId) -> Result<CommandSpec, LaunchError> {
        build_command(self, slot)
    }
}
