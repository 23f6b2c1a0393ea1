//! Agent launch configuration (`codex.toml`).
//!
//! The `[tooldex]` table says how to start the agent binary; the optional
//! `[tooldex.wrapper]` table tunes the PTY wrapper; everything under
//! `[codex]` is forwarded to the agent as `--config key=value` overrides.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use toml::{Table, Value};
use tracing::debug;

use tooldex_core::SplitLayout;

pub const CONFIG_FILENAME: &str = "codex.toml";
/// Explicit config file path.
pub const CODEX_CONFIG_ENV: &str = "TOOLDEX_CODEX_CONFIG";
/// Extra directory searched for `codex.toml`.
pub const CONFIG_DIR_ENV: &str = "TOOLDEX_CONFIG_DIR";

/// Used when no config file is found anywhere.
pub const BUILTIN_CONFIG: &str = r#"[tooldex]
binary = "codex"
args = []
config_flag = "--config"
terminal_mcp = "tooldex"

[codex.mcp_servers.tooldex]
command = "tooldex-mcp"
args = []
"#;

/// Where the configuration came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Builtin,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigSource::File(path) => write!(f, "{}", path.display()),
            ConfigSource::Builtin => f.write_str("<built-in>"),
        }
    }
}

/// Inputs to config path resolution, captured once so tests can fake them.
#[derive(Debug, Clone, Default)]
pub struct SearchPaths {
    pub cwd: PathBuf,
    pub home: Option<PathBuf>,
    pub env_config: Option<String>,
    pub config_dir: Option<String>,
    pub xdg_config_home: Option<String>,
}

impl SearchPaths {
    pub fn from_env() -> Self {
        Self {
            cwd: std::env::current_dir().unwrap_or_default(),
            home: dirs::home_dir(),
            env_config: non_empty_var(CODEX_CONFIG_ENV),
            config_dir: non_empty_var(CONFIG_DIR_ENV),
            xdg_config_home: non_empty_var("XDG_CONFIG_HOME"),
        }
    }

    fn expand(&self, path: &str) -> PathBuf {
        match (path.strip_prefix("~/"), &self.home) {
            (Some(rest), Some(home)) => home.join(rest),
            _ if path == "~" => self.home.clone().unwrap_or_else(|| PathBuf::from(path)),
            _ => PathBuf::from(path),
        }
    }

    /// Directories searched for `codex.toml`, most specific first.
    fn directories(&self) -> Vec<PathBuf> {
        let mut dirs = vec![self.cwd.join(".tooldex")];
        if let Some(dir) = &self.config_dir {
            dirs.push(self.expand(dir));
        }
        match (&self.xdg_config_home, &self.home) {
            (Some(xdg), _) => dirs.push(self.expand(xdg).join("tooldex")),
            (None, Some(home)) => dirs.push(home.join(".config").join("tooldex")),
            (None, None) => {}
        }
        if let Some(home) = &self.home {
            dirs.push(home.join(".tooldex"));
        }
        dirs
    }
}

fn non_empty_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// Pick the config file: explicit path, then `$TOOLDEX_CODEX_CONFIG`, then
/// the search directories, then the built-in default.
pub fn resolve_config_path(explicit: Option<&str>, search: &SearchPaths) -> Result<ConfigSource> {
    if let Some(path) = explicit {
        let candidate = search.expand(path);
        if !candidate.is_file() {
            bail!("config '{}' does not exist", candidate.display());
        }
        return Ok(ConfigSource::File(candidate));
    }

    if let Some(path) = &search.env_config {
        let candidate = search.expand(path);
        if !candidate.is_file() {
            bail!(
                "config '{}' from {CODEX_CONFIG_ENV} does not exist",
                candidate.display()
            );
        }
        return Ok(ConfigSource::File(candidate));
    }

    for dir in search.directories() {
        let candidate = dir.join(CONFIG_FILENAME);
        if candidate.is_file() {
            return Ok(ConfigSource::File(candidate));
        }
        debug!(path = %candidate.display(), "no config here");
    }
    Ok(ConfigSource::Builtin)
}

/// `[tooldex.wrapper]`: defaults for `tooldex wrap`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WrapperConfig {
    /// Command started in the agent pane.
    pub utility: Option<String>,
    pub trigger_key: Option<char>,
    pub marker: Option<String>,
    pub grace_period_secs: Option<f64>,
    pub split: Option<SplitLayout>,
}

/// Parsed `codex.toml`.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub binary: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    /// Flag used to pass each override (`None` disables overrides).
    pub config_flag: Option<String>,
    /// MCP server id that receives the primary pane in its environment.
    pub terminal_mcp: Option<String>,
    pub wrapper: WrapperConfig,
    /// The `[codex]` table.
    pub overrides: Table,
}

impl AgentConfig {
    pub fn load(source: &ConfigSource) -> Result<Self> {
        match source {
            ConfigSource::Builtin => Self::parse(BUILTIN_CONFIG),
            ConfigSource::File(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config '{}'", path.display()))?;
                Self::parse(&text).with_context(|| format!("invalid config '{}'", path.display()))
            }
        }
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut data: Table = toml::from_str(text).context("failed to parse TOML")?;

        let tooldex = match data.remove("tooldex") {
            Some(Value::Table(t)) => t,
            Some(_) => bail!("[tooldex] must be a table"),
            None => bail!("config must define a [tooldex] table"),
        };

        let binary = match tooldex.get("binary") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(_) => bail!("[tooldex].binary must be a non-empty string"),
            None => bail!("[tooldex] table must define 'binary'"),
        };

        let args = match tooldex.get("args") {
            None => Vec::new(),
            Some(Value::Array(items)) => items.iter().map(scalar_string).collect(),
            Some(_) => bail!("[tooldex].args must be a list"),
        };

        let config_flag = match tooldex.get("config_flag") {
            None => Some("--config".to_string()),
            Some(Value::String(s)) if s.is_empty() => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Boolean(false)) => None,
            Some(_) => bail!("[tooldex].config_flag must be a string"),
        };

        let mut env = BTreeMap::new();
        match tooldex.get("env") {
            None => {}
            Some(Value::Table(table)) => {
                for (key, value) in table {
                    match value {
                        Value::String(_) | Value::Integer(_) | Value::Float(_) | Value::Boolean(_) => {
                            env.insert(key.clone(), scalar_string(value));
                        }
                        _ => bail!("[tooldex].env value for '{key}' must be scalar"),
                    }
                }
            }
            Some(_) => bail!("[tooldex].env must be a table"),
        }

        let terminal_mcp = match tooldex.get("terminal_mcp") {
            None => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(_) => bail!("[tooldex].terminal_mcp must be a string"),
        };

        let wrapper = match tooldex.get("wrapper") {
            None => WrapperConfig::default(),
            Some(value @ Value::Table(_)) => value
                .clone()
                .try_into::<WrapperConfig>()
                .context("invalid [tooldex.wrapper] table")?,
            Some(_) => bail!("[tooldex.wrapper] must be a table"),
        };

        let overrides = match data.remove("codex") {
            None => Table::new(),
            Some(Value::Table(t)) => t,
            Some(_) => bail!("[codex] must be a table"),
        };

        Ok(Self {
            binary,
            args,
            env,
            config_flag,
            terminal_mcp,
            wrapper,
            overrides,
        })
    }
}

fn scalar_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Flatten nested tables into dotted keys: `{a = {b = 1}}` → `a.b = 1`.
pub fn flatten_overrides(overrides: &Table) -> Vec<(String, Value)> {
    fn walk(prefix: String, value: &Value, out: &mut Vec<(String, Value)>) {
        match value {
            Value::Table(table) => {
                for (key, nested) in table {
                    walk(format!("{prefix}.{key}"), nested, out);
                }
            }
            other => out.push((prefix, other.clone())),
        }
    }

    let mut out = Vec::new();
    for (key, value) in overrides {
        walk(key.clone(), value, &mut out);
    }
    out
}

fn quote(s: &str) -> String {
    format!("\"{}\"", s.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Render a value the way it would be written on the right of `key = ...`.
pub fn format_toml_value(value: &Value) -> String {
    match value {
        Value::String(s) => quote(s),
        Value::Integer(i) => i.to_string(),
        Value::Float(f) => format!("{f:?}"),
        Value::Boolean(b) => b.to_string(),
        Value::Datetime(d) => d.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(format_toml_value).collect();
            format!("[{}]", items.join(", "))
        }
        Value::Table(table) => {
            let pairs: Vec<String> = table
                .iter()
                .map(|(k, v)| format!("{} = {}", quote(k), format_toml_value(v)))
                .collect();
            format!("{{{}}}", pairs.join(", "))
        }
    }
}

/// Add `vars` to `mcp_servers.<server>.env` in the overrides.
pub fn inject_mcp_env(overrides: &mut Table, server: &str, vars: &[(&str, &str)]) -> Result<()> {
    let servers = overrides
        .entry("mcp_servers")
        .or_insert(Value::Table(Table::new()));
    let Value::Table(servers) = servers else {
        bail!("codex.mcp_servers must be a table");
    };
    let entry = servers
        .entry(server)
        .or_insert(Value::Table(Table::new()));
    let Value::Table(entry) = entry else {
        bail!("codex.mcp_servers.{server} must be a table");
    };
    let env = entry
        .entry("env")
        .or_insert(Value::Table(Table::new()));
    let Value::Table(env) = env else {
        bail!("codex.mcp_servers.{server}.env must be a table");
    };
    for (key, value) in vars {
        env.insert(key.to_string(), Value::String(value.to_string()));
    }
    Ok(())
}

/// Full agent argv: binary, configured args, overrides, then `extra`.
pub fn build_command(config: &AgentConfig, overrides: &Table, extra: &[String]) -> Vec<String> {
    let mut command = vec![config.binary.clone()];
    command.extend(config.args.iter().cloned());
    if let Some(flag) = &config.config_flag {
        for (key, value) in flatten_overrides(overrides) {
            command.push(flag.clone());
            command.push(format!("{key}={}", format_toml_value(&value)));
        }
    }
    command.extend(extra.iter().cloned());
    command
}

/// Join argv for display, quoting anything a shell would split.
pub fn shell_join(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            let plain = !arg.is_empty()
                && arg
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
            if plain {
                arg.clone()
            } else {
                format!("'{}'", arg.replace('\'', r"'\''"))
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

pub fn expand_path(path: &Path) -> PathBuf {
    let search = SearchPaths {
        home: dirs::home_dir(),
        ..SearchPaths::default()
    };
    search.expand(&path.to_string_lossy())
}
