use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
#[cfg(not(target_os = "linux"))]
use directories::ProjectDirs;
use serde::Deserialize;

use crate::rtun::tunnel::{client::ClientOptions, service::ServiceOptions};

pub const CONFIG_ENV: &str = "RTUN_CONFIG";

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigPathSource {
    Flag,
    Env,
    Cwd,
    Default,
}

impl std::fmt::Display for ConfigPathSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigPathSource::Flag => write!(f, "flag"),
            ConfigPathSource::Env => write!(f, "env"),
            ConfigPathSource::Cwd => write!(f, "cwd"),
            ConfigPathSource::Default => write!(f, "default"),
        }
    }
}

/// Resolves the config path: explicit flag, then `RTUN_CONFIG`, then
/// `rtun.toml` > `rtun.yaml` > `rtun.yml` in the working directory, then the
/// OS default.
pub fn resolve_config_path(flag: Option<PathBuf>) -> anyhow::Result<ResolvedConfigPath> {
    resolve_config_path_in(flag, std::env::var_os(CONFIG_ENV).map(PathBuf::from), Path::new("."))
}

fn resolve_config_path_in(
    flag: Option<PathBuf>,
    env: Option<PathBuf>,
    cwd: &Path,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = flag {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Flag,
        });
    }

    // clap folds RTUN_CONFIG into the flag; this covers callers that bypass the CLI.
    if let Some(p) = env.filter(|p| !p.as_os_str().is_empty()) {
        return Ok(ResolvedConfigPath {
            path: normalize_explicit_path(&p)?,
            source: ConfigPathSource::Env,
        });
    }

    if let Some(p) = discover_config_path(cwd) {
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Cwd,
        });
    }

    Ok(ResolvedConfigPath {
        path: default_config_path()?,
        source: ConfigPathSource::Default,
    })
}

fn normalize_explicit_path(p: &Path) -> anyhow::Result<PathBuf> {
    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    if let Ok(m) = fs::metadata(p) {
        if m.is_dir() {
            return Ok(discover_config_path(p).unwrap_or_else(|| p.join("rtun.toml")));
        }
        return Ok(p.to_path_buf());
    }

    let mut out = p.to_path_buf();
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> Option<PathBuf> {
    ["rtun.toml", "rtun.yaml", "rtun.yml"]
        .into_iter()
        .map(|c| dir.join(c))
        .find(|p| fs::metadata(p).map(|m| m.is_file()).unwrap_or(false))
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    #[cfg(target_os = "linux")]
    {
        Ok(PathBuf::from("/etc/rtun/rtun.toml"))
    }

    #[cfg(not(target_os = "linux"))]
    {
        let proj =
            ProjectDirs::from("dev", "rtun", "rtun").context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("rtun.toml"))
    }
}

/// Writes the commented template to `path` if nothing is there yet. Returns
/// whether a file was created.
pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) if m.is_file() => return Ok(false),
        Ok(_) => anyhow::bail!("config: {} exists but is not a regular file", path.display()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    let mut f = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn extension(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase()
}

fn template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    match extension(path).as_str() {
        "toml" => Ok(DEFAULT_CONFIG_TEMPLATE_TOML),
        "yaml" | "yml" => Ok(DEFAULT_CONFIG_TEMPLATE_YAML),
        _ => anyhow::bail!(
            "config: unsupported config extension {:?} (expected .toml or .yaml/.yml)",
            path.extension()
        ),
    }
}

pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let data = fs::read(path).with_context(|| format!("read {}", path.display()))?;
    let s = String::from_utf8_lossy(&data);

    let fc: FileConfig = match extension(path).as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        ext => anyhow::bail!("config: unsupported config extension {ext:?}"),
    };

    Config::from_file_config(fc).with_context(|| format!("config: {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct Config {
    pub server_addr: String,
    pub dial_timeout: Duration,
    pub header_timeout: Duration,
    pub local_dial_timeout: Duration,
    pub idle_timeout: Duration,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "json".into(),
            output: "stderr".into(),
            add_source: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub name: String,
    pub local_addr: String,
    /// Falls back to the top-level `auth_token` when unset.
    pub token: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    server_addr: String,
    auth_token: Option<String>,
    dial_timeout_ms: Option<i64>,
    header_timeout_ms: Option<i64>,
    local_dial_timeout_ms: Option<i64>,
    idle_timeout_ms: Option<i64>,
    #[serde(default)]
    admin_addr: String,
    logging: Option<FileLogging>,
    #[serde(default)]
    proxies: Vec<FileProxy>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileProxy {
    name: String,
    local_addr: String,
    token: Option<String>,
}

fn millis(v: Option<i64>, default: u64) -> Duration {
    Duration::from_millis(v.map(|ms| ms.max(0) as u64).unwrap_or(default))
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let server_addr = fc.server_addr.trim().to_string();
        if server_addr.is_empty() {
            anyhow::bail!("server_addr is required");
        }

        let auth_token = fc.auth_token.unwrap_or_default();

        let defaults = LoggingConfig::default();
        let logging = match fc.logging {
            Some(l) => LoggingConfig {
                level: l.level.unwrap_or(defaults.level),
                format: l.format.unwrap_or(defaults.format),
                output: l.output.unwrap_or(defaults.output),
                add_source: l.add_source,
            },
            None => defaults,
        };

        let mut seen = HashSet::new();
        let mut proxies = Vec::with_capacity(fc.proxies.len());
        for (i, p) in fc.proxies.into_iter().enumerate() {
            let name = p.name.trim().to_string();
            if name.is_empty() {
                anyhow::bail!("proxies[{i}]: name is required");
            }
            if !seen.insert(name.clone()) {
                anyhow::bail!("proxies[{i}]: duplicate name {name:?}");
            }
            let local_addr = p.local_addr.trim().to_string();
            if local_addr.is_empty() {
                anyhow::bail!("proxies[{i}] ({name}): local_addr is required");
            }
            proxies.push(ProxyConfig {
                name,
                local_addr,
                token: p.token.unwrap_or_else(|| auth_token.clone()),
            });
        }

        Ok(Config {
            server_addr,
            dial_timeout: millis(fc.dial_timeout_ms, 5000),
            header_timeout: millis(fc.header_timeout_ms, 10_000),
            local_dial_timeout: millis(fc.local_dial_timeout_ms, 5000),
            idle_timeout: millis(fc.idle_timeout_ms, 0),
            admin_addr: fc.admin_addr.trim().to_string(),
            logging,
            proxies,
        })
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            dial_timeout: self.dial_timeout,
            header_timeout: self.header_timeout,
            forward: ServiceOptions {
                dial_timeout: self.local_dial_timeout,
                idle_timeout: self.idle_timeout,
            },
        }
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# rtun configuration (auto-generated)
#
# rtun connects out to a tunnel server and exposes the local services listed
# under [[proxies]] through it. Set server_addr and at least one proxy.

server_addr = "127.0.0.1:7000"
auth_token = ""

dial_timeout_ms = 5000
header_timeout_ms = 10000
local_dial_timeout_ms = 5000
idle_timeout_ms = 0

# Admin HTTP server (/health, /metrics, /proxies). Empty disables it.
admin_addr = ""

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

# [[proxies]]
# name = "web"
# local_addr = "127.0.0.1:8080"
# token = ""  # overrides auth_token for this proxy
"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# rtun configuration (auto-generated)
#
# rtun connects out to a tunnel server and exposes the local services listed
# under proxies through it. Set server_addr and at least one proxy.

server_addr: "127.0.0.1:7000"
auth_token: ""

dial_timeout_ms: 5000
header_timeout_ms: 10000
local_dial_timeout_ms: 5000
idle_timeout_ms: 0

# Admin HTTP server (/health, /metrics, /proxies). Empty disables it.
admin_addr: ""

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

proxies: []
#  - name: "web"
#    local_addr: "127.0.0.1:8080"
#    token: ""  # overrides auth_token for this proxy
"#;
