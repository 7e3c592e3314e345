use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;

use crate::culvert::relay;

#[derive(Debug, Clone)]
pub struct ResolvedConfigPath {
    pub path: PathBuf,
    pub source: ConfigPathSource,
}

#[derive(Debug, Clone, Copy)]
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

pub fn resolve_config_path(
    explicit_flag_path: Option<PathBuf>,
) -> anyhow::Result<ResolvedConfigPath> {
    if let Some(p) = explicit_flag_path {
        let p = normalize_explicit_path(&p)?;
        return Ok(ResolvedConfigPath {
            path: p,
            source: ConfigPathSource::Flag,
        });
    }

    // clap already maps CULVERT_CONFIG into the flag value when unset, but keep the design's
    // precedence clear by treating it as "env" when present.
    if let Some(p) = std::env::var_os("CULVERT_CONFIG") {
        if !p.is_empty() {
            let p = normalize_explicit_path(Path::new(&p))?;
            return Ok(ResolvedConfigPath {
                path: p,
                source: ConfigPathSource::Env,
            });
        }
    }

    if let Ok(p) = discover_config_path(Path::new(".")) {
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
    let p = p.to_path_buf();

    if p.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    let meta = fs::metadata(&p);
    if let Ok(m) = meta {
        if m.is_dir() {
            if let Ok(discovered) = discover_config_path(&p) {
                return Ok(discovered);
            }
            return Ok(p.join("culvert.toml"));
        }
        return Ok(p);
    }

    // Non-existent path: default to .toml if no extension.
    let mut out = p;
    if out.extension().is_none() {
        out.set_extension("toml");
    }
    Ok(out)
}

fn discover_config_path(dir: &Path) -> anyhow::Result<PathBuf> {
    let candidates = ["culvert.toml", "culvert.yaml", "culvert.yml"];
    for c in candidates {
        let p = dir.join(c);
        if let Ok(m) = fs::metadata(&p) {
            if m.is_file() {
                return Ok(p);
            }
        }
    }
    anyhow::bail!("config: no culvert.* found")
}

fn default_config_path() -> anyhow::Result<PathBuf> {
    // Linux: system-wide default.
    #[cfg(target_os = "linux")]
    {
        return Ok(PathBuf::from("/etc/culvert/culvert.toml"));
    }

    // Other OSes: per-user config dir.
    #[cfg(not(target_os = "linux"))]
    {
        use directories::ProjectDirs;
        let proj = ProjectDirs::from("com", "culvert", "culvert")
            .context("config: resolve user config dir")?;
        Ok(proj.config_dir().join("culvert.toml"))
    }
}

pub fn ensure_config_file(path: &Path) -> anyhow::Result<bool> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("config: empty config path");
    }

    match fs::metadata(path) {
        Ok(m) => {
            if m.is_file() {
                return Ok(false);
            }
            anyhow::bail!(
                "config: {} exists but is not a regular file",
                path.display()
            );
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => return Err(err).with_context(|| format!("config: stat {}", path.display())),
    }

    let tmpl = default_config_template_for_path(path)?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("config: mkdir {}", parent.display()))?;
        }
    }

    // Create once (O_EXCL equivalent).
    let mut opts = fs::OpenOptions::new();
    opts.write(true).create_new(true);
    let mut f = opts
        .open(path)
        .with_context(|| format!("config: create {}", path.display()))?;
    use std::io::Write;
    f.write_all(tmpl.as_bytes())
        .with_context(|| format!("config: write {}", path.display()))?;
    Ok(true)
}

fn default_config_template_for_path(path: &Path) -> anyhow::Result<&'static str> {
    let ext = path
        .extension()
        .and_then(|s| s.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match ext.as_str() {
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

    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();

    let fc: FileConfig = match ext.as_str() {
        "toml" => toml::from_str(&s).with_context(|| format!("parse toml {}", path.display()))?,
        "yaml" | "yml" => {
            serde_yaml::from_str(&s).with_context(|| format!("parse yaml {}", path.display()))?
        }
        _ => anyhow::bail!("config: unsupported config extension {}", ext),
    };

    Config::from_file_config(fc)
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: String,
    pub admin_addr: String,
    pub logging: LoggingConfig,
    pub relay: RelayConfig,
    pub handshake: HandshakeConfig,
    pub dial_timeout: Duration,
}

/// Tunnel-core knobs. Zero in the file means "use the default"; an idle
/// timeout of zero means disabled.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub frame_size: usize,
    pub channel_capacity: usize,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HandshakeConfig {
    pub timeout: Duration,
    pub max_header_bytes: usize,
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub output: String,
    pub add_source: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    #[serde(default)]
    listen_addr: String,

    #[serde(default)]
    admin_addr: String,

    logging: Option<FileLogging>,

    relay: Option<FileRelay>,

    handshake: Option<FileHandshake>,

    dial_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileLogging {
    level: Option<String>,
    format: Option<String>,
    output: Option<String>,
    #[serde(default)]
    add_source: bool,
}

#[derive(Debug, Deserialize)]
struct FileRelay {
    frame_size: Option<i64>,
    channel_capacity: Option<i64>,
    idle_timeout_ms: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileHandshake {
    timeout_ms: Option<i64>,
    max_header_bytes: Option<i64>,
}

impl Config {
    fn from_file_config(fc: FileConfig) -> anyhow::Result<Config> {
        let mut cfg = Config {
            listen_addr: fc.listen_addr.trim().to_string(),
            admin_addr: fc.admin_addr.trim().to_string(),
            logging: LoggingConfig {
                level: "info".into(),
                format: "json".into(),
                output: "stderr".into(),
                add_source: false,
            },
            relay: RelayConfig {
                frame_size: fc
                    .relay
                    .as_ref()
                    .and_then(|r| r.frame_size)
                    .unwrap_or(0)
                    .max(0) as usize,
                channel_capacity: fc
                    .relay
                    .as_ref()
                    .and_then(|r| r.channel_capacity)
                    .unwrap_or(0)
                    .max(0) as usize,
                idle_timeout: Duration::from_millis(
                    fc.relay
                        .as_ref()
                        .and_then(|r| r.idle_timeout_ms)
                        .unwrap_or(0)
                        .max(0) as u64,
                ),
            },
            handshake: HandshakeConfig {
                timeout: Duration::from_millis(
                    fc.handshake
                        .as_ref()
                        .and_then(|h| h.timeout_ms)
                        .unwrap_or(10_000)
                        .max(0) as u64,
                ),
                max_header_bytes: fc
                    .handshake
                    .as_ref()
                    .and_then(|h| h.max_header_bytes)
                    .unwrap_or(0)
                    .max(0) as usize,
            },
            dial_timeout: Duration::from_millis(fc.dial_timeout_ms.unwrap_or(5_000).max(0) as u64),
        };

        if cfg.listen_addr.is_empty() {
            cfg.listen_addr = ":7777".into();
        }
        if cfg.relay.frame_size == 0 {
            cfg.relay.frame_size = relay::DEFAULT_FRAME_SIZE;
        }
        if cfg.relay.channel_capacity == 0 {
            cfg.relay.channel_capacity = relay::DEFAULT_CHANNEL_CAPACITY;
        }
        if cfg.handshake.max_header_bytes == 0 {
            cfg.handshake.max_header_bytes = 1 << 20;
        }

        if let Some(l) = &fc.logging {
            if let Some(level) = &l.level {
                if !level.trim().is_empty() {
                    cfg.logging.level = level.trim().to_string();
                }
            }
            if let Some(fmt) = &l.format {
                if !fmt.trim().is_empty() {
                    cfg.logging.format = fmt.trim().to_string();
                }
            }
            if let Some(out) = &l.output {
                if !out.trim().is_empty() {
                    cfg.logging.output = out.trim().to_string();
                }
            }
            cfg.logging.add_source = l.add_source;
        }

        Ok(cfg)
    }
}

const DEFAULT_CONFIG_TEMPLATE_TOML: &str = r#"# Culvert configuration (auto-generated)
#
# This file was created because Culvert could not find a configuration file at
# the resolved config path. The defaults below are runnable without edits:
# Culvert listens for HTTP CONNECT requests and tunnels them to the requested
# host:port.

# ":PORT" binds on all interfaces.
listen_addr = ":7777"

# Admin/observability HTTP server (/health, /metrics, /conns).
# Empty disables it.
admin_addr = ""

# Outbound connect timeout. 0 disables it.
dial_timeout_ms = 5000

[relay]
# Bytes per read/write chunk. 0 uses the default (16 KiB).
frame_size = 0
# Frames buffered per direction before the reader stalls. 0 uses the
# default (8).
channel_capacity = 0
# Per-direction inactivity limit. 0 disables.
idle_timeout_ms = 0

[handshake]
# Deadline for reading the CONNECT request head. 0 disables it.
timeout_ms = 10000
# Cap on the CONNECT request head. 0 uses the default (1 MiB).
max_header_bytes = 0

[logging]
level = "info"
format = "json"
output = "stderr"
add_source = false

"#;

const DEFAULT_CONFIG_TEMPLATE_YAML: &str = r#"# Culvert configuration (auto-generated)
#
# This file was created because Culvert could not find a configuration file at
# the resolved config path. The defaults below are runnable without edits:
# Culvert listens for HTTP CONNECT requests and tunnels them to the requested
# host:port.

# ":PORT" binds on all interfaces.
listen_addr: ":7777"

# Admin/observability HTTP server (/health, /metrics, /conns).
# Empty disables it.
admin_addr: ""

# Outbound connect timeout. 0 disables it.
dial_timeout_ms: 5000

relay:
  # Bytes per read/write chunk. 0 uses the default (16 KiB).
  frame_size: 0
  # Frames buffered per direction before the reader stalls. 0 uses the
  # default (8).
  channel_capacity: 0
  # Per-direction inactivity limit. 0 disables.
  idle_timeout_ms: 0

handshake:
  # Deadline for reading the CONNECT request head. 0 disables it.
  timeout_ms: 10000
  # Cap on the CONNECT request head. 0 uses the default (1 MiB).
  max_header_bytes: 0

logging:
  level: "info"
  format: "json"
  output: "stderr"
  add_source: false

"#;
