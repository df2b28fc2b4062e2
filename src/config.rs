//! Layered configuration: TOML file, then PIXELS_* environment variables,
//! then CLI flags (applied by main). Later layers win.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::errors::{Error, Result};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub truenas: TrueNas,
    pub defaults: Defaults,
    pub ssh: Ssh,
    pub checkpoint: Checkpoint,
    pub provision: Provision,
    pub network: Network,
    pub env: BTreeMap<String, EnvValue>,
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TrueNas {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub api_key: String,
    pub insecure_skip_verify: Option<bool>,
}

impl Default for TrueNas {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 443,
            username: "root".into(),
            api_key: String::new(),
            insecure_skip_verify: None,
        }
    }
}

impl std::fmt::Debug for TrueNas {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrueNas")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("api_key", &"[REDACTED]")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .finish()
    }
}

impl TrueNas {
    pub fn insecure_skip_verify(&self) -> bool {
        self.insecure_skip_verify.unwrap_or(false)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Defaults {
    pub image: String,
    pub cpu: String,
    /// MiB.
    pub memory: i64,
    pub pool: String,
    /// "macvlan" or "bridged"; empty enables NIC auto-detection.
    pub nic_type: String,
    /// Parent interface for the NIC (e.g. "eno1", "br0").
    pub parent: String,
    /// Nameservers written into containers.
    pub dns: Vec<String>,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            image: "ubuntu/24.04".into(),
            cpu: "2".into(),
            memory: 2048,
            pool: "tank".into(),
            nic_type: String::new(),
            parent: String::new(),
            dns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Ssh {
    pub user: String,
    pub key: String,
}

impl Default for Ssh {
    fn default() -> Self {
        Self { user: "pixel".into(), key: "~/.ssh/id_ed25519".into() }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Checkpoint {
    /// Overrides dataset auto-discovery when set.
    pub dataset_prefix: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Provision {
    pub enabled: Option<bool>,
    pub devtools: Option<bool>,
}

impl Provision {
    pub fn is_enabled(&self) -> bool {
        self.enabled.unwrap_or(true)
    }

    pub fn devtools_enabled(&self) -> bool {
        self.devtools.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Network {
    /// "unrestricted", "agent", or "allowlist".
    pub egress: String,
    pub allow: Vec<String>,
}

impl Default for Network {
    fn default() -> Self {
        Self { egress: "unrestricted".into(), allow: Vec::new() }
    }
}

/// One `[env]` entry: either a bare string or a structured value that
/// controls where it lands.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum EnvValue {
    Plain(String),
    Detailed {
        value: String,
        #[serde(default)]
        session_only: bool,
        #[serde(default)]
        forward: bool,
    },
}

pub fn validate_egress_mode(mode: &str) -> Result<()> {
    match mode {
        "unrestricted" | "agent" | "allowlist" => Ok(()),
        other => Err(Error::Validation(format!(
            "invalid egress mode {other:?}: must be unrestricted, agent, or allowlist"
        ))),
    }
}

impl Config {
    /// Loads the config file (when present) and applies environment
    /// overrides. CLI flags are layered on top by the caller.
    pub fn load() -> Result<Config> {
        let mut cfg = match std::fs::read_to_string(config_path()) {
            Ok(content) => Config::from_toml(&content)?,
            Err(_) => Config::default(),
        };
        cfg.apply_env_with(&|key| std::env::var(key).ok().filter(|v| !v.is_empty()));
        cfg.ssh.key = expand_home(&cfg.ssh.key);
        Ok(cfg)
    }

    pub fn from_toml(content: &str) -> Result<Config> {
        toml::from_str(content).map_err(|e| Error::Config(format!("parsing config: {e}")))
    }

    /// Applies PIXELS_* overrides through an injectable lookup so tests can
    /// run without touching the process environment.
    pub fn apply_env_with(&mut self, get: &dyn Fn(&str) -> Option<String>) {
        let apply = |dst: &mut String, key: &str| {
            if let Some(v) = get(key) {
                *dst = v;
            }
        };
        apply(&mut self.truenas.host, "PIXELS_TRUENAS_HOST");
        apply(&mut self.truenas.username, "PIXELS_TRUENAS_USERNAME");
        apply(&mut self.truenas.api_key, "PIXELS_TRUENAS_API_KEY");
        if let Some(port) = get("PIXELS_TRUENAS_PORT").and_then(|v| v.parse().ok()) {
            self.truenas.port = port;
        }
        if let Some(b) = get("PIXELS_TRUENAS_INSECURE").and_then(|v| v.parse().ok()) {
            self.truenas.insecure_skip_verify = Some(b);
        }
        apply(&mut self.defaults.image, "PIXELS_DEFAULT_IMAGE");
        apply(&mut self.defaults.cpu, "PIXELS_DEFAULT_CPU");
        if let Some(mem) = get("PIXELS_DEFAULT_MEMORY").and_then(|v| v.parse().ok()) {
            self.defaults.memory = mem;
        }
        apply(&mut self.defaults.pool, "PIXELS_DEFAULT_POOL");
        apply(&mut self.ssh.user, "PIXELS_SSH_USER");
        apply(&mut self.ssh.key, "PIXELS_SSH_KEY");
        apply(&mut self.checkpoint.dataset_prefix, "PIXELS_CHECKPOINT_DATASET_PREFIX");
    }

    /// Image-time /etc/environment entries. Plain string values get `$VAR`
    /// references expanded from the host environment; session-only entries
    /// are excluded.
    pub fn image_env(&self) -> BTreeMap<String, String> {
        self.image_env_with(&|key| std::env::var(key).ok())
    }

    pub fn image_env_with(&self, get: &dyn Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.env {
            match value {
                EnvValue::Plain(v) => {
                    out.insert(key.clone(), expand_vars(v, get));
                }
                EnvValue::Detailed { value, session_only, .. } => {
                    if !session_only {
                        out.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        out
    }

    /// Entries forwarded over the SSH protocol via SetEnv.
    pub fn forward_env(&self) -> BTreeMap<String, String> {
        let mut out = BTreeMap::new();
        for (key, value) in &self.env {
            if let EnvValue::Detailed { value, forward: true, .. } = value {
                out.insert(key.clone(), value.clone());
            }
        }
        out
    }
}

fn config_path() -> PathBuf {
    let base = match std::env::var_os("XDG_CONFIG_HOME") {
        Some(d) if !d.is_empty() => PathBuf::from(d),
        _ => std::env::var_os("HOME")
            .map(|h| PathBuf::from(h).join(".config"))
            .unwrap_or_else(|| PathBuf::from(".config")),
    };
    base.join("pixels").join("config.toml")
}

/// Expands `$VAR` and `${VAR}` references using the given lookup. Unknown
/// variables expand to the empty string.
fn expand_vars(input: &str, get: &dyn Fn(&str) -> Option<String>) -> String {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}|\$([A-Za-z_][A-Za-z0-9_]*)")
        .expect("static regex");
    re.replace_all(input, |caps: &regex::Captures<'_>| {
        let name = caps.get(1).or_else(|| caps.get(2)).map(|m| m.as_str()).unwrap_or("");
        get(name).unwrap_or_default()
    })
    .into_owned()
}

pub fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}
