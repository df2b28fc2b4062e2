//! Command implementations and the helpers they share.

pub mod authorize;
pub mod checkpoint;
pub mod console;
pub mod create;
pub mod destroy;
pub mod exec;
pub mod list;
pub mod network;
pub mod sessions;
pub mod start;
pub mod status;
pub mod stop;

use std::time::Duration;

use comfy_table::presets::NOTHING;
use comfy_table::Table;
use indicatif::ProgressBar;
use tracing::info;

use crate::cache::{self, Cache};
use crate::config::Config;
use crate::errors::{Error, Result};
use crate::truenas::types::VirtInstance;
use crate::truenas::Client;

/// Storage-name prefix for every container this tool manages. The RPC only
/// ever sees prefixed names; users only ever see stripped ones.
pub const CONTAINER_PREFIX: &str = "px-";

pub fn container_name(name: &str) -> String {
    format!("{CONTAINER_PREFIX}{name}")
}

pub fn display_name(name: &str) -> &str {
    name.strip_prefix(CONTAINER_PREFIX).unwrap_or(name)
}

/// First IPv4 alias address of an instance, or empty when none is assigned
/// yet. IPv6 aliases are never returned.
pub fn resolve_ip(instance: &VirtInstance) -> String {
    instance
        .aliases
        .iter()
        .find(|a| (a.kind == "INET" || a.kind == "ipv4") && !a.address.is_empty())
        .map(|a| a.address.clone())
        .unwrap_or_default()
}

pub fn format_bytes(bytes: i64) -> String {
    const UNIT: i64 = 1024;
    if bytes < UNIT {
        return format!("{bytes} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = bytes / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}iB", bytes as f64 / div as f64, ['K', 'M', 'G', 'T', 'P', 'E'][exp])
}

pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.load_preset(NOTHING);
    table.set_header(headers.to_vec());
    table
}

/// Connects to the appliance, failing early with a config hint when the
/// connection settings are incomplete.
pub async fn connect(cfg: &Config) -> Result<Client> {
    if cfg.truenas.host.is_empty() {
        return Err(Error::Config(
            "TrueNAS host not configured: set truenas.host in config or use --host".into(),
        ));
    }
    if cfg.truenas.api_key.is_empty() {
        return Err(Error::Config(
            "TrueNAS API key not configured: set truenas.api_key in config or use --api-key".into(),
        ));
    }
    Client::connect(cfg).await
}

/// Reads the public half of the configured SSH key. Empty when no key is
/// configured at all.
pub fn read_ssh_pub_key(cfg: &Config) -> Result<String> {
    if cfg.ssh.key.is_empty() {
        return Ok(String::new());
    }
    let pub_path = format!("{}.pub", cfg.ssh.key);
    let data = std::fs::read_to_string(&pub_path)
        .map_err(|e| Error::Config(format!("reading SSH public key {pub_path}: {e}")))?;
    Ok(data.trim().to_string())
}

/// Fingerprint of the currently configured public key; empty when the key
/// is missing or unreadable.
pub fn current_key_fingerprint(cfg: &Config) -> String {
    cache::fingerprint(&read_ssh_pub_key(cfg).unwrap_or_default())
}

/// Cache fast path: a RUNNING entry with an IP whose key fingerprint still
/// matches the local key. Anything else forces an RPC lookup.
pub fn cached_ip(cfg: &Config, name: &str) -> Option<String> {
    let entry = Cache::open().get(name)?;
    if entry.is_fast_path(&current_key_fingerprint(cfg)) {
        Some(entry.ip)
    } else {
        None
    }
}

pub fn cache_put(cfg: &Config, name: &str, ip: &str, status: &str) {
    Cache::open().put(
        name,
        &cache::Entry {
            ip: ip.to_string(),
            status: status.to_string(),
            key_fingerprint: current_key_fingerprint(cfg),
        },
    );
}

/// Verifies key auth against a pixel and, when it fails, pushes the local
/// public key through the appliance filesystem API.
pub async fn ensure_ssh_auth(cfg: &Config, ip: &str, name: &str) -> Result<()> {
    let cc = crate::ssh::ConnConfig {
        host: ip.to_string(),
        user: cfg.ssh.user.clone(),
        key_path: cfg.ssh.key.clone(),
        env: Default::default(),
    };
    if crate::ssh::test_auth(&cc).await.is_ok() {
        return Ok(());
    }

    let pub_key = read_ssh_pub_key(cfg)?;
    if pub_key.is_empty() {
        return Err(Error::Auth("SSH key auth failed and no public key configured".into()));
    }

    eprintln!("SSH key not authorized, updating...");
    let client = connect(cfg).await?;
    let res = client.write_authorized_key(&container_name(name), &pub_key).await;
    client.close().await;
    res
}

/// ZFS dataset path for a pixel. Priority: config override, then the
/// appliance's virt config, then the conventional `<pool>/incus/containers`
/// layout as a last resort.
pub async fn resolve_dataset_path(client: &Client, cfg: &Config, name: &str) -> Result<String> {
    let cname = container_name(name);
    if !cfg.checkpoint.dataset_prefix.is_empty() {
        return Ok(format!("{}/{cname}", cfg.checkpoint.dataset_prefix));
    }
    match client.container_dataset(&cname).await {
        Ok(dataset) => Ok(dataset),
        Err(e) => {
            if cfg.defaults.pool.is_empty() {
                return Err(e);
            }
            tracing::debug!("dataset auto-discovery failed ({e}), using conventional path");
            Ok(format!("{}/incus/containers/{cname}", cfg.defaults.pool))
        }
    }
}

/// Spinner for non-verbose runs; verbose runs log phases instead.
pub struct Phase {
    bar: Option<ProgressBar>,
}

impl Phase {
    pub fn new(verbose: bool) -> Self {
        if verbose {
            return Self { bar: None };
        }
        let bar = ProgressBar::new_spinner();
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar: Some(bar) }
    }

    pub fn set_status(&self, msg: &str) {
        match &self.bar {
            Some(bar) => bar.set_message(msg.to_string()),
            None => info!("{msg}"),
        }
    }

    pub fn finish(&self) {
        if let Some(bar) = &self.bar {
            bar.finish_and_clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::truenas::types::VirtAlias;

    #[test]
    fn names_round_trip() {
        assert_eq!(container_name("my-project"), "px-my-project");
        assert_eq!(display_name("px-my-project"), "my-project");
        assert_eq!(display_name("px-sandbox"), "sandbox");
        assert_eq!(display_name("no-prefix"), "no-prefix");
    }

    fn instance_with(aliases: Vec<VirtAlias>) -> VirtInstance {
        serde_json::from_value(serde_json::json!({"name": "px-a", "status": "RUNNING"}))
            .map(|mut i: VirtInstance| {
                i.aliases = aliases;
                i
            })
            .unwrap()
    }

    #[test]
    fn resolve_ip_picks_first_ipv4() {
        let inst = instance_with(vec![]);
        assert_eq!(resolve_ip(&inst), "");

        let inst = instance_with(vec![VirtAlias { kind: "INET".into(), address: "10.0.0.1".into() }]);
        assert_eq!(resolve_ip(&inst), "10.0.0.1");

        let inst = instance_with(vec![VirtAlias { kind: "ipv4".into(), address: "192.168.1.5".into() }]);
        assert_eq!(resolve_ip(&inst), "192.168.1.5");

        // IPv6 and empty-address aliases are skipped.
        let inst = instance_with(vec![
            VirtAlias { kind: "INET6".into(), address: "::1".into() },
            VirtAlias { kind: "INET".into(), address: String::new() },
            VirtAlias { kind: "INET".into(), address: "10.0.0.2".into() },
        ]);
        assert_eq!(resolve_ip(&inst), "10.0.0.2");
    }

    #[test]
    fn format_bytes_boundaries() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.0 KiB");
        assert_eq!(format_bytes(1048576), "1.0 MiB");
        assert_eq!(format_bytes(1073741824), "1.0 GiB");
        assert_eq!(format_bytes(1536), "1.5 KiB");
    }

    #[test]
    fn format_bytes_monotonic_across_boundaries() {
        let samples: [i64; 6] = [1000, 1024, 500_000, 1_048_576, 900_000_000, 1_073_741_824];
        let parse = |s: &str| -> f64 {
            let (num, unit) = s.split_once(' ').unwrap();
            let factor: f64 = match unit {
                "B" => 1.0,
                "KiB" => 1024.0,
                "MiB" => 1024.0 * 1024.0,
                "GiB" => 1024.0 * 1024.0 * 1024.0,
                _ => panic!("unexpected unit {unit}"),
            };
            num.parse::<f64>().unwrap() * factor
        };
        for pair in samples.windows(2) {
            assert!(
                parse(&format_bytes(pair[0])) <= parse(&format_bytes(pair[1])),
                "format_bytes not monotonic between {} and {}",
                pair[0],
                pair[1]
            );
        }
    }
}
