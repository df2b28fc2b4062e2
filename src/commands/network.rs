//! `network`: inspect and mutate a pixel's egress policy at runtime.
//!
//! Policy files are written through the appliance filesystem API (so they
//! are byte-identical to what provisioning stages) and activated by running
//! the resolve script in the guest over SSH.

use clap::Subcommand;

use crate::config::{validate_egress_mode, Config};
use crate::egress;
use crate::errors::{Error, Result};
use crate::ssh;
use crate::truenas::Client;

use super::{cached_ip, connect, container_name, resolve_ip};

#[derive(Subcommand, Debug)]
pub enum NetworkCmd {
    /// Show current egress rules and allowed domains.
    Show { name: String },
    /// Set egress mode (unrestricted, agent, allowlist).
    Set { name: String, mode: String },
    /// Add a domain to the pixel's egress allowlist.
    Allow { name: String, domain: String },
    /// Remove a domain from the pixel's egress allowlist.
    Deny { name: String, domain: String },
}

pub async fn run(cfg: &Config, cmd: &NetworkCmd) -> Result<()> {
    match cmd {
        NetworkCmd::Show { name } => show(cfg, name).await,
        NetworkCmd::Set { name, mode } => set(cfg, name, mode).await,
        NetworkCmd::Allow { name, domain } => allow(cfg, name, domain).await,
        NetworkCmd::Deny { name, domain } => deny(cfg, name, domain).await,
    }
}

/// Resolved state shared by the network subcommands.
struct NetworkContext {
    ip: String,
    client: Client,
    cname: String,
}

async fn resolve_context(cfg: &Config, name: &str) -> Result<NetworkContext> {
    let cached = cached_ip(cfg, name);
    let client = connect(cfg).await?;

    let ip = match cached {
        Some(ip) => ip,
        None => {
            let instance = match client.get_instance(&container_name(name)).await {
                Ok(i) => i,
                Err(e) => {
                    client.close().await;
                    return Err(e);
                }
            };
            if instance.status != "RUNNING" {
                client.close().await;
                return Err(Error::StateConflict(format!(
                    "{name} is not running (status: {})",
                    instance.status
                )));
            }
            let ip = resolve_ip(&instance);
            if ip.is_empty() {
                client.close().await;
                return Err(Error::StateConflict(format!("{name} has no IP address")));
            }
            ip
        }
    };

    Ok(NetworkContext { ip, client, cname: container_name(name) })
}

fn root_cc(cfg: &Config, ip: &str) -> ssh::ConnConfig {
    ssh::ConnConfig {
        host: ip.to_string(),
        user: "root".into(),
        key_path: cfg.ssh.key.clone(),
        env: Default::default(),
    }
}

async fn run_resolve_script(cfg: &Config, ip: &str) -> Result<()> {
    let code = ssh::exec(&root_cc(cfg, ip), &[egress::RESOLVE_SCRIPT_PATH]).await?;
    if code != 0 {
        return Err(Error::StepFailed(format!("resolve script exited with {code}")));
    }
    Ok(())
}

async fn show(cfg: &Config, name: &str) -> Result<()> {
    let nc = resolve_context(cfg, name).await?;
    nc.client.close().await;

    eprintln!("Fetching egress rules for {name}...");
    let show_cmd = r#"if [ -f /etc/pixels-egress-domains ]; then
    echo "Mode: restricted"
    echo "Domains:"
    sed 's/^/  /' /etc/pixels-egress-domains
    count=$(nft list set inet pixels_egress allowed_v4 2>/dev/null | grep -c 'elements' || echo 0)
    echo "Resolved IPs: $count"
else
    echo "Mode: unrestricted (no egress policy configured)"
fi"#;
    ssh::exec(&root_cc(cfg, &nc.ip), &["bash", "-c", show_cmd]).await?;
    Ok(())
}

async fn set(cfg: &Config, name: &str, mode: &str) -> Result<()> {
    validate_egress_mode(mode)?;
    let nc = resolve_context(cfg, name).await?;
    let res = set_inner(cfg, name, mode, &nc).await;
    nc.client.close().await;
    res
}

async fn set_inner(cfg: &Config, name: &str, mode: &str, nc: &NetworkContext) -> Result<()> {
    let cc = root_cc(cfg, &nc.ip);

    if mode == "unrestricted" {
        // Tear down rules, remove every policy file, restore blanket sudo.
        let _ = ssh::exec_quiet(&cc, &["nft", "flush", "ruleset"]).await;
        let _ = ssh::exec_quiet(
            &cc,
            &[
                "rm",
                "-f",
                egress::DOMAINS_PATH,
                egress::CIDRS_PATH,
                egress::NFTABLES_PATH,
                egress::RESOLVE_SCRIPT_PATH,
                egress::SAFE_APT_PATH,
                egress::SUDOERS_STAGED_PATH,
            ],
        )
        .await;
        nc.client
            .write_file(
                &guest_path(&nc.client, &nc.cname, egress::SUDOERS_PATH).await?,
                egress::sudoers_unrestricted().as_bytes(),
                0o440,
                None,
            )
            .await?;
        println!("Egress set to unrestricted for {name}");
        return Ok(());
    }

    // Always rewrite the infrastructure files so mode switches pick up the
    // latest rule set.
    write_egress_infra(cfg, &nc.client, &nc.cname, &nc.ip).await?;

    let domains = egress::resolve_domains(mode, &cfg.network.allow).unwrap_or_default();
    write_guest_file(
        &nc.client,
        &nc.cname,
        egress::DOMAINS_PATH,
        egress::domains_file(&domains).as_bytes(),
        0o644,
    )
    .await?;

    let cidrs = egress::preset_cidrs(mode);
    if !cidrs.is_empty() {
        write_guest_file(
            &nc.client,
            &nc.cname,
            egress::CIDRS_PATH,
            egress::cidrs_file(cidrs).as_bytes(),
            0o644,
        )
        .await?;
    }

    run_resolve_script(cfg, &nc.ip).await?;

    write_guest_file(
        &nc.client,
        &nc.cname,
        egress::SAFE_APT_PATH,
        egress::safe_apt_script().as_bytes(),
        0o755,
    )
    .await?;
    write_guest_file(
        &nc.client,
        &nc.cname,
        egress::SUDOERS_PATH,
        egress::sudoers_restricted().as_bytes(),
        0o440,
    )
    .await?;

    println!("Egress set to {mode} for {name} ({} domains)", domains.len());
    Ok(())
}

async fn allow(cfg: &Config, name: &str, domain: &str) -> Result<()> {
    let nc = resolve_context(cfg, name).await?;
    let res = allow_inner(cfg, name, domain, &nc).await;
    nc.client.close().await;
    res
}

async fn allow_inner(cfg: &Config, name: &str, domain: &str, nc: &NetworkContext) -> Result<()> {
    ensure_egress_files(cfg, &nc.client, &nc.cname, &nc.ip).await?;

    let cc = root_cc(cfg, &nc.ip);
    let current = ssh::output(&cc, &["cat", egress::DOMAINS_PATH])
        .await
        .map_err(|e| e.context("reading domains file"))?;

    // Idempotent: allowing an already-allowed domain is a no-op success.
    let Some(updated) = append_domain(&current, domain) else {
        println!("{domain} already allowed for {name}");
        return Ok(());
    };

    write_guest_file(&nc.client, &nc.cname, egress::DOMAINS_PATH, updated.as_bytes(), 0o644).await?;
    run_resolve_script(cfg, &nc.ip).await?;

    println!("Allowed {domain} for {name}");
    Ok(())
}

async fn deny(cfg: &Config, name: &str, domain: &str) -> Result<()> {
    let nc = resolve_context(cfg, name).await?;
    let res = deny_inner(cfg, name, domain, &nc).await;
    nc.client.close().await;
    res
}

async fn deny_inner(cfg: &Config, name: &str, domain: &str, nc: &NetworkContext) -> Result<()> {
    let cc = root_cc(cfg, &nc.ip);
    let current = ssh::output(&cc, &["cat", egress::DOMAINS_PATH])
        .await
        .map_err(|_| Error::StateConflict(format!("no egress policy configured on {name}")))?;

    // Denying an absent domain is an error, unlike the allow direction.
    let Some(updated) = remove_domain(&current, domain) else {
        return Err(Error::NotFound(format!(
            "domain {domain} not found in egress allowlist for {name}"
        )));
    };

    write_guest_file(&nc.client, &nc.cname, egress::DOMAINS_PATH, updated.as_bytes(), 0o644).await?;
    run_resolve_script(cfg, &nc.ip).await?;

    println!("Denied {domain} for {name}");
    Ok(())
}

/// Appends a domain to the domains-file content, or returns None when it is
/// already present. Existing lines keep their order.
fn append_domain(current: &str, domain: &str) -> Option<String> {
    let trimmed = current.trim();
    if trimmed.lines().any(|l| l.trim() == domain) {
        return None;
    }
    let mut updated = trimmed.to_string();
    if !updated.is_empty() {
        updated.push('\n');
    }
    updated.push_str(domain);
    updated.push('\n');
    Some(updated)
}

/// Removes a domain from the domains-file content, or returns None when it
/// is absent.
fn remove_domain(current: &str, domain: &str) -> Option<String> {
    let mut kept = Vec::new();
    let mut found = false;
    for line in current.trim().lines() {
        if line.trim() == domain {
            found = true;
        } else {
            kept.push(line.to_string());
        }
    }
    if !found {
        return None;
    }
    Some(format!("{}\n", kept.join("\n")))
}

/// Host-side path of a file inside a container's rootfs.
async fn guest_path(client: &Client, cname: &str, path: &str) -> Result<String> {
    Ok(format!("{}{path}", client.container_rootfs(cname).await?))
}

async fn write_guest_file(
    client: &Client,
    cname: &str,
    path: &str,
    content: &[u8],
    mode: u32,
) -> Result<()> {
    client
        .write_file(&guest_path(client, cname, path).await?, content, mode, None)
        .await
}

/// Writes nftables.conf and the resolve script, then makes sure the guest
/// tooling they depend on is installed.
async fn write_egress_infra(cfg: &Config, client: &Client, cname: &str, ip: &str) -> Result<()> {
    write_guest_file(client, cname, egress::NFTABLES_PATH, egress::nftables_conf().as_bytes(), 0o644)
        .await?;
    write_guest_file(
        client,
        cname,
        egress::RESOLVE_SCRIPT_PATH,
        egress::resolve_script().as_bytes(),
        0o755,
    )
    .await?;

    // confold keeps our pre-written nftables.conf out of dpkg's conffile
    // prompts.
    let _ = ssh::exec_quiet(
        &root_cc(cfg, ip),
        &[
            "bash",
            "-c",
            r#"DEBIAN_FRONTEND=noninteractive apt-get install -y -qq -o Dpkg::Options::="--force-confold" nftables dnsutils"#,
        ],
    )
    .await;

    Ok(())
}

/// Lazily provisions the egress files so `network allow` works on pixels
/// created without an egress policy.
async fn ensure_egress_files(cfg: &Config, client: &Client, cname: &str, ip: &str) -> Result<()> {
    let cc = root_cc(cfg, ip);
    if let Ok(0) = ssh::exec_quiet(&cc, &["test", "-f", egress::RESOLVE_SCRIPT_PATH]).await {
        return Ok(());
    }
    write_egress_infra(cfg, client, cname, ip).await?;
    let _ = ssh::exec_quiet(&cc, &["touch", egress::DOMAINS_PATH]).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_appends_without_reordering() {
        let current = "api.anthropic.com\ngithub.com\n";
        let updated = append_domain(current, "x.example.com").unwrap();
        assert_eq!(updated, "api.anthropic.com\ngithub.com\nx.example.com\n");
    }

    #[test]
    fn allow_on_duplicate_is_noop() {
        assert!(append_domain("a.com\nb.com\n", "b.com").is_none());
    }

    #[test]
    fn allow_on_empty_file_starts_the_list() {
        assert_eq!(append_domain("", "a.com").unwrap(), "a.com\n");
        assert_eq!(append_domain("\n", "a.com").unwrap(), "a.com\n");
    }

    #[test]
    fn deny_removes_exactly_one_domain() {
        let updated = remove_domain("a.com\nx.example.com\nb.com\n", "x.example.com").unwrap();
        assert_eq!(updated, "a.com\nb.com\n");
    }

    #[test]
    fn deny_of_absent_domain_fails() {
        assert!(remove_domain("a.com\n", "missing.com").is_none());
    }

    #[test]
    fn allow_then_deny_round_trips() {
        let base = "api.anthropic.com\ngithub.com\n";
        let allowed = append_domain(base, "x.example.com").unwrap();
        let denied = remove_domain(&allowed, "x.example.com").unwrap();
        assert_eq!(denied, base);
    }
}
