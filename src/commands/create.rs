//! `create`: provision a fresh pixel, or clone one from a checkpoint.

use std::time::Duration;

use clap::Args;
use tracing::{debug, warn};

use crate::config::{validate_egress_mode, Config};
use crate::errors::{Error, Result};
use crate::truenas::types::{CreateInstanceOpts, NicOpts};
use crate::truenas::{Client, ProvisionOpts};
use crate::{provision, retry, ssh};

use super::{
    cache_put, connect, container_name, read_ssh_pub_key, resolve_dataset_path, resolve_ip, Phase,
};

#[derive(Args, Debug)]
pub struct CreateOpts {
    /// Pixel name.
    pub name: String,

    /// Container image (default from config).
    #[arg(long)]
    pub image: Option<String>,

    /// CPU cores (default from config).
    #[arg(long)]
    pub cpu: Option<String>,

    /// Memory in MiB (default from config).
    #[arg(long)]
    pub memory: Option<i64>,

    /// Skip all provisioning.
    #[arg(long)]
    pub no_provision: bool,

    /// Wait for provisioning and open a console.
    #[arg(long)]
    pub console: bool,

    /// Create from a checkpoint: `container` or `container:label`.
    #[arg(long)]
    pub from: Option<String>,

    /// Egress policy: unrestricted, agent, allowlist (default from config).
    #[arg(long)]
    pub egress: Option<String>,
}

pub async fn run(cfg: &Config, opts: &CreateOpts, verbose: bool) -> Result<()> {
    let image = opts.image.clone().unwrap_or_else(|| cfg.defaults.image.clone());
    let cpu = opts.cpu.clone().unwrap_or_else(|| cfg.defaults.cpu.clone());
    let memory = opts.memory.unwrap_or(cfg.defaults.memory);
    let egress_mode = opts.egress.clone().unwrap_or_else(|| cfg.network.egress.clone());
    validate_egress_mode(&egress_mode)?;

    debug!("config: image={image} cpu={cpu} memory={memory}MiB egress={egress_mode}");

    // Parse --from: "container" clones current state through a temporary
    // snapshot, "container:label" clones an existing checkpoint.
    let mut from_source = String::new();
    let mut from_label = String::new();
    let mut temp_snapshot = false;
    if let Some(from) = &opts.from {
        match from.split_once(':') {
            Some((source, label)) => {
                if source.is_empty() || label.is_empty() {
                    return Err(Error::Validation(
                        "--from must be container or container:label (e.g. --from base or --from base:ready)".into(),
                    ));
                }
                from_source = source.to_string();
                from_label = label.to_string();
            }
            None => {
                from_source = from.clone();
                temp_snapshot = true;
            }
        }
    }

    let phase = Phase::new(verbose);
    let client = connect(cfg).await?;
    let started = std::time::Instant::now();

    // Verify or create the clone source before creating anything, so a bad
    // --from fails without leaving a placeholder behind.
    let clone_source = from_source.clone();
    let snapshot_id = if !from_source.is_empty() {
        let src_ds = resolve_dataset_path(&client, cfg, &from_source).await?;
        if temp_snapshot {
            from_label = format!("px-clone-{}", chrono::Local::now().format("%Y%m%d-%H%M%S"));
            client.snapshot_create(&src_ds, &from_label).await?;
        }
        let id = format!("{src_ds}@{from_label}");
        if !temp_snapshot && client.snapshot_get(&id).await?.is_none() {
            return Err(Error::NotFound(format!(
                "checkpoint {from_label:?} not found for {from_source}"
            )));
        }
        Some(id)
    } else {
        None
    };

    let result = create_instance_flow(
        &client,
        cfg,
        opts,
        &image,
        &cpu,
        memory,
        &egress_mode,
        snapshot_id.as_deref(),
        &clone_source,
        &phase,
        verbose,
        started,
    )
    .await;

    // The temporary snapshot is released on every exit path; cleanup
    // failures are already best-effort.
    if temp_snapshot {
        if let Some(id) = &snapshot_id {
            let _ = client.snapshot_delete(id).await;
        }
    }
    client.close().await;
    phase.finish();
    result
}

#[allow(clippy::too_many_arguments)]
async fn create_instance_flow(
    client: &Client,
    cfg: &Config,
    opts: &CreateOpts,
    image: &str,
    cpu: &str,
    memory: i64,
    egress_mode: &str,
    snapshot_id: Option<&str>,
    clone_source: &str,
    phase: &Phase,
    verbose: bool,
    started: std::time::Instant,
) -> Result<()> {
    let name = &opts.name;
    let cname = container_name(name);
    let cloning = snapshot_id.is_some();

    let nic = if !cfg.defaults.nic_type.is_empty() {
        Some(NicOpts {
            nic_type: cfg.defaults.nic_type.to_uppercase(),
            parent: cfg.defaults.parent.clone(),
        })
    } else {
        match client.default_nic().await {
            Ok(nic) => {
                eprintln!("Auto-detected NIC: {} ({})", nic.parent, nic.nic_type);
                Some(nic)
            }
            Err(e) => {
                eprintln!("Warning: NIC auto-detect failed: {e}");
                None
            }
        }
    };

    phase.set_status(&format!("Creating {cname}..."));
    let mut instance = client
        .create_instance(&CreateInstanceOpts {
            name: cname.clone(),
            image: image.to_string(),
            cpu: cpu.to_string(),
            memory: memory * 1024 * 1024,
            autostart: true,
            nic,
        })
        .await?;
    debug!("container created (status={})", instance.status);

    if let Some(snapshot_id) = snapshot_id {
        // Clone path: swap the placeholder rootfs for a clone of the
        // checkpoint while the container is stopped.
        phase.set_status(&format!("Cloning from {clone_source}..."));
        client.stop_instance(&cname).await?;

        if let Err(e) = client.replace_container_rootfs(&cname, snapshot_id).await {
            let _ = client.delete_instance(&cname).await;
            return Err(e);
        }

        client.start_instance(&cname).await?;
        instance = poll_for_ip(client, &cname).await?;
    }

    let steps = provision::steps(egress_mode, cfg.provision.devtools_enabled());
    let provision_enabled = cfg.provision.is_enabled() && !opts.no_provision && !cloning;

    if provision_enabled {
        let pub_key = read_ssh_pub_key(cfg).unwrap_or_default();
        let image_env = cfg.image_env();
        let needs_provision = !pub_key.is_empty()
            || !cfg.defaults.dns.is_empty()
            || !image_env.is_empty()
            || cfg.provision.devtools_enabled();

        if needs_provision {
            phase.set_status("Provisioning...");
            debug!(
                "ssh key: {}, dns: {}, env: {}, devtools: {}, egress: {egress_mode}",
                !pub_key.is_empty(),
                cfg.defaults.dns.len(),
                image_env.len(),
                cfg.provision.devtools_enabled(),
            );

            let prov = ProvisionOpts {
                ssh_pub_key: pub_key.clone(),
                dns: cfg.defaults.dns.clone(),
                image_env,
                devtools: cfg.provision.devtools_enabled(),
                egress_mode: egress_mode.to_string(),
                egress_allow: cfg.network.allow.clone(),
                provision_script: (!steps.is_empty()).then(|| provision::script(&steps)),
            };

            match client.provision(&cname, &prov).await {
                Err(e) => eprintln!("Warning: provisioning failed: {e}"),
                Ok(()) if !pub_key.is_empty() => {
                    // Restart so the boot services pick up the injected
                    // rc.local and keys.
                    phase.set_status("Restarting...");
                    let _ = client.stop_instance(&cname).await;
                    if let Err(e) = client.start_instance(&cname).await {
                        eprintln!("Warning: restart after provision: {e}");
                    }
                    instance = poll_for_ip(client, &cname).await?;
                }
                Ok(()) => {}
            }
        }
    }

    let ip = resolve_ip(&instance);
    if !ip.is_empty() && (provision_enabled || cloning) {
        // Fresh images install openssh-server on first boot, clones already
        // have it.
        let timeout = if cloning { Duration::from_secs(30) } else { Duration::from_secs(90) };
        phase.set_status("Waiting for SSH...");
        if let Err(e) = ssh::wait_ready(&ip, timeout).await {
            eprintln!("Warning: SSH not ready: {e}");
        }
    }

    cache_put(cfg, name, &ip, &instance.status);
    debug!("cached ip={ip} status={} for {name}", instance.status);

    phase.finish();
    let elapsed = started.elapsed();
    println!("Created {cname} in {:.1}s", elapsed.as_secs_f64());
    println!("  Hostname: {cname}");
    if !ip.is_empty() {
        println!("  IP:       {ip}");
    }
    println!("  Console:  pixels console {name}");
    if !steps.is_empty() && !opts.console {
        println!("  Status:   pixels status {name}");
    }

    if opts.console && !ip.is_empty() {
        let runner = provision::Runner::new(&ip, "root", &cfg.ssh.key);
        // Interruption drops the user into the console early; it is not a
        // failure.
        let _ = super::console::wait_provisioned_interactive(&runner, phase, cfg, &ip, verbose).await;
        phase.finish();

        // Failed steps do not block the console, but the user should know.
        let names = provision::step_names(&steps);
        if !names.is_empty() {
            let (status, _) = runner.poll_status(&names).await;
            if status.contains("failed") {
                eprintln!("Warning: provisioning: {status}");
            }
        }

        let cc = ssh::ConnConfig {
            host: ip.clone(),
            user: cfg.ssh.user.clone(),
            key_path: cfg.ssh.key.clone(),
            env: cfg.forward_env(),
        };
        let remote_cmd = super::console::zmx_remote_cmd(&cc, "console").await;
        return ssh::console(&cc, remote_cmd.as_deref());
    }

    Ok(())
}

/// Polls the instance until DHCP hands it an address, up to 15 seconds.
/// Timing out is not an error; later SSH waits surface the problem.
async fn poll_for_ip(client: &Client, cname: &str) -> Result<crate::truenas::types::VirtInstance> {
    debug!("waiting for IP assignment...");
    let res = retry::poll(Duration::from_secs(1), Duration::from_secs(15), move || async move {
        Ok(!resolve_ip(&client.get_instance(cname).await?).is_empty())
    })
    .await;
    match res {
        Ok(()) | Err(Error::Timeout(_)) => {}
        Err(e) => {
            warn!("IP poll failed: {e}");
            return Err(e);
        }
    }
    client.get_instance(cname).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_flag_shapes() {
        // Shape validation mirrors what run() enforces before connecting.
        let parse = |from: &str| -> std::result::Result<(String, String, bool), ()> {
            match from.split_once(':') {
                Some((s, l)) if s.is_empty() || l.is_empty() => Err(()),
                Some((s, l)) => Ok((s.into(), l.into(), false)),
                None => Ok((from.into(), String::new(), true)),
            }
        };
        assert_eq!(parse("base").unwrap(), ("base".into(), String::new(), true));
        assert_eq!(parse("base:ready").unwrap(), ("base".into(), "ready".into(), false));
        assert!(parse(":ready").is_err());
        assert!(parse("base:").is_err());
    }
}
