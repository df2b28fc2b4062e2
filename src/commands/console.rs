//! `console`: open a persistent interactive session in a pixel.

use std::time::Duration;

use clap::Args;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::provision::Runner;
use crate::{provision, ssh};

use super::{cache_put, cached_ip, connect, container_name, ensure_ssh_auth, resolve_ip, Phase};

#[derive(Args, Debug)]
pub struct ConsoleOpts {
    /// Pixel name.
    pub name: String,

    /// zmx session name.
    #[arg(short, long, default_value = "console")]
    pub session: String,

    /// Skip zmx, use plain SSH.
    #[arg(long)]
    pub no_persist: bool,
}

pub async fn run(cfg: &Config, opts: &ConsoleOpts, verbose: bool) -> Result<()> {
    let name = &opts.name;

    if !opts.no_persist {
        let valid = regex::Regex::new(r"^[a-zA-Z0-9._-]+$").expect("static regex");
        if !valid.is_match(&opts.session) {
            return Err(Error::Validation(format!(
                "invalid session name {:?}: must match [a-zA-Z0-9._-]",
                opts.session
            )));
        }
    }

    let ip = match cached_ip(cfg, name) {
        Some(ip) => ip,
        None => {
            let client = connect(cfg).await?;
            let res = lookup_running_ip(&client, cfg, name, true).await;
            client.close().await;
            res?
        }
    };

    ssh::wait_ready(&ip, Duration::from_secs(30)).await?;
    ensure_ssh_auth(cfg, &ip, name).await?;

    // Never drop the user into a half-provisioned shell.
    let runner = Runner::new(&ip, "root", &cfg.ssh.key);
    let phase = Phase::new(verbose);
    if wait_provisioned_interactive(&runner, &phase, cfg, &ip, verbose).await.is_err() {
        eprintln!("Provisioning wait interrupted, opening console anyway");
    }
    phase.finish();

    let cc = ssh::ConnConfig {
        host: ip,
        user: cfg.ssh.user.clone(),
        key_path: cfg.ssh.key.clone(),
        env: cfg.forward_env(),
    };

    let remote_cmd = if opts.no_persist {
        None
    } else {
        zmx_remote_cmd(&cc, &opts.session).await
    };

    // Process replacement: does not return on success.
    ssh::console(&cc, remote_cmd.as_deref())
}

/// Looks up a pixel over RPC, optionally starting it when stopped, and
/// returns its IP. The cache is refreshed on the way out.
pub async fn lookup_running_ip(
    client: &crate::truenas::Client,
    cfg: &Config,
    name: &str,
    start_if_stopped: bool,
) -> Result<String> {
    let cname = container_name(name);
    let mut instance = client.get_instance(&cname).await?;

    if instance.status != "RUNNING" {
        if !start_if_stopped {
            return Err(Error::StateConflict(format!(
                "pixel {name:?} is {}, start it first",
                instance.status
            )));
        }
        eprintln!("Starting {name}...");
        client.start_instance(&cname).await?;
        instance = client.get_instance(&cname).await?;
    }

    let ip = resolve_ip(&instance);
    if ip.is_empty() {
        return Err(Error::StateConflict(format!("no IP address for {name}")));
    }
    cache_put(cfg, name, &ip, &instance.status);
    Ok(ip)
}

/// Waits for provisioning with a status spinner, racing Ctrl-C so the user
/// can bail into the console early. Returns `Cancelled` on interruption. In
/// verbose mode a concurrent task tails the guest journal; it is aborted
/// and joined before returning.
pub async fn wait_provisioned_interactive(
    runner: &Runner<provision::SshExecutor>,
    phase: &Phase,
    cfg: &Config,
    ip: &str,
    verbose: bool,
) -> Result<()> {
    let tail = if verbose {
        let cc = ssh::ConnConfig {
            host: ip.to_string(),
            user: "root".into(),
            key_path: cfg.ssh.key.clone(),
            env: Default::default(),
        };
        Some(tokio::spawn(async move {
            let _ = ssh::exec(&cc, &["journalctl", "-f", "--no-pager", "-u", "rc-local.service"]).await;
        }))
    } else {
        None
    };

    let res = tokio::select! {
        _ = runner.wait_provisioned(|status| phase.set_status(status)) => Ok(()),
        _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
    };

    if let Some(handle) = tail {
        handle.abort();
        let _ = handle.await;
    }
    res
}

/// Remote command that attaches to a persistent zmx session, or None when
/// zmx is not installed in the guest.
pub async fn zmx_remote_cmd(cc: &ssh::ConnConfig, session: &str) -> Option<String> {
    // Probe without env forwarding so SetEnv never pollutes the check.
    let probe = ssh::ConnConfig {
        host: cc.host.clone(),
        user: cc.user.clone(),
        key_path: cc.key_path.clone(),
        env: Default::default(),
    };
    match ssh::exec_quiet(&probe, &["command -v zmx >/dev/null 2>&1"]).await {
        Ok(0) => Some(format!("unset XDG_RUNTIME_DIR && zmx attach {session} bash -l")),
        _ => None,
    }
}
