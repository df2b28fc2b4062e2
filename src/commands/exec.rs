//! `exec`: run a command in a pixel and propagate its exit code.

use std::time::Duration;

use clap::Args;

use crate::config::Config;
use crate::errors::Result;
use crate::ssh;

use super::{cached_ip, connect, ensure_ssh_auth};

#[derive(Args, Debug)]
pub struct ExecOpts {
    /// Pixel name.
    pub name: String,

    /// Command to run remotely.
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Returns the remote exit code; main uses it as the process exit code.
pub async fn run(cfg: &Config, opts: &ExecOpts) -> Result<i32> {
    let name = &opts.name;

    let ip = match cached_ip(cfg, name) {
        Some(ip) => ip,
        None => {
            let client = connect(cfg).await?;
            let res = super::console::lookup_running_ip(&client, cfg, name, false).await;
            client.close().await;
            res?
        }
    };

    ssh::wait_ready(&ip, Duration::from_secs(30)).await?;
    ensure_ssh_auth(cfg, &ip, name).await?;

    let cc = ssh::ConnConfig {
        host: ip,
        user: cfg.ssh.user.clone(),
        key_path: cfg.ssh.key.clone(),
        env: cfg.forward_env(),
    };
    let command: Vec<&str> = opts.command.iter().map(String::as_str).collect();
    ssh::exec(&cc, &command).await
}
