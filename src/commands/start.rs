//! `start`: boot a stopped pixel and wait for SSH.

use std::time::Duration;

use crate::config::Config;
use crate::errors::Result;
use crate::ssh;

use super::{cache_put, connect, container_name, resolve_ip};

pub async fn run(cfg: &Config, name: &str) -> Result<()> {
    let client = connect(cfg).await?;
    let cname = container_name(name);

    client.start_instance(&cname).await?;

    // Re-fetch for the freshly assigned IP.
    let instance = client.get_instance(&cname).await?;
    client.close().await;

    let ip = resolve_ip(&instance);
    cache_put(cfg, name, &ip, &instance.status);

    if ip.is_empty() {
        println!("Started {name} (no IP assigned)");
        return Ok(());
    }

    if let Err(e) = ssh::wait_ready(&ip, Duration::from_secs(30)).await {
        eprintln!("Warning: SSH not ready: {e}");
    }
    println!("Started {name}");
    println!("  IP:  {ip}");
    println!("  SSH: ssh {}@{ip}", cfg.ssh.user);
    Ok(())
}
