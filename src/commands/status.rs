//! `status`: provisioning step progress for a pixel.

use std::time::Duration;

use crate::config::Config;
use crate::errors::Result;
use crate::provision::{parse_sessions, Runner};
use crate::ssh;

use super::{cached_ip, connect, new_table};

pub async fn run(cfg: &Config, name: &str) -> Result<()> {
    let ip = match cached_ip(cfg, name) {
        Some(ip) => ip,
        None => {
            let client = connect(cfg).await?;
            let res = super::console::lookup_running_ip(&client, cfg, name, false).await;
            client.close().await;
            res?
        }
    };

    ssh::wait_ready(&ip, Duration::from_secs(10)).await?;

    let runner = Runner::new(&ip, "root", &cfg.ssh.key);
    let raw = match runner.list().await {
        Ok(raw) => raw,
        Err(_) => {
            println!("No provisioning steps found (zmx not installed)");
            return Ok(());
        }
    };

    let steps: Vec<_> = parse_sessions(&raw)
        .into_iter()
        .filter(|s| s.name.starts_with("px-"))
        .collect();

    if steps.is_empty() {
        if runner.is_provisioned().await {
            println!("Provisioning complete");
        } else if runner.has_provision_script().await {
            println!("Provisioning in progress...");
        } else {
            println!("No provisioning steps found");
        }
        return Ok(());
    }

    let mut table = new_table(&["STEP", "STATUS", "EXIT"]);
    for s in &steps {
        let (status, exit) = if !s.is_done() {
            ("running", "-".to_string())
        } else if s.exit_code != "0" {
            ("failed", s.exit_code.clone())
        } else {
            ("done", s.exit_code.clone())
        };
        table.add_row(vec![s.name.clone(), status.to_string(), exit]);
    }
    println!("{table}");

    // Surface the scrollback of anything that failed.
    for s in steps.iter().filter(|s| s.is_done() && s.exit_code != "0") {
        if let Ok(scrollback) = runner.history(&s.name).await {
            eprintln!("--- {} output ---", s.name);
            eprint!("{scrollback}");
        }
    }
    Ok(())
}
