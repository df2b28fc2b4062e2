//! `sessions`: list zmx sessions inside a pixel.

use std::time::Duration;

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::provision::parse_sessions;
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

    ssh::wait_ready(&ip, Duration::from_secs(30)).await?;

    let cc = ssh::ConnConfig {
        host: ip,
        user: cfg.ssh.user.clone(),
        key_path: cfg.ssh.key.clone(),
        env: Default::default(),
    };
    let out = ssh::output_quiet(&cc, &["unset XDG_RUNTIME_DIR && zmx list"])
        .await
        .map_err(|_| Error::NotFound(format!("zmx not available on {name}")))?;

    let sessions = parse_sessions(out.trim());
    if sessions.is_empty() {
        println!("No sessions");
        return Ok(());
    }

    let mut table = new_table(&["SESSION", "STATUS"]);
    for s in &sessions {
        table.add_row(vec![
            s.name.clone(),
            if s.is_done() { "exited".into() } else { "running".to_string() },
        ]);
    }
    println!("{table}");
    Ok(())
}
