//! `checkpoint`: ZFS-snapshot management for a pixel's root dataset.

use std::time::Duration;

use clap::{Args, Subcommand};

use crate::config::Config;
use crate::errors::Result;
use crate::ssh;

use super::{
    cache_put, connect, container_name, format_bytes, new_table, resolve_dataset_path, resolve_ip,
};

#[derive(Subcommand, Debug)]
pub enum CheckpointCmd {
    /// Create a checkpoint.
    Create(CreateOpts),
    /// List checkpoints for a pixel.
    List { name: String },
    /// Restore a pixel to a checkpoint.
    Restore { name: String, label: String },
    /// Delete a checkpoint.
    Delete { name: String, label: String },
}

#[derive(Args, Debug)]
pub struct CreateOpts {
    /// Pixel name.
    pub name: String,

    /// Checkpoint label (default: timestamp).
    #[arg(long)]
    pub label: Option<String>,
}

pub async fn run(cfg: &Config, cmd: &CheckpointCmd) -> Result<()> {
    match cmd {
        CheckpointCmd::Create(opts) => create(cfg, opts).await,
        CheckpointCmd::List { name } => list(cfg, name).await,
        CheckpointCmd::Restore { name, label } => restore(cfg, name, label).await,
        CheckpointCmd::Delete { name, label } => delete(cfg, name, label).await,
    }
}

async fn create(cfg: &Config, opts: &CreateOpts) -> Result<()> {
    let label = opts
        .label
        .clone()
        .unwrap_or_else(|| format!("px-{}", chrono::Local::now().format("%Y%m%d-%H%M%S")));

    let client = connect(cfg).await?;
    let ds = resolve_dataset_path(&client, cfg, &opts.name).await?;
    let res = client.snapshot_create(&ds, &label).await;
    client.close().await;
    res?;

    println!("Checkpoint {label:?} created for {}", opts.name);
    Ok(())
}

async fn list(cfg: &Config, name: &str) -> Result<()> {
    let client = connect(cfg).await?;
    let ds = resolve_dataset_path(&client, cfg, name).await?;
    let snapshots = client.snapshot_query(&ds).await;
    client.close().await;
    let snapshots = snapshots?;

    if snapshots.is_empty() {
        println!("No checkpoints for {name}.");
        return Ok(());
    }

    let mut table = new_table(&["LABEL", "SIZE"]);
    for s in &snapshots {
        table.add_row(vec![s.snapshot_name.clone(), format_bytes(s.referenced)]);
    }
    println!("{table}");
    Ok(())
}

async fn restore(cfg: &Config, name: &str, label: &str) -> Result<()> {
    let client = connect(cfg).await?;
    let cname = container_name(name);
    let ds = resolve_dataset_path(&client, cfg, name).await?;
    let snapshot_id = format!("{ds}@{label}");

    let started = std::time::Instant::now();

    eprintln!("Stopping {name}...");
    client.stop_instance(&cname).await?;
    client.snapshot_rollback(&snapshot_id).await?;
    client.start_instance(&cname).await?;

    let instance = client.get_instance(&cname).await?;
    client.close().await;

    let ip = resolve_ip(&instance);
    cache_put(cfg, name, &ip, &instance.status);
    if !ip.is_empty() {
        if let Err(e) = ssh::wait_ready(&ip, Duration::from_secs(30)).await {
            eprintln!("Warning: SSH not ready: {e}");
        }
    }

    println!("Restored {name} to {label:?} in {:.1}s", started.elapsed().as_secs_f64());
    if !ip.is_empty() {
        println!("  SSH: ssh {}@{ip}", cfg.ssh.user);
    }
    Ok(())
}

async fn delete(cfg: &Config, name: &str, label: &str) -> Result<()> {
    let client = connect(cfg).await?;
    let ds = resolve_dataset_path(&client, cfg, name).await?;
    let res = client.snapshot_delete(&format!("{ds}@{label}")).await;
    client.close().await;
    res?;

    println!("Deleted checkpoint {label:?} from {name}");
    Ok(())
}
