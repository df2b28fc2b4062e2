//! `destroy`: permanently remove a pixel and its checkpoints.

use std::io::BufRead;
use std::time::Duration;

use clap::Args;

use crate::cache::Cache;
use crate::config::Config;
use crate::errors::Result;
use crate::retry;

use super::{connect, container_name};

#[derive(Args, Debug)]
pub struct DestroyOpts {
    /// Pixel name.
    pub name: String,

    /// Skip the confirmation prompt.
    #[arg(long)]
    pub force: bool,
}

pub async fn run(cfg: &Config, opts: &DestroyOpts) -> Result<()> {
    let name = &opts.name;

    if !opts.force {
        print!("Destroy pixel {name:?} and all its checkpoints? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().lock().read_line(&mut answer)?;
        let answer = answer.trim().to_lowercase();
        if answer != "y" && answer != "yes" {
            println!("Aborted.");
            return Ok(());
        }
    }

    let client = connect(cfg).await?;
    let cname = container_name(name);

    let instance = client.get_instance(&cname).await?;
    if instance.status == "RUNNING" {
        eprintln!("Stopping {name}...");
        client.stop_instance(&cname).await?;
    }

    // The storage volume is sometimes released a beat after stop; retry the
    // delete instead of failing on the race.
    let client_ref = &client;
    let cname_ref = cname.as_str();
    retry::do_with(3, Duration::from_secs(2), move || client_ref.delete_instance(cname_ref)).await?;
    client.close().await;

    Cache::open().delete(name);
    println!("Destroyed {name}");
    Ok(())
}
