//! `stop`: shut a pixel down and drop its cached address.

use crate::cache::Cache;
use crate::config::Config;
use crate::errors::Result;

use super::{connect, container_name};

pub async fn run(cfg: &Config, name: &str) -> Result<()> {
    let client = connect(cfg).await?;
    client.stop_instance(&container_name(name)).await?;
    client.close().await;

    Cache::open().delete(name);
    println!("Stopped {name}");
    Ok(())
}
