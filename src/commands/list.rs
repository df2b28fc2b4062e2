//! `list`: all pixels with status and address.

use crate::config::Config;
use crate::errors::Result;

use super::{connect, display_name, new_table, resolve_ip};

pub async fn run(cfg: &Config) -> Result<()> {
    let client = connect(cfg).await?;
    let instances = client.list_instances().await?;
    client.close().await;

    if instances.is_empty() {
        println!("No pixels found.");
        return Ok(());
    }

    let mut table = new_table(&["NAME", "STATUS", "IP"]);
    for inst in &instances {
        let ip = resolve_ip(inst);
        table.add_row(vec![
            display_name(&inst.name).to_string(),
            inst.status.clone(),
            if ip.is_empty() { "-".into() } else { ip },
        ]);
    }
    println!("{table}");
    Ok(())
}
