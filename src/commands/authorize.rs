//! `authorize`: push this machine's SSH key into an existing pixel.

use crate::config::Config;
use crate::errors::{Error, Result};

use super::{connect, container_name, read_ssh_pub_key};

pub async fn run(cfg: &Config, name: &str) -> Result<()> {
    let pub_key = read_ssh_pub_key(cfg)?;
    if pub_key.is_empty() {
        return Err(Error::Config(
            "no SSH key configured: set ssh.key in config or PIXELS_SSH_KEY".into(),
        ));
    }

    let client = connect(cfg).await?;
    let cname = container_name(name);

    // The rootfs is only mounted (and thus writable) while running.
    let instance = client.get_instance(&cname).await?;
    if instance.status != "RUNNING" {
        client.close().await;
        return Err(Error::StateConflict(format!(
            "{name} is {}, must be running to authorize",
            instance.status
        )));
    }

    let res = client.write_authorized_key(&cname, &pub_key).await;
    client.close().await;
    res?;

    println!("Authorized SSH key on {name}");
    Ok(())
}
