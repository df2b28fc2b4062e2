//! Typed facade over the TrueNAS middleware RPC surface: instance CRUD,
//! snapshots, filesystem writes into container rootfs, NIC discovery, and
//! the cron escape hatch for raw ZFS commands.

pub mod rpc;
pub mod types;

use std::collections::BTreeMap;
use std::net::Ipv4Addr;

use base64::Engine;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{Error, Result};
use crate::{egress, provision};
use rpc::{Transport, WsRpc};
use types::*;

/// Characters permitted in ZFS dataset and snapshot paths. Anything else is
/// rejected before a path is substituted into a shell command.
const ZFS_PATH_CHARS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789/._@-";

fn validate_zfs_path(path: &str) -> Result<()> {
    if path.is_empty() {
        return Err(Error::Validation("empty ZFS path".into()));
    }
    if let Some(bad) = path.chars().find(|c| !ZFS_PATH_CHARS.contains(*c)) {
        return Err(Error::Validation(format!(
            "unsafe character {bad:?} in ZFS path {path:?}"
        )));
    }
    Ok(())
}

/// Options for creating a container.
pub use types::{CreateInstanceOpts, NicOpts};

/// Everything written into a container's rootfs during provisioning.
#[derive(Debug, Clone, Default)]
pub struct ProvisionOpts {
    pub ssh_pub_key: String,
    /// Nameservers for the systemd-resolved drop-in.
    pub dns: Vec<String>,
    /// Image-time /etc/environment entries.
    pub image_env: BTreeMap<String, String>,
    pub devtools: bool,
    pub egress_mode: String,
    pub egress_allow: Vec<String>,
    /// Rendered second-stage script, when any steps are configured.
    pub provision_script: Option<String>,
}

pub struct Client {
    rpc: Box<dyn Transport>,
    version: Version,
}

impl Client {
    /// Opens and authenticates the WebSocket session, then captures the
    /// server version for method dispatch.
    pub async fn connect(cfg: &Config) -> Result<Client> {
        let rpc = WsRpc::connect(
            &cfg.truenas.host,
            cfg.truenas.port,
            &cfg.truenas.api_key,
            cfg.truenas.insecure_skip_verify(),
        )
        .await?;

        let raw = rpc.call("system.version_short", json!([])).await?;
        let version = Version::parse(raw.as_str().unwrap_or("")).unwrap_or_default();
        debug!(
            "connected to {} as {} (version {}.{})",
            cfg.truenas.host, cfg.truenas.username, version.major, version.minor
        );

        Ok(Client { rpc: Box::new(rpc), version })
    }

    pub async fn close(&self) {
        let _ = self.rpc.close().await;
    }

    pub fn version(&self) -> Version {
        self.version
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value> {
        self.rpc.call(method, params).await
    }

    /// Calls a method that may return a job handle; integer results are
    /// waited on via core.job_wait and the job's result is returned.
    async fn call_and_wait(&self, method: &str, params: Value) -> Result<Value> {
        let res = self.call(method, params).await?;
        if let Some(job_id) = res.as_i64() {
            return self
                .call("core.job_wait", json!([job_id]))
                .await
                .map_err(|e| e.context(method));
        }
        Ok(res)
    }

    // ---- instances ----

    pub async fn get_instance(&self, name: &str) -> Result<VirtInstance> {
        let res = self
            .call("virt.instance.query", json!([[["name", "=", name]]]))
            .await
            .map_err(|e| e.context(&format!("querying instance {name}")))?;
        let mut instances: Vec<VirtInstance> = serde_json::from_value(res)?;
        if instances.is_empty() {
            return Err(Error::NotFound(format!("instance {name}")));
        }
        Ok(instances.remove(0))
    }

    /// All instances whose storage name carries the pixel prefix.
    pub async fn list_instances(&self) -> Result<Vec<VirtInstance>> {
        let res = self
            .call("virt.instance.query", json!([[["name", "^", "px-"]]]))
            .await
            .map_err(|e| e.context("querying instances"))?;
        Ok(serde_json::from_value(res)?)
    }

    pub async fn create_instance(&self, opts: &CreateInstanceOpts) -> Result<VirtInstance> {
        let mut params = json!({
            "name": opts.name,
            "instance_type": "CONTAINER",
            "image": opts.image,
            "cpu": opts.cpu,
            "memory": opts.memory,
            "autostart": opts.autostart,
        });
        if let Some(nic) = &opts.nic {
            params["devices"] = json!([{
                "dev_type": "NIC",
                "nic_type": nic.nic_type,
                "parent": nic.parent,
            }]);
        }

        let res = self
            .call_and_wait("virt.instance.create", json!([params]))
            .await
            .map_err(|e| e.context(&format!("creating instance {}", opts.name)))?;
        Ok(serde_json::from_value(res)?)
    }

    pub async fn start_instance(&self, name: &str) -> Result<()> {
        self.call_and_wait("virt.instance.start", json!([name]))
            .await
            .map_err(|e| e.context(&format!("starting {name}")))?;
        Ok(())
    }

    /// Stops an instance, giving the guest 30 seconds to shut down cleanly.
    pub async fn stop_instance(&self, name: &str) -> Result<()> {
        self.call_and_wait("virt.instance.stop", json!([name, {"timeout": 30, "force": true}]))
            .await
            .map_err(|e| e.context(&format!("stopping {name}")))?;
        Ok(())
    }

    pub async fn delete_instance(&self, name: &str) -> Result<()> {
        self.call_and_wait("virt.instance.delete", json!([name]))
            .await
            .map_err(|e| e.context(&format!("deleting {name}")))?;
        Ok(())
    }

    async fn global_config(&self) -> Result<VirtGlobalConfig> {
        let res = self
            .call("virt.global.config", json!([]))
            .await
            .map_err(|e| e.context("querying virt global config"))?;
        Ok(serde_json::from_value(res)?)
    }

    /// ZFS dataset backing a container's storage.
    pub async fn container_dataset(&self, name: &str) -> Result<String> {
        let gcfg = self.global_config().await?;
        if gcfg.dataset.is_empty() {
            return Err(Error::RemoteApi("no dataset in virt global config".into()));
        }
        Ok(format!("{}/containers/{name}", gcfg.dataset))
    }

    // ---- snapshots ----

    fn snapshot_method(&self, op: &str) -> String {
        // The snapshot namespace moved in 25.10.
        if self.version.at_least(25, 10) {
            format!("pool.snapshot.{op}")
        } else {
            format!("zfs.snapshot.{op}")
        }
    }

    pub async fn snapshot_create(&self, dataset: &str, name: &str) -> Result<()> {
        self.call_and_wait(
            &self.snapshot_method("create"),
            json!([{"dataset": dataset, "name": name}]),
        )
        .await
        .map_err(|e| e.context(&format!("creating snapshot {dataset}@{name}")))?;
        Ok(())
    }

    pub async fn snapshot_get(&self, snapshot_id: &str) -> Result<Option<Snapshot>> {
        let res = self
            .call(&self.snapshot_method("query"), json!([[["id", "=", snapshot_id]]]))
            .await
            .map_err(|e| e.context(&format!("looking up snapshot {snapshot_id}")))?;
        let mut snapshots: Vec<Snapshot> = serde_json::from_value(res)?;
        if snapshots.is_empty() {
            return Ok(None);
        }
        Ok(Some(snapshots.remove(0)))
    }

    pub async fn snapshot_query(&self, dataset: &str) -> Result<Vec<Snapshot>> {
        let res = self
            .call(&self.snapshot_method("query"), json!([[["dataset", "=", dataset]]]))
            .await
            .map_err(|e| e.context(&format!("querying snapshots of {dataset}")))?;
        Ok(serde_json::from_value(res)?)
    }

    pub async fn snapshot_delete(&self, snapshot_id: &str) -> Result<()> {
        self.call_and_wait(&self.snapshot_method("delete"), json!([snapshot_id]))
            .await
            .map_err(|e| e.context(&format!("deleting snapshot {snapshot_id}")))?;
        Ok(())
    }

    pub async fn snapshot_rollback(&self, snapshot_id: &str) -> Result<()> {
        self.call(&self.snapshot_method("rollback"), json!([snapshot_id]))
            .await
            .map_err(|e| e.context(&format!("rolling back to {snapshot_id}")))?;
        Ok(())
    }

    // ---- network discovery ----

    /// Picks the NIC for new containers: the physical UP interface whose
    /// subnet contains the default IPv4 gateway, falling back to the first
    /// physical interface that is UP with an IPv4 address.
    pub async fn default_nic(&self) -> Result<NicOpts> {
        let res = self
            .call("interface.query", json!([]))
            .await
            .map_err(|e| e.context("listing interfaces"))?;
        let ifaces: Vec<NetworkInterface> = serde_json::from_value(res)?;

        struct Candidate {
            name: String,
            address: Ipv4Addr,
            netmask: u32,
        }
        let mut candidates = Vec::new();
        for iface in &ifaces {
            if iface.kind != "PHYSICAL" || iface.state.link_state != "LINK_STATE_UP" {
                continue;
            }
            if let Some(alias) = iface.aliases.iter().find(|a| a.kind == "INET") {
                if let Ok(address) = alias.address.parse() {
                    candidates.push(Candidate {
                        name: iface.name.clone(),
                        address,
                        netmask: alias.netmask,
                    });
                }
            }
        }

        if candidates.is_empty() {
            return Err(Error::NotFound("no physical interface with IPv4 found".into()));
        }

        if let Some(gateway) = self.default_gateway().await {
            for cand in &candidates {
                if subnet_contains(cand.address, cand.netmask, gateway) {
                    return Ok(NicOpts { nic_type: "MACVLAN".into(), parent: cand.name.clone() });
                }
            }
        }

        Ok(NicOpts { nic_type: "MACVLAN".into(), parent: candidates[0].name.clone() })
    }

    /// Default IPv4 gateway from the network summary, if any.
    async fn default_gateway(&self) -> Option<Ipv4Addr> {
        let res = self.call("network.general.summary", json!([])).await.ok()?;
        res.get("default_routes")?
            .as_array()?
            .iter()
            .filter_map(Value::as_str)
            .find_map(|route| route.parse().ok())
    }

    // ---- filesystem writes ----

    /// Writes a file on the appliance filesystem via file_receive, which
    /// auto-creates parent directories and works inside container rootfs
    /// paths that the dataset APIs refuse to touch.
    pub async fn write_file(
        &self,
        path: &str,
        content: &[u8],
        mode: u32,
        owner: Option<(u32, u32)>,
    ) -> Result<()> {
        let mut options = json!({"mode": mode, "append": false});
        if let Some((uid, gid)) = owner {
            options["uid"] = json!(uid);
            options["gid"] = json!(gid);
        }
        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        self.call("filesystem.file_receive", json!([path, encoded, options]))
            .await
            .map_err(|e| e.context(&format!("writing {path}")))?;
        Ok(())
    }

    /// Host path of a container's rootfs. Only valid while the container
    /// exists; the rootfs is mounted whenever the container runs.
    pub async fn container_rootfs(&self, name: &str) -> Result<String> {
        let gcfg = self.global_config().await?;
        if gcfg.pool.is_empty() {
            return Err(Error::RemoteApi("no pool in virt global config".into()));
        }
        Ok(format!(
            "/var/lib/incus/storage-pools/{}/containers/{name}/rootfs",
            gcfg.pool
        ))
    }

    /// Writes authorized_keys for root and the pixel user, with the modes
    /// and ownership sshd insists on.
    pub async fn write_authorized_key(&self, name: &str, pub_key: &str) -> Result<()> {
        let rootfs = self.container_rootfs(name).await?;
        let content = format!("{pub_key}\n");
        self.write_file(&format!("{rootfs}/root/.ssh/authorized_keys"), content.as_bytes(), 0o600, None)
            .await?;
        self.write_file(
            &format!("{rootfs}/home/pixel/.ssh/authorized_keys"),
            content.as_bytes(),
            0o600,
            Some((1000, 1000)),
        )
        .await?;
        Ok(())
    }

    /// Stages all provisioning files into a running container's rootfs.
    /// Writes happen in dependency order and the first failure aborts the
    /// rest; rc.local goes last so a partially staged rootfs never boots
    /// into the bootstrap.
    pub async fn provision(&self, name: &str, opts: &ProvisionOpts) -> Result<()> {
        let rootfs = self.container_rootfs(name).await?;
        let restricted = egress::is_restricted(&opts.egress_mode);

        if !opts.dns.is_empty() {
            let conf = format!("[Resolve]\nDNS={}\n", opts.dns.join(" "));
            self.write_file(
                &format!("{rootfs}/etc/systemd/resolved.conf.d/pixels-dns.conf"),
                conf.as_bytes(),
                0o644,
                None,
            )
            .await?;
        }

        if !opts.image_env.is_empty() {
            let mut env = String::new();
            for (k, v) in &opts.image_env {
                env.push_str(&format!("{k}=\"{v}\"\n"));
            }
            self.write_file(&format!("{rootfs}/etc/environment"), env.as_bytes(), 0o644, None)
                .await?;
        }

        if !opts.ssh_pub_key.is_empty() {
            let content = format!("{}\n", opts.ssh_pub_key);
            self.write_file(&format!("{rootfs}/root/.ssh/authorized_keys"), content.as_bytes(), 0o600, None)
                .await?;
            self.write_file(
                &format!("{rootfs}/home/pixel/.ssh/authorized_keys"),
                content.as_bytes(),
                0o600,
                Some((1000, 1000)),
            )
            .await?;
        }

        if opts.devtools {
            self.write_file(
                &format!("{rootfs}{}", provision::DEVTOOLS_SCRIPT_PATH),
                provision::devtools_script().as_bytes(),
                0o755,
                None,
            )
            .await?;
            self.write_file(
                &format!("{rootfs}{}", provision::DEVTOOLS_UNIT_PATH),
                provision::devtools_unit().as_bytes(),
                0o644,
                None,
            )
            .await?;
        }

        if restricted {
            let domains = egress::resolve_domains(&opts.egress_mode, &opts.egress_allow)
                .unwrap_or_default();
            self.write_file(
                &format!("{rootfs}{}", egress::DOMAINS_PATH),
                egress::domains_file(&domains).as_bytes(),
                0o644,
                None,
            )
            .await?;

            let cidrs = egress::preset_cidrs(&opts.egress_mode);
            if !cidrs.is_empty() {
                self.write_file(
                    &format!("{rootfs}{}", egress::CIDRS_PATH),
                    egress::cidrs_file(cidrs).as_bytes(),
                    0o644,
                    None,
                )
                .await?;
            }

            self.write_file(
                &format!("{rootfs}{}", egress::NFTABLES_PATH),
                egress::nftables_conf().as_bytes(),
                0o644,
                None,
            )
            .await?;
            self.write_file(
                &format!("{rootfs}{}", egress::RESOLVE_SCRIPT_PATH),
                egress::resolve_script().as_bytes(),
                0o755,
                None,
            )
            .await?;
            self.write_file(
                &format!("{rootfs}{}", egress::SAFE_APT_PATH),
                egress::safe_apt_script().as_bytes(),
                0o755,
                None,
            )
            .await?;
            self.write_file(
                &format!("{rootfs}{}", egress::SUDOERS_STAGED_PATH),
                egress::sudoers_restricted().as_bytes(),
                0o440,
                None,
            )
            .await?;
            self.write_file(
                &format!("{rootfs}{}", egress::SETUP_SCRIPT_PATH),
                egress::setup_egress_script().as_bytes(),
                0o755,
                None,
            )
            .await?;
            self.write_file(
                &format!("{rootfs}{}", egress::ENABLE_SCRIPT_PATH),
                egress::enable_egress_script().as_bytes(),
                0o755,
                None,
            )
            .await?;
        }

        if let Some(script) = &opts.provision_script {
            self.write_file(
                &format!("{rootfs}{}", provision::PROVISION_SCRIPT_PATH),
                script.as_bytes(),
                0o755,
                None,
            )
            .await?;
        }

        let rc = provision::rc_local(provision::RcLocalOpts {
            has_ssh_key: !opts.ssh_pub_key.is_empty(),
            has_provision_script: opts.provision_script.is_some(),
            egress_restricted: restricted,
            devtools: opts.devtools,
        });
        self.write_file(&format!("{rootfs}/etc/rc.local"), rc.as_bytes(), 0o755, None)
            .await?;

        Ok(())
    }

    // ---- raw ZFS via the cron escape hatch ----

    /// Runs a privileged shell command on the appliance host by creating a
    /// disabled cron job, running it once, and deleting it. This is the only
    /// way to reach datasets the virtualization layer manages.
    async fn run_host_command(&self, description: &str, command: &str) -> Result<()> {
        let job = self
            .call(
                "cron.create",
                json!([{
                    "description": description,
                    "user": "root",
                    "command": command,
                    "enabled": false,
                    "schedule": {"minute": "0", "hour": "0", "dom": "1", "month": "1", "dow": "1"},
                }]),
            )
            .await
            .map_err(|e| e.context("creating temporary job"))?;
        let job_id = job
            .get("id")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::RemoteApi("cron.create returned no id".into()))?;

        let run = self
            .call_and_wait("cron.run", json!([job_id, true]))
            .await
            .map_err(|e| e.context("running temporary job"));

        // The job is deleted on every exit path; a failed delete is logged
        // but never masks the run result.
        if let Err(e) = self.call("cron.delete", json!([job_id])).await {
            warn!("failed to delete temporary job {job_id}: {e}");
        }

        run.map(|_| ())
    }

    /// Replaces a container's root dataset with a clone of the given
    /// snapshot and patches the guest hostname. The container must be
    /// stopped. Every substituted path is validated against the ZFS
    /// character set before the command is composed.
    pub async fn replace_container_rootfs(&self, name: &str, snapshot_id: &str) -> Result<()> {
        let target = self.container_dataset(name).await?;
        validate_zfs_path(&target)?;
        validate_zfs_path(snapshot_id)?;
        validate_zfs_path(name)?;

        let command = format!(
            "zfs destroy -r {target} && zfs clone {snapshot_id} {target} && \
             m=$(mktemp -d) && mount -t zfs {target} \"$m\" && \
             printf '%s\\n' {name} > \"$m/rootfs/etc/hostname\" && \
             umount \"$m\" && rmdir \"$m\""
        );

        self.run_host_command(&format!("pixels clone {name}"), &command)
            .await
    }
}

fn subnet_contains(address: Ipv4Addr, prefix: u32, ip: Ipv4Addr) -> bool {
    let mask = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - prefix.min(32))
    };
    (u32::from(address) & mask) == (u32::from(ip) & mask)
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::future::BoxFuture;
    use std::sync::{Arc, Mutex};

    type CallLog = Arc<Mutex<Vec<(String, Value)>>>;
    type Responder = Box<dyn Fn(&str, &Value) -> Result<Value> + Send + Sync>;

    struct MockTransport {
        log: CallLog,
        respond: Responder,
    }

    impl Transport for MockTransport {
        fn call<'a>(&'a self, method: &'a str, params: Value) -> BoxFuture<'a, Result<Value>> {
            self.log.lock().unwrap().push((method.to_string(), params.clone()));
            let res = (self.respond)(method, &params);
            Box::pin(async move { res })
        }

        fn close(&self) -> BoxFuture<'_, Result<()>> {
            Box::pin(async { Ok(()) })
        }
    }

    fn client_with(
        version: Version,
        respond: impl Fn(&str, &Value) -> Result<Value> + Send + Sync + 'static,
    ) -> (Client, CallLog) {
        let log: CallLog = Arc::new(Mutex::new(Vec::new()));
        let client = Client {
            rpc: Box::new(MockTransport { log: log.clone(), respond: Box::new(respond) }),
            version,
        };
        (client, log)
    }

    fn methods(log: &CallLog) -> Vec<String> {
        log.lock().unwrap().iter().map(|(m, _)| m.clone()).collect()
    }

    fn physical_up(name: &str, addr: &str, netmask: u32) -> Value {
        json!({
            "name": name,
            "type": "PHYSICAL",
            "state": {"link_state": "LINK_STATE_UP"},
            "aliases": [{"type": "INET", "address": addr, "netmask": netmask}],
        })
    }

    #[tokio::test]
    async fn default_nic_prefers_gateway_subnet() {
        let (client, _) = client_with(Version::default(), |method, _| match method {
            "interface.query" => Ok(json!([
                physical_up("eno1", "192.168.1.100", 24),
                physical_up("eno2", "10.0.0.50", 24),
            ])),
            "network.general.summary" => Ok(json!({"default_routes": ["10.0.0.1"]})),
            m => panic!("unexpected call {m}"),
        });
        let nic = client.default_nic().await.unwrap();
        assert_eq!(nic, NicOpts { nic_type: "MACVLAN".into(), parent: "eno2".into() });
    }

    #[tokio::test]
    async fn default_nic_falls_back_without_gateway() {
        let (client, _) = client_with(Version::default(), |method, _| match method {
            "interface.query" => Ok(json!([physical_up("eno1", "192.168.1.100", 24)])),
            "network.general.summary" => Err(Error::RemoteApi("api error".into())),
            m => panic!("unexpected call {m}"),
        });
        assert_eq!(client.default_nic().await.unwrap().parent, "eno1");
    }

    #[tokio::test]
    async fn default_nic_gateway_outside_subnets_falls_back_to_first() {
        let (client, _) = client_with(Version::default(), |method, _| match method {
            "interface.query" => Ok(json!([
                physical_up("eno1", "192.168.1.100", 24),
                physical_up("eno2", "10.0.0.50", 24),
            ])),
            "network.general.summary" => Ok(json!({"default_routes": ["172.16.0.1"]})),
            m => panic!("unexpected call {m}"),
        });
        assert_eq!(client.default_nic().await.unwrap().parent, "eno1");
    }

    #[tokio::test]
    async fn default_nic_ignores_ipv6_gateway() {
        let (client, _) = client_with(Version::default(), |method, _| match method {
            "interface.query" => Ok(json!([physical_up("eno1", "192.168.1.100", 24)])),
            "network.general.summary" => Ok(json!({"default_routes": ["fe80::1"]})),
            m => panic!("unexpected call {m}"),
        });
        assert_eq!(client.default_nic().await.unwrap().parent, "eno1");
    }

    #[tokio::test]
    async fn default_nic_rejects_unusable_interfaces() {
        // Bridges, down links, and v6-only interfaces are never candidates.
        let (client, _) = client_with(Version::default(), |method, _| match method {
            "interface.query" => Ok(json!([
                {
                    "name": "br0", "type": "BRIDGE",
                    "state": {"link_state": "LINK_STATE_UP"},
                    "aliases": [{"type": "INET", "address": "10.0.0.1", "netmask": 24}],
                },
                {
                    "name": "eno1", "type": "PHYSICAL",
                    "state": {"link_state": "LINK_STATE_DOWN"},
                    "aliases": [{"type": "INET", "address": "10.0.1.1", "netmask": 24}],
                },
                {
                    "name": "eno2", "type": "PHYSICAL",
                    "state": {"link_state": "LINK_STATE_UP"},
                    "aliases": [{"type": "INET6", "address": "fe80::1", "netmask": 64}],
                },
            ])),
            _ => Ok(json!({"default_routes": []})),
        });
        assert!(matches!(client.default_nic().await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn default_nic_propagates_interface_list_error() {
        let (client, _) = client_with(Version::default(), |_, _| {
            Err(Error::Transport("connection refused".into()))
        });
        assert!(matches!(client.default_nic().await, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn container_dataset_from_global_config() {
        let (client, _) = client_with(Version::default(), |method, _| match method {
            "virt.global.config" => Ok(json!({
                "pool": "tank", "dataset": "tank/ix-virt", "storage_pools": ["tank"],
            })),
            m => panic!("unexpected call {m}"),
        });
        assert_eq!(
            client.container_dataset("px-test").await.unwrap(),
            "tank/ix-virt/containers/px-test"
        );
    }

    #[tokio::test]
    async fn container_dataset_requires_dataset() {
        let (client, _) = client_with(Version::default(), |_, _| {
            Ok(json!({"pool": "tank", "dataset": ""}))
        });
        assert!(client.container_dataset("px-test").await.is_err());
    }

    #[tokio::test]
    async fn snapshot_methods_dispatch_on_version() {
        for (version, want) in [
            (Version { major: 25, minor: 4 }, "zfs.snapshot.query"),
            (Version { major: 25, minor: 10 }, "pool.snapshot.query"),
        ] {
            let (client, log) = client_with(version, |_, _| Ok(json!([])));
            client.snapshot_query("tank/containers/px-test").await.unwrap();
            assert_eq!(methods(&log), vec![want.to_string()]);
        }
    }

    #[tokio::test]
    async fn snapshot_get_empty_is_none() {
        let (client, _) = client_with(Version::default(), |_, _| Ok(json!([])));
        assert!(client.snapshot_get("tank/x@ready").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_instance_empty_is_not_found() {
        let (client, _) = client_with(Version::default(), |_, _| Ok(json!([])));
        assert!(matches!(client.get_instance("px-gone").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn create_instance_attaches_nic_device() {
        let (client, log) = client_with(Version::default(), |_, _| {
            Ok(json!({"name": "px-a", "status": "RUNNING"}))
        });
        client
            .create_instance(&CreateInstanceOpts {
                name: "px-a".into(),
                image: "ubuntu/24.04".into(),
                cpu: "2".into(),
                memory: 2048 * 1024 * 1024,
                autostart: true,
                nic: Some(NicOpts { nic_type: "MACVLAN".into(), parent: "eno1".into() }),
            })
            .await
            .unwrap();

        let calls = log.lock().unwrap();
        let (method, params) = &calls[0];
        assert_eq!(method, "virt.instance.create");
        let devices = &params[0]["devices"];
        assert_eq!(devices[0]["dev_type"], "NIC");
        assert_eq!(devices[0]["parent"], "eno1");
    }

    #[tokio::test]
    async fn call_and_wait_follows_job_handles() {
        let (client, log) = client_with(Version::default(), |method, _| match method {
            "virt.instance.start" => Ok(json!(42)),
            "core.job_wait" => Ok(json!(null)),
            m => panic!("unexpected call {m}"),
        });
        client.start_instance("px-a").await.unwrap();
        assert_eq!(methods(&log), vec!["virt.instance.start", "core.job_wait"]);
    }

    #[tokio::test]
    async fn write_file_encodes_content() {
        let (client, log) = client_with(Version::default(), |_, _| Ok(json!(null)));
        client.write_file("/tmp/x", b"hello", 0o600, Some((1000, 1000))).await.unwrap();

        let calls = log.lock().unwrap();
        let (method, params) = &calls[0];
        assert_eq!(method, "filesystem.file_receive");
        assert_eq!(params[0], "/tmp/x");
        assert_eq!(params[1], base64::engine::general_purpose::STANDARD.encode(b"hello"));
        assert_eq!(params[2]["mode"], 0o600);
        assert_eq!(params[2]["uid"], 1000);
        assert_eq!(params[2]["gid"], 1000);
    }

    #[tokio::test]
    async fn replace_rootfs_rejects_shell_metacharacters() {
        for probe in ["tank/x@a; rm -rf /", "tank/x@$(reboot)", "tank/x@`id`", "tank/x@a b", "tank/x@a\nb"] {
            let (client, log) = client_with(Version::default(), |_, _| {
                Ok(json!({"pool": "tank", "dataset": "tank/ix-virt"}))
            });
            let err = client.replace_container_rootfs("px-a", probe).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "probe {probe:?} not rejected");
            // Validation happens before any job is created.
            assert!(!methods(&log).iter().any(|m| m.starts_with("cron.")));
        }
    }

    #[tokio::test]
    async fn replace_rootfs_runs_and_deletes_temp_job() {
        let (client, log) = client_with(Version::default(), |method, _| match method {
            "virt.global.config" => Ok(json!({"pool": "tank", "dataset": "tank/ix-virt"})),
            "cron.create" => Ok(json!({"id": 7})),
            "cron.run" => Ok(json!(null)),
            "cron.delete" => Ok(json!(true)),
            m => panic!("unexpected call {m}"),
        });
        client.replace_container_rootfs("px-a", "tank/ix-virt/containers/px-base@ready").await.unwrap();

        let calls = log.lock().unwrap();
        let seq: Vec<&str> = calls.iter().map(|(m, _)| m.as_str()).collect();
        assert_eq!(seq, ["virt.global.config", "cron.create", "cron.run", "cron.delete"]);

        let command = calls[1].1[0]["command"].as_str().unwrap();
        assert!(command.contains("zfs destroy -r tank/ix-virt/containers/px-a"));
        assert!(command.contains("zfs clone tank/ix-virt/containers/px-base@ready"));
        assert!(command.contains("etc/hostname"));
    }

    #[tokio::test]
    async fn replace_rootfs_deletes_job_when_run_fails() {
        let (client, log) = client_with(Version::default(), |method, _| match method {
            "virt.global.config" => Ok(json!({"pool": "tank", "dataset": "tank/ix-virt"})),
            "cron.create" => Ok(json!({"id": 7})),
            "cron.run" => Err(Error::RemoteApi("zfs busy".into())),
            "cron.delete" => Ok(json!(true)),
            m => panic!("unexpected call {m}"),
        });
        let err = client
            .replace_container_rootfs("px-a", "tank/ix-virt/containers/px-base@ready")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteApi(_)));
        assert!(methods(&log).contains(&"cron.delete".to_string()));
    }

    #[tokio::test]
    async fn provision_stages_expected_files_with_rc_local_last() {
        let (client, log) = client_with(Version::default(), |method, _| match method {
            "virt.global.config" => Ok(json!({"pool": "tank", "dataset": "tank/ix-virt"})),
            "filesystem.file_receive" => Ok(json!(null)),
            m => panic!("unexpected call {m}"),
        });

        let mut image_env = BTreeMap::new();
        image_env.insert("EDITOR".to_string(), "vim".to_string());
        client
            .provision(
                "px-mybox",
                &ProvisionOpts {
                    ssh_pub_key: "ssh-ed25519 AAAA user@host".into(),
                    dns: vec!["1.1.1.1".into()],
                    image_env,
                    devtools: true,
                    egress_mode: "agent".into(),
                    egress_allow: vec![],
                    provision_script: Some(provision::script(&provision::steps("agent", true))),
                },
            )
            .await
            .unwrap();

        let calls = log.lock().unwrap();
        let writes: Vec<(String, Value)> = calls
            .iter()
            .filter(|(m, _)| m == "filesystem.file_receive")
            .map(|(_, p)| (p[0].as_str().unwrap().to_string(), p[2].clone()))
            .collect();
        let paths: Vec<&str> = writes.iter().map(|(p, _)| p.as_str()).collect();

        let rootfs = "/var/lib/incus/storage-pools/tank/containers/px-mybox/rootfs";
        for want in [
            format!("{rootfs}/etc/systemd/resolved.conf.d/pixels-dns.conf"),
            format!("{rootfs}/etc/environment"),
            format!("{rootfs}/root/.ssh/authorized_keys"),
            format!("{rootfs}/home/pixel/.ssh/authorized_keys"),
            format!("{rootfs}/usr/local/bin/pixels-setup-devtools.sh"),
            format!("{rootfs}/etc/pixels-egress-domains"),
            format!("{rootfs}/etc/pixels-egress-cidrs"),
            format!("{rootfs}/etc/nftables.conf"),
            format!("{rootfs}/usr/local/bin/pixels-resolve-egress.sh"),
            format!("{rootfs}/usr/local/bin/safe-apt"),
            format!("{rootfs}/usr/local/share/pixels/sudoers.restricted"),
            format!("{rootfs}/usr/local/bin/pixels-provision.sh"),
            format!("{rootfs}/etc/rc.local"),
        ] {
            assert!(paths.contains(&want.as_str()), "missing write of {want}");
        }

        // rc.local must be the very last write.
        assert_eq!(paths.last().unwrap(), &format!("{rootfs}/etc/rc.local"));

        // Mode and ownership spot checks.
        let find = |suffix: &str| {
            writes
                .iter()
                .find(|(p, _)| p.ends_with(suffix))
                .map(|(_, opts)| opts.clone())
                .unwrap()
        };
        assert_eq!(find("/root/.ssh/authorized_keys")["mode"], 0o600);
        let pixel_keys = find("/home/pixel/.ssh/authorized_keys");
        assert_eq!(pixel_keys["uid"], 1000);
        assert_eq!(pixel_keys["gid"], 1000);
        assert_eq!(find("pixels-resolve-egress.sh")["mode"], 0o755);
        assert_eq!(find("sudoers.restricted")["mode"], 0o440);
        assert_eq!(find("/etc/rc.local")["mode"], 0o755);

        // The staged domains file carries the agent preset.
        let domains = calls
            .iter()
            .filter(|(m, _)| m == "filesystem.file_receive")
            .find(|(_, p)| p[0].as_str().unwrap().ends_with("pixels-egress-domains"))
            .map(|(_, p)| p[1].as_str().unwrap().to_string())
            .unwrap();
        let decoded = base64::engine::general_purpose::STANDARD.decode(domains).unwrap();
        assert!(String::from_utf8(decoded).unwrap().contains("api.anthropic.com"));
    }

    #[tokio::test]
    async fn provision_write_failure_aborts_remaining_writes() {
        let (client, log) = client_with(Version::default(), |method, params| match method {
            "virt.global.config" => Ok(json!({"pool": "tank", "dataset": "tank/ix-virt"})),
            "filesystem.file_receive" => {
                if params[0].as_str().unwrap().ends_with("/root/.ssh/authorized_keys") {
                    Err(Error::RemoteApi("disk full".into()))
                } else {
                    Ok(json!(null))
                }
            }
            m => panic!("unexpected call {m}"),
        });

        let err = client
            .provision(
                "px-a",
                &ProvisionOpts {
                    ssh_pub_key: "ssh-ed25519 AAAA".into(),
                    egress_mode: "unrestricted".into(),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::RemoteApi(_)));

        // Nothing after the failing write, in particular no rc.local.
        let calls = log.lock().unwrap();
        assert!(!calls.iter().any(|(_, p)| {
            p.get(0).and_then(Value::as_str).is_some_and(|s| s.ends_with("/etc/rc.local"))
        }));
    }

    #[test]
    fn subnet_membership() {
        let addr: Ipv4Addr = "192.168.1.100".parse().unwrap();
        assert!(subnet_contains(addr, 24, "192.168.1.1".parse().unwrap()));
        assert!(!subnet_contains(addr, 24, "192.168.2.1".parse().unwrap()));
        assert!(subnet_contains(addr, 0, "10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn zfs_path_validation() {
        for ok in ["tank/ix-virt/containers/px-a", "tank/a@px-20240101-000000", "a/b_c.d-e@f"] {
            assert!(validate_zfs_path(ok).is_ok(), "{ok} should be accepted");
        }
        for bad in ["", "tank;reboot", "tank a", "tank$x", "tank`id`", "tank\n"] {
            assert!(validate_zfs_path(bad).is_err(), "{bad:?} should be rejected");
        }
    }
}
