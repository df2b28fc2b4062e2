//! Container provisioning via zmx.
//!
//! Provisioning has two halves separated by the container boot. Before boot,
//! generators in this module render the first-stage bootstrap (`rc.local`)
//! and the second-stage script that runs named steps concurrently under zmx,
//! both written into the rootfs from outside. After boot, [`Runner`] SSHes
//! in as root and observes step progress through `zmx list`, never driving
//! the steps itself.

use std::future::Future;
use std::time::Duration;

use crate::errors::Result;
use crate::ssh::{self, ConnConfig};

/// zmx release installed inside containers.
pub const ZMX_VERSION: &str = "0.4.2-pre";

/// First-stage sentinel: rc.local finished installing SSH.
pub const SSH_SENTINEL: &str = "/root/.ssh-provisioned";
/// Second-stage sentinel: all provisioning steps completed.
pub const DONE_SENTINEL: &str = "/root/.pixels-provisioned";
/// Where the second-stage script is installed in the guest.
pub const PROVISION_SCRIPT_PATH: &str = "/usr/local/bin/pixels-provision.sh";
pub const DEVTOOLS_SCRIPT_PATH: &str = "/usr/local/bin/pixels-setup-devtools.sh";
pub const DEVTOOLS_UNIT_PATH: &str = "/etc/systemd/system/pixels-devtools.service";

/// A named provisioning task executed via zmx.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// zmx session name, always `px-` prefixed.
    pub name: &'static str,
    /// Shell command executed inside the zmx session.
    pub script: &'static str,
    /// Runs after ALL steps complete, in step-list order. Not tracked by zmx.
    pub finalize: Option<&'static str>,
}

/// Provisioning steps for the given configuration. Devtools first, egress
/// second; the egress lockdown is a finalize hook so the network stays open
/// while installers download.
pub fn steps(egress_mode: &str, devtools: bool) -> Vec<Step> {
    let mut steps = Vec::new();

    if devtools {
        steps.push(Step {
            name: "px-devtools",
            script: DEVTOOLS_SCRIPT_PATH,
            finalize: None,
        });
    }

    if crate::egress::is_restricted(egress_mode) {
        steps.push(Step {
            name: "px-egress",
            script: crate::egress::SETUP_SCRIPT_PATH,
            finalize: Some(crate::egress::ENABLE_SCRIPT_PATH),
        });
    }

    steps
}

pub fn step_names(steps: &[Step]) -> Vec<&'static str> {
    steps.iter().map(|s| s.name).collect()
}

/// Renders the self-contained second-stage script. Byte-deterministic for a
/// fixed step list: the same steps always produce the same file.
pub fn script(steps: &[Step]) -> String {
    let wait_args = step_names(steps).join(" ");

    let mut s = String::new();
    s.push_str("#!/bin/sh\nset -eu\n# Generated by pixels, do not edit.\n\n");
    s.push_str("SENTINEL=/root/.pixels-provisioned\n");
    s.push_str("if [ -f \"$SENTINEL\" ]; then\n");
    s.push_str("  echo \"[$(date -Iseconds)] Already provisioned, skipping\"\n");
    s.push_str("  exit 0\nfi\n\n");
    s.push_str(&format!("while [ ! -f {SSH_SENTINEL} ]; do sleep 1; done\n\n"));

    s.push_str(&format!(
        "echo \"[$(date -Iseconds)] Installing zmx {ZMX_VERSION}\"\n\
         curl -fsSL https://zmx.sh/a/zmx-{ZMX_VERSION}-linux-x86_64.tar.gz | tar xz -C /usr/local/bin/\n\n"
    ));
    s.push_str("ZMX_SOCKET_DIR=$(zmx --version | awk '/socket_dir/{print $2}')\n");
    s.push_str("mkdir -p \"$ZMX_SOCKET_DIR\"\n");
    s.push_str("echo \"[$(date -Iseconds)] zmx socket_dir: $ZMX_SOCKET_DIR\"\n\n");

    s.push_str("cleanup() { pkill -9 -f 'zmx run px-' 2>/dev/null || true; }\n");
    s.push_str("trap 'cleanup; exit 0' TERM INT\n\n");

    for step in steps {
        s.push_str(&format!(
            "echo \"[$(date -Iseconds)] Starting {name}\"\n\
             zmx run {name} {script} >/dev/null 2>&1\n",
            name = step.name,
            script = step.script,
        ));
    }

    s.push_str(&format!(
        "\necho \"[$(date -Iseconds)] Waiting for steps\"\nzmx wait {wait_args}\n\n"
    ));

    for step in steps {
        s.push_str(&format!(
            "zmx list | grep 'session_name={name}' | grep -q 'task_exit_code=0' || \
             {{ echo \"[$(date -Iseconds)] {name} failed\"; zmx history {name} 2>/dev/null || true; cleanup; exit 1; }}\n",
            name = step.name,
        ));
    }

    for step in steps {
        if let Some(finalize) = step.finalize {
            s.push_str(&format!(
                "\necho \"[$(date -Iseconds)] Enabling {name}\"\n{finalize}\n",
                name = step.name,
            ));
        }
    }

    s.push_str("\ncleanup\necho \"[$(date -Iseconds)] Provisioning complete\"\ntouch \"$SENTINEL\"\n");
    s
}

/// Options for the first-stage bootstrap written to `/etc/rc.local`.
#[derive(Debug, Clone, Copy, Default)]
pub struct RcLocalOpts {
    pub has_ssh_key: bool,
    pub has_provision_script: bool,
    pub egress_restricted: bool,
    pub devtools: bool,
}

/// Renders `/etc/rc.local`. systemd-rc-local-generator starts it on boot
/// when present and executable.
///
/// The bootstrap installs OpenSSH, replaces the image's default `ubuntu`
/// user with `pixel` (fixed uid/gid 1000), and always writes the OPEN
/// sudoers variant. When egress is restricted the lockdown (including the
/// restricted sudoers) happens later, in the egress finalize hook.
pub fn rc_local(opts: RcLocalOpts) -> String {
    let mut packages = vec!["openssh-server"];
    if opts.has_provision_script || opts.devtools {
        // curl fetches zmx and the devtools installers.
        packages.push("curl");
    }
    if opts.egress_restricted {
        // ca-certificates must be in place before the allowlist narrows.
        packages.push("ca-certificates");
    }

    let mut s = String::new();
    s.push_str("#!/bin/sh\n");
    s.push_str(&format!("if [ ! -f {SSH_SENTINEL} ]; then\n"));

    if opts.has_ssh_key {
        s.push_str(&format!(
            "    apt-get update -qq && apt-get install -y -qq {}\n",
            packages.join(" ")
        ));
        s.push_str("    if id ubuntu >/dev/null 2>&1; then userdel -r ubuntu 2>/dev/null || true; fi\n");
        s.push_str("    groupdel ubuntu 2>/dev/null || true\n");
        s.push_str("    groupadd -g 1000 pixel 2>/dev/null || true\n");
        s.push_str("    useradd -m -u 1000 -g 1000 -s /bin/bash -k /etc/skel pixel 2>/dev/null || true\n");
        s.push_str("    chown -R 1000:1000 /home/pixel\n");
        s.push_str("    cat > /etc/sudoers.d/pixel << 'PIXELS_EOF'\n");
        s.push_str(crate::egress::sudoers_unrestricted());
        s.push_str("PIXELS_EOF\n");
        s.push_str("    chmod 0440 /etc/sudoers.d/pixel\n");
        s.push_str("    systemctl enable --now ssh\n");
    }

    s.push_str(&format!("    touch {SSH_SENTINEL}\n"));
    s.push_str("fi\n");

    if opts.has_provision_script {
        s.push_str(&format!(
            "[ -x {PROVISION_SCRIPT_PATH} ] && nohup {PROVISION_SCRIPT_PATH} >/var/log/pixels-provision.log 2>&1 &\n"
        ));
    }

    s.push_str("exit 0\n");
    s
}

/// In-guest devtools bootstrap: baseline build tooling plus mise for
/// per-project toolchains.
pub fn devtools_script() -> &'static str {
    r#"#!/bin/bash
set -euo pipefail
export DEBIAN_FRONTEND=noninteractive

apt-get update -qq
apt-get install -y -qq git curl unzip pkg-config build-essential ca-certificates

curl -fsSL https://mise.run | MISE_INSTALL_PATH=/usr/local/bin/mise sh
runuser -u pixel -- sh -c 'grep -q "mise activate" ~/.bashrc || echo "eval \"\$(mise activate bash)\"" >> ~/.bashrc'
"#
}

/// Oneshot unit so the devtools bootstrap can be re-run via systemctl after
/// image upgrades.
pub fn devtools_unit() -> &'static str {
    r#"[Unit]
Description=Pixels devtools bootstrap
After=network-online.target
Wants=network-online.target

[Service]
Type=oneshot
ExecStart=/usr/local/bin/pixels-setup-devtools.sh
RemainAfterExit=yes

[Install]
WantedBy=multi-user.target
"#
}

/// Runs commands on a remote host. The production implementation shells out
/// to SSH; tests substitute a scripted mock.
pub trait Executor {
    fn exec(&self, command: &str) -> impl Future<Output = Result<i32>> + Send;
    fn output(&self, command: &str) -> impl Future<Output = Result<String>> + Send;
}

/// SSH-backed executor used outside tests.
pub struct SshExecutor {
    cc: ConnConfig,
}

impl Executor for SshExecutor {
    fn exec(&self, command: &str) -> impl Future<Output = Result<i32>> + Send {
        let cc = self.cc.clone();
        let command = command.to_string();
        async move { ssh::exec_quiet(&cc, &[&command]).await }
    }

    fn output(&self, command: &str) -> impl Future<Output = Result<String>> + Send {
        let cc = self.cc.clone();
        let command = command.to_string();
        async move { ssh::output_quiet(&cc, &[&command]).await }
    }
}

/// Wraps a zmx invocation to clear XDG_RUNTIME_DIR. SSH sessions get
/// /run/user/0 from PAM but the provision script runs without it, so zmx
/// falls back to /tmp/zmx-<uid>; clearing it here makes the Runner see the
/// same sessions the script created.
fn zmx_cmd(cmd: &str) -> String {
    format!("unset XDG_RUNTIME_DIR && {cmd}")
}

/// Parsed fields from one `zmx list` output line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: String,
    /// Unix timestamp, empty while the task is still running.
    pub ended_at: String,
    pub exit_code: String,
}

impl Session {
    pub fn is_done(&self) -> bool {
        !self.ended_at.is_empty()
    }

    pub fn succeeded(&self) -> bool {
        self.is_done() && self.exit_code == "0"
    }
}

/// Parses `zmx list` output: tab-delimited `key=value` tokens, one session
/// per line. Lines without a `session_name=` token contribute nothing.
pub fn parse_sessions(raw: &str) -> Vec<Session> {
    let mut sessions = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() || !line.starts_with("session_name=") {
            continue;
        }
        let mut name = "";
        let mut ended_at = "";
        let mut exit_code = "";
        for part in line.split('\t') {
            if let Some((k, v)) = part.split_once('=') {
                match k {
                    "session_name" => name = v,
                    "task_ended_at" => ended_at = v,
                    "task_exit_code" => exit_code = v,
                    _ => {}
                }
            }
        }
        sessions.push(Session {
            name: name.to_string(),
            ended_at: ended_at.to_string(),
            exit_code: exit_code.to_string(),
        });
    }
    sessions
}

/// Observes zmx provisioning state on a remote host.
pub struct Runner<E> {
    exec: E,
}

impl Runner<SshExecutor> {
    /// A Runner that connects as the given user over SSH. Provisioning is
    /// observed as root regardless of the configured login user.
    pub fn new(host: &str, user: &str, key_path: &str) -> Self {
        Self {
            exec: SshExecutor {
                cc: ConnConfig {
                    host: host.to_string(),
                    user: user.to_string(),
                    key_path: key_path.to_string(),
                    env: Default::default(),
                },
            },
        }
    }
}

impl<E: Executor> Runner<E> {
    pub fn with_executor(exec: E) -> Self {
        Self { exec }
    }

    /// Raw `zmx list` output, trimmed.
    pub async fn list(&self) -> Result<String> {
        let out = self
            .exec
            .output(&zmx_cmd("zmx list"))
            .await
            .map_err(|e| e.context("listing zmx sessions"))?;
        Ok(out.trim().to_string())
    }

    /// Scrollback of a completed zmx session.
    pub async fn history(&self, name: &str) -> Result<String> {
        self.exec
            .output(&zmx_cmd(&format!("zmx history {name}")))
            .await
            .map_err(|e| e.context(&format!("getting history for {name}")))
    }

    /// Whether the end-to-end completion sentinel exists.
    pub async fn is_provisioned(&self) -> bool {
        matches!(self.exec.exec(&format!("test -f {DONE_SENTINEL}")).await, Ok(0))
    }

    /// Whether a second-stage script was ever installed.
    pub async fn has_provision_script(&self) -> bool {
        matches!(
            self.exec.exec(&format!("test -x {PROVISION_SCRIPT_PATH}")).await,
            Ok(0)
        )
    }

    /// Classifies each expected step as pending, running, done, or failed.
    /// `all_done` is true iff no step is pending or running. Returns
    /// `("", false)` while zmx is not reachable yet.
    pub async fn poll_status(&self, names: &[&str]) -> (String, bool) {
        let Ok(raw) = self.list().await else {
            return (String::new(), false);
        };
        let sessions = parse_sessions(&raw);

        let mut parts = Vec::new();
        let mut all_done = true;
        for name in names {
            match sessions.iter().find(|s| s.name == *name) {
                None => {
                    parts.push(format!("{name} pending"));
                    all_done = false;
                }
                Some(s) if !s.is_done() => {
                    parts.push(format!("{name} running"));
                    all_done = false;
                }
                Some(s) if s.exit_code != "0" => {
                    parts.push(format!("{name} failed (exit {})", s.exit_code));
                }
                Some(_) => parts.push(format!("{name} done")),
            }
        }

        (parts.join(", "), all_done)
    }

    /// Polls until provisioning completes, reporting progress through
    /// `set_status`. Returns immediately when provisioning is already done
    /// or was never requested. There is no internal timeout: the caller
    /// bounds this by dropping the future (e.g. racing it against Ctrl-C).
    pub async fn wait_provisioned<F: FnMut(&str)>(&self, mut set_status: F) {
        if self.is_provisioned().await || !self.has_provision_script().await {
            return;
        }

        set_status("Waiting for provisioning...");
        loop {
            tokio::time::sleep(Duration::from_secs(2)).await;

            if self.is_provisioned().await {
                return;
            }

            let Ok(raw) = self.list().await else { continue };
            let parts: Vec<String> = parse_sessions(&raw)
                .iter()
                .filter(|s| s.name.starts_with("px-"))
                .map(|s| {
                    if s.is_done() {
                        format!("{} done", s.name)
                    } else {
                        format!("{} running", s.name)
                    }
                })
                .collect();
            if !parts.is_empty() {
                set_status(&parts.join(", "));
            }
        }
    }
}
