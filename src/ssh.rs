//! Thin wrapper around the external `ssh` binary: argument construction,
//! readiness probing, command execution, and the interactive console.

use std::collections::BTreeMap;
use std::process::Stdio;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::errors::{Error, Result};

/// Parameters for an SSH connection to a pixel.
#[derive(Debug, Clone, Default)]
pub struct ConnConfig {
    pub host: String,
    pub user: String,
    pub key_path: String,
    /// Env vars forwarded via the SSH protocol (SetEnv). Sorted by key so
    /// the generated option is deterministic.
    pub env: BTreeMap<String, String>,
}

/// Builds the common argument vector for non-interactive SSH invocations.
///
/// Host keys are not checked: pixels are disposable and their keys churn on
/// every create/restore.
pub fn ssh_args(cc: &ConnConfig) -> Vec<String> {
    let null_device = if cfg!(windows) { "NUL" } else { "/dev/null" };
    let mut args = vec![
        "-o".into(),
        "StrictHostKeyChecking=no".into(),
        "-o".into(),
        format!("UserKnownHostsFile={null_device}"),
        "-o".into(),
        "PasswordAuthentication=no".into(),
        "-o".into(),
        "LogLevel=ERROR".into(),
    ];
    if !cc.key_path.is_empty() {
        args.push("-i".into());
        args.push(cc.key_path.clone());
    }

    // All vars must go in a single SetEnv option: OpenSSH only honors the
    // first occurrence of a repeated -o SetEnv.
    if !cc.env.is_empty() {
        let pairs: Vec<String> = cc.env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        args.push("-o".into());
        args.push(format!("SetEnv={}", pairs.join(" ")));
    }

    args.push(format!("{}@{}", cc.user, cc.host));
    args
}

/// Builds arguments for an interactive console. When a remote command is
/// given, `-t` forces PTY allocation and the command becomes the final
/// argument.
pub fn console_args(cc: &ConnConfig, remote_cmd: Option<&str>) -> Vec<String> {
    let mut args = ssh_args(cc);
    if let Some(cmd) = remote_cmd {
        let user_host = args.pop().expect("ssh_args always ends with user@host");
        args.push("-t".into());
        args.push(user_host);
        args.push(cmd.to_string());
    }
    args
}

/// Polls the host's SSH port until it accepts TCP connections or the
/// timeout expires. Progress is logged every 5 seconds.
pub async fn wait_ready(host: &str, timeout: Duration) -> Result<()> {
    let start = tokio::time::Instant::now();
    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);
    let mut last_log = start;

    loop {
        tokio::select! {
            _ = &mut deadline => return Err(Error::Timeout(timeout)),
            res = tokio::time::timeout(
                Duration::from_secs(2),
                TcpStream::connect((host, 22)),
            ) => {
                if matches!(res, Ok(Ok(_))) {
                    info!("SSH ready on {host} ({:?})", start.elapsed());
                    return Ok(());
                }
            }
        }
        if last_log.elapsed() >= Duration::from_secs(5) {
            debug!("SSH: waiting for {host} ({:?} elapsed)...", start.elapsed());
            last_log = tokio::time::Instant::now();
        }
        tokio::select! {
            _ = &mut deadline => return Err(Error::Timeout(timeout)),
            _ = tokio::time::sleep(Duration::from_millis(500)) => {}
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    // Killed by signal maps to the generic failure code.
    status.code().unwrap_or(1)
}

/// Runs a command on the remote host with inherited stdio and returns its
/// exit code. A non-zero remote exit is not an error; failing to spawn is.
pub async fn exec(cc: &ConnConfig, command: &[&str]) -> Result<i32> {
    let status = tokio::process::Command::new("ssh")
        .args(ssh_args(cc))
        .args(command)
        .status()
        .await?;
    Ok(exit_code(status))
}

/// Like [`exec`] but with stdio detached. Use for programmatic probes.
pub async fn exec_quiet(cc: &ConnConfig, command: &[&str]) -> Result<i32> {
    let status = tokio::process::Command::new("ssh")
        .args(ssh_args(cc))
        .args(command)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await?;
    Ok(exit_code(status))
}

/// Runs a command on the remote host and captures stdout; stderr passes
/// through to the terminal.
pub async fn output(cc: &ConnConfig, command: &[&str]) -> Result<String> {
    let out = tokio::process::Command::new("ssh")
        .args(ssh_args(cc))
        .args(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .output()
        .await?;
    if !out.status.success() {
        return Err(Error::Transport(format!(
            "ssh exited with {}",
            exit_code(out.status)
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Like [`output`] but with stderr discarded as well.
pub async fn output_quiet(cc: &ConnConfig, command: &[&str]) -> Result<String> {
    let out = tokio::process::Command::new("ssh")
        .args(ssh_args(cc))
        .args(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output()
        .await?;
    if !out.status.success() {
        return Err(Error::Transport(format!(
            "ssh exited with {}",
            exit_code(out.status)
        )));
    }
    Ok(String::from_utf8_lossy(&out.stdout).into_owned())
}

/// Verifies key-based authentication by running a trivial remote command.
pub async fn test_auth(cc: &ConnConfig) -> Result<()> {
    let code = exec_quiet(cc, &["true"]).await?;
    if code != 0 {
        return Err(Error::Auth(format!("key auth to {} failed", cc.host)));
    }
    Ok(())
}

/// Opens an interactive SSH session. On POSIX platforms this replaces the
/// current process so terminal state and exit codes pass straight through;
/// it only returns on failure to exec.
#[cfg(unix)]
pub fn console(cc: &ConnConfig, remote_cmd: Option<&str>) -> Result<()> {
    use std::os::unix::process::CommandExt;

    let err = std::process::Command::new("ssh")
        .args(console_args(cc, remote_cmd))
        .exec();
    Err(Error::Io(err))
}

/// Child-process fallback for platforms without exec(2): the session runs
/// as a child and its exit code becomes ours.
#[cfg(not(unix))]
pub fn console(cc: &ConnConfig, remote_cmd: Option<&str>) -> Result<()> {
    let status = std::process::Command::new("ssh")
        .args(console_args(cc, remote_cmd))
        .status()?;
    std::process::exit(status.code().unwrap_or(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cc() -> ConnConfig {
        ConnConfig {
            host: "10.0.0.1".into(),
            user: "pixel".into(),
            key_path: "/tmp/key".into(),
            env: BTreeMap::new(),
        }
    }

    #[test]
    fn args_end_with_key_and_user_host() {
        let args = ssh_args(&cc());
        let n = args.len();
        assert_eq!(&args[n - 3..], &["-i", "/tmp/key", "pixel@10.0.0.1"]);
        assert!(args.contains(&"StrictHostKeyChecking=no".to_string()));
        assert!(args.contains(&"PasswordAuthentication=no".to_string()));
        assert!(args.contains(&"LogLevel=ERROR".to_string()));
    }

    #[test]
    fn args_omit_key_flag_without_key() {
        let mut c = cc();
        c.key_path.clear();
        let args = ssh_args(&c);
        assert_eq!(args.last().unwrap(), "pixel@10.0.0.1");
        assert!(!args.contains(&"-i".to_string()));
    }

    #[test]
    fn env_yields_single_sorted_setenv() {
        let mut c = cc();
        c.env.insert("ZED".into(), "3".into());
        c.env.insert("ALPHA".into(), "1".into());
        c.env.insert("MID".into(), "2".into());
        let args = ssh_args(&c);

        let setenvs: Vec<&String> = args.iter().filter(|a| a.starts_with("SetEnv=")).collect();
        assert_eq!(setenvs.len(), 1);
        assert_eq!(setenvs[0].as_str(), "SetEnv=ALPHA=1 MID=2 ZED=3");
    }

    #[test]
    fn empty_env_yields_no_setenv() {
        let args = ssh_args(&cc());
        assert!(!args.iter().any(|a| a.starts_with("SetEnv=")));
    }

    #[test]
    fn console_args_without_command_match_ssh_args() {
        assert_eq!(console_args(&cc(), None), ssh_args(&cc()));
    }

    #[test]
    fn console_args_insert_tty_flag_before_user_host() {
        let args = console_args(&cc(), Some("zmx attach console bash -l"));
        let n = args.len();
        assert_eq!(args[n - 3], "-t");
        assert_eq!(args[n - 2], "pixel@10.0.0.1");
        assert_eq!(args[n - 1], "zmx attach console bash -l");
    }
}
