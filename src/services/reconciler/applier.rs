use ssh2::{CheckResult, KnownHostFileKind, OpenFlags, OpenType, Session};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::EngineConfig;

use super::types::ErrorClass;

const DEFAULT_TEMPLATE: &str = "/home/{user}/.ssh/authorized_keys";

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ApplyError {
    pub class: ErrorClass,
    pub message: String,
}

impl ApplyError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transport,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Config,
            message: message.into(),
        }
    }
}

/// Everything the transport needs to land one rendered file on one remote
/// account.
#[derive(Debug, Clone)]
pub struct ApplyTarget {
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub remote_username: String,
    pub authorized_keys_path: String,
}

impl ApplyTarget {
    pub fn temp_path(&self) -> String {
        format!("{}.tmp", self.authorized_keys_path)
    }

    pub fn ssh_dir(&self) -> String {
        match self.authorized_keys_path.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir.to_string(),
            _ => self.authorized_keys_path.clone(),
        }
    }
}

/// Transport seam. The production implementation drives libssh2; tests
/// script outcomes. Blocking — callers hop through spawn_blocking.
pub trait RemoteApplier: Send + Sync {
    fn apply(&self, target: &ApplyTarget, content: &[u8]) -> Result<(), ApplyError>;
}

/// Resolve the live authorized_keys path for an account from the
/// per-OS-family template map. `root` bypasses the home-directory
/// convention on every family.
pub fn authorized_keys_path(
    templates: &BTreeMap<String, String>,
    os_family: &str,
    remote_username: &str,
) -> String {
    if remote_username == "root" {
        return "/root/.ssh/authorized_keys".to_string();
    }
    let template = templates
        .get(&os_family.trim().to_lowercase())
        .map(String::as_str)
        .unwrap_or(DEFAULT_TEMPLATE);
    template.replace("{user}", remote_username)
}

pub fn shell_quote(value: &str) -> String {
    if value.is_empty() {
        return "''".to_string();
    }
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Publish command: tighten ownership and mode on the staged file, then
/// rename over the live path. The rename is the only step that touches the
/// live file, so sshd never observes a partial write.
pub fn install_command(target: &ApplyTarget, temp_path: &str) -> String {
    let owner = shell_quote(&format!(
        "{}:{}",
        target.remote_username, target.remote_username
    ));
    format!(
        "chown {owner} {tmp} && chmod 600 {tmp} && mv -f {tmp} {live}",
        tmp = shell_quote(temp_path),
        live = shell_quote(&target.authorized_keys_path),
    )
}

fn ensure_dir_command(target: &ApplyTarget) -> String {
    let owner = shell_quote(&format!(
        "{}:{}",
        target.remote_username, target.remote_username
    ));
    let dir = shell_quote(&target.ssh_dir());
    format!("chown {owner} {dir} && chmod 700 {dir}")
}

pub struct Ssh2Applier {
    ssh_user: String,
    key_path: PathBuf,
    known_hosts_path: PathBuf,
    strict_host_key_check: bool,
    connect_timeout: Duration,
    operation_timeout: Duration,
}

impl Ssh2Applier {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            ssh_user: config.apply_ssh_user.clone(),
            key_path: config.apply_ssh_key_path.clone(),
            known_hosts_path: config.ssh_known_hosts_path.clone(),
            strict_host_key_check: config.strict_host_key_check,
            connect_timeout: Duration::from_secs(config.connect_timeout_seconds),
            operation_timeout: Duration::from_secs(config.operation_timeout_seconds),
        }
    }

    fn connect(&self, target: &ApplyTarget) -> Result<Session, ApplyError> {
        let addrs = (target.address.as_str(), target.port)
            .to_socket_addrs()
            .map_err(|err| {
                ApplyError::transport(format!("Failed to resolve {}: {err}", target.address))
            })?;

        let mut tcp = None;
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(err) => last_err = Some(err),
            }
        }
        let tcp = tcp.ok_or_else(|| {
            ApplyError::transport(format!(
                "Failed to connect to {}:{}: {}",
                target.address,
                target.port,
                last_err
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "no addresses resolved".to_string())
            ))
        })?;
        tcp.set_read_timeout(Some(self.operation_timeout)).ok();
        tcp.set_write_timeout(Some(self.operation_timeout)).ok();

        let mut session = Session::new()
            .map_err(|err| ApplyError::transport(format!("Failed to create SSH session: {err}")))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|err| ApplyError::transport(format!("SSH handshake failed: {err}")))?;
        session.set_timeout(self.operation_timeout.as_millis().min(u128::from(u32::MAX)) as u32);

        if self.strict_host_key_check {
            self.verify_host_key(&session, target)?;
        }

        session
            .userauth_pubkey_file(&self.ssh_user, None, &self.key_path, None)
            .map_err(|err| {
                ApplyError::config(format!(
                    "SSH authentication as {} failed: {err}",
                    self.ssh_user
                ))
            })?;
        if !session.authenticated() {
            return Err(ApplyError::config(format!(
                "SSH authentication as {} failed",
                self.ssh_user
            )));
        }
        Ok(session)
    }

    fn verify_host_key(&self, session: &Session, target: &ApplyTarget) -> Result<(), ApplyError> {
        let (host_key, _) = session
            .host_key()
            .ok_or_else(|| ApplyError::transport("SSH host key unavailable"))?;
        let mut known_hosts = session
            .known_hosts()
            .map_err(|err| ApplyError::transport(format!("known_hosts init failed: {err}")))?;
        if self.known_hosts_path.exists() {
            known_hosts
                .read_file(&self.known_hosts_path, KnownHostFileKind::OpenSSH)
                .map_err(|err| {
                    ApplyError::config(format!(
                        "Failed to read known_hosts {}: {err}",
                        self.known_hosts_path.display()
                    ))
                })?;
        }
        match known_hosts.check_port(&target.hostname, target.port, host_key) {
            CheckResult::Match => Ok(()),
            CheckResult::NotFound => Err(ApplyError::config(format!(
                "SSH host key for {}:{} not present in {}",
                target.hostname,
                target.port,
                self.known_hosts_path.display()
            ))),
            CheckResult::Mismatch => Err(ApplyError::config(format!(
                "SSH host key mismatch for {}:{}; refusing to write",
                target.hostname, target.port
            ))),
            CheckResult::Failure => Err(ApplyError::transport(format!(
                "Unable to verify SSH host key for {}:{}",
                target.hostname, target.port
            ))),
        }
    }

    fn run_command(&self, session: &mut Session, command: &str) -> Result<String, ApplyError> {
        let mut channel = session
            .channel_session()
            .map_err(|err| ApplyError::transport(format!("Failed to open SSH channel: {err}")))?;
        channel
            .exec(command)
            .map_err(|err| ApplyError::transport(format!("Failed to exec {command}: {err}")))?;
        let mut stdout = String::new();
        channel.read_to_string(&mut stdout).ok();
        let mut stderr = String::new();
        channel.stderr().read_to_string(&mut stderr).ok();
        channel.wait_close().ok();
        let exit = channel.exit_status().unwrap_or(-1);
        if !stderr.trim().is_empty() {
            stdout.push_str(&format!("\n{stderr}"));
        }
        if exit != 0 {
            // Non-zero from chown/chmod/mv is an account or permission
            // problem on the host, not a transient network condition.
            return Err(ApplyError::config(format!(
                "Remote command failed ({exit}): {}",
                stdout.trim()
            )));
        }
        Ok(stdout)
    }

    fn ensure_ssh_dir(
        &self,
        session: &mut Session,
        sftp: &ssh2::Sftp,
        target: &ApplyTarget,
    ) -> Result<(), ApplyError> {
        let dir = target.ssh_dir();
        if sftp.stat(Path::new(&dir)).is_ok() {
            return Ok(());
        }
        sftp.mkdir(Path::new(&dir), 0o700).map_err(|err| {
            ApplyError::config(format!("Failed to create remote directory {dir}: {err}"))
        })?;
        self.run_command(session, &ensure_dir_command(target))?;
        Ok(())
    }
}

impl RemoteApplier for Ssh2Applier {
    fn apply(&self, target: &ApplyTarget, content: &[u8]) -> Result<(), ApplyError> {
        let mut session = self.connect(target)?;
        let sftp = session
            .sftp()
            .map_err(|err| ApplyError::transport(format!("SFTP unavailable: {err}")))?;

        self.ensure_ssh_dir(&mut session, &sftp, target)?;

        let temp_path = target.temp_path();
        {
            let mut remote = sftp
                .open_mode(
                    Path::new(&temp_path),
                    OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
                    0o600,
                    OpenType::File,
                )
                .map_err(|err| {
                    ApplyError::config(format!("Failed to stage {temp_path}: {err}"))
                })?;
            remote.write_all(content).map_err(|err| {
                ApplyError::transport(format!("Failed to upload {temp_path}: {err}"))
            })?;
        }

        self.run_command(&mut session, &install_command(target, &temp_path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_authorized_keys_templates;

    fn target(remote_username: &str) -> ApplyTarget {
        ApplyTarget {
            hostname: "node-1".to_string(),
            address: "10.0.0.1".to_string(),
            port: 22,
            remote_username: remote_username.to_string(),
            authorized_keys_path: authorized_keys_path(
                &default_authorized_keys_templates(),
                "linux",
                remote_username,
            ),
        }
    }

    #[test]
    fn path_follows_os_family_template() {
        let templates = default_authorized_keys_templates();
        assert_eq!(
            authorized_keys_path(&templates, "linux", "alice"),
            "/home/alice/.ssh/authorized_keys"
        );
        assert_eq!(
            authorized_keys_path(&templates, "Darwin", "alice"),
            "/Users/alice/.ssh/authorized_keys"
        );
        // Unknown families fall back to the conventional linux layout.
        assert_eq!(
            authorized_keys_path(&templates, "illumos", "alice"),
            "/home/alice/.ssh/authorized_keys"
        );
    }

    #[test]
    fn root_account_bypasses_home_templates() {
        let templates = default_authorized_keys_templates();
        assert_eq!(
            authorized_keys_path(&templates, "darwin", "root"),
            "/root/.ssh/authorized_keys"
        );
    }

    #[test]
    fn shell_quote_wraps_and_escapes() {
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote("alice"), "'alice'");
        assert_eq!(shell_quote("a'b"), "'a'\"'\"'b'");
    }

    #[test]
    fn install_command_stages_then_renames() {
        let target = target("alice");
        let temp = target.temp_path();
        let command = install_command(&target, &temp);
        assert_eq!(
            command,
            "chown 'alice:alice' '/home/alice/.ssh/authorized_keys.tmp' \
             && chmod 600 '/home/alice/.ssh/authorized_keys.tmp' \
             && mv -f '/home/alice/.ssh/authorized_keys.tmp' '/home/alice/.ssh/authorized_keys'"
        );
        // The live path only ever appears as the rename destination.
        assert_eq!(command.matches("authorized_keys'").count(), 1);
    }

    #[test]
    fn ssh_dir_strips_the_file_name() {
        assert_eq!(target("alice").ssh_dir(), "/home/alice/.ssh");
    }
}
