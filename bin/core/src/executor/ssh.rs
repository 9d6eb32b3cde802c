use std::time::Duration;

use anyhow::{Context, bail};
use async_trait::async_trait;
use base64::Engine;
use openssh::{KnownHosts, SessionBuilder};

use super::{
  CommandResult, DeployResult, DeployStatus, DeployStep, RemoteExecutor,
  SshTarget, validate_app_id, wants_metrics_config,
};
use crate::entities::ContainerSummary;

const STDOUT_TAIL_BYTES: usize = 2_000;
const STDERR_TAIL_BYTES: usize = 1_000;
const PROMETHEUS_SCRAPE_CONFIG: &str = "global:\n  scrape_interval: 15s\nscrape_configs:\n  - job_name: app\n    static_configs:\n      - targets: ['localhost:9090']\n";

pub struct SshExecutor {
  key_path: String,
}

impl SshExecutor {
  pub fn new(key_path: impl Into<String>) -> Self {
    Self { key_path: key_path.into() }
  }

  async fn connect(
    &self,
    target: &SshTarget,
  ) -> anyhow::Result<openssh::Session> {
    let mut builder = SessionBuilder::default();
    builder
      .known_hosts_check(KnownHosts::Accept)
      .user(target.user.clone())
      .port(target.port)
      .keyfile(&self.key_path)
      .connect_timeout(Duration::from_secs(10));
    builder.connect(&target.host).await.with_context(|| {
      format!(
        "failed to open SSH session to {}@{}:{}",
        target.user, target.host, target.port
      )
    })
  }

  /// Runs `bash -c <cmd>` over a fresh session, enforcing `timeout` and
  /// truncating captured output to the documented tail sizes.
  async fn exec(
    &self,
    target: &SshTarget,
    cmd: &str,
    timeout: Duration,
  ) -> anyhow::Result<CommandResult> {
    let started = std::time::Instant::now();
    let session = self.connect(target).await?;
    let run = async {
      session
        .command("bash")
        .arg("-c")
        .arg(cmd)
        .output()
        .await
        .context("failed to execute remote command")
    };

    let result = match tokio::time::timeout(timeout, run).await {
      Ok(Ok(output)) => {
        let stdout = tail(&output.stdout, STDOUT_TAIL_BYTES);
        let stderr = tail(&output.stderr, STDERR_TAIL_BYTES);
        CommandResult {
          code: output.status.code().unwrap_or(-1),
          stdout,
          stderr,
        }
      }
      Ok(Err(e)) => CommandResult {
        code: -1,
        stdout: String::new(),
        stderr: format!("{e:#}"),
      },
      Err(_) => CommandResult {
        code: 124,
        stdout: String::new(),
        stderr: format!(
          "command timed out after {}s",
          timeout.as_secs()
        ),
      },
    };

    let _ = session.close().await;
    tracing::debug!(
      host = %target.host,
      elapsed_ms = started.elapsed().as_millis(),
      code = result.code,
      "ran remote command",
    );
    Ok(result)
  }

  /// Writes `content` to `remote_path` by piping a base64-decoded here-string
  /// into a decoder, never interpolating `content` into the command line.
  async fn write_file(
    &self,
    target: &SshTarget,
    remote_path: &str,
    content: &[u8],
  ) -> anyhow::Result<()> {
    let encoded = base64::engine::general_purpose::STANDARD.encode(content);
    let script = format!(
      "base64 -d > {path} <<< {payload}",
      path = shlex::try_quote(remote_path)
        .context("invalid remote path")?,
      payload = shlex::try_quote(&encoded)
        .context("failed to quote payload")?,
    );
    let result = self.exec(target, &script, super::DEFAULT_COMMAND_TIMEOUT).await?;
    if !result.ok() {
      bail!("failed to write {remote_path}: {}", result.stderr);
    }
    Ok(())
  }

  async fn read_file(
    &self,
    target: &SshTarget,
    remote_path: &str,
  ) -> anyhow::Result<Option<String>> {
    let quoted =
      shlex::try_quote(remote_path).context("invalid remote path")?;
    let result = self
      .exec(
        target,
        &format!("cat {quoted} 2>/dev/null || true"),
        super::DEFAULT_COMMAND_TIMEOUT,
      )
      .await?;
    if result.stdout.is_empty() { Ok(None) } else { Ok(Some(result.stdout)) }
  }

  fn app_dir(app_id: &str) -> String {
    format!("/opt/apps/{app_id}")
  }
}

fn tail(bytes: &[u8], max: usize) -> String {
  if bytes.len() <= max {
    return String::from_utf8_lossy(bytes).into_owned();
  }
  // Slice the raw bytes first, then decode lossily -- the byte at
  // `len - max` may land mid-codepoint for non-ASCII remote output.
  String::from_utf8_lossy(&bytes[bytes.len() - max..]).into_owned()
}

#[async_trait]
impl RemoteExecutor for SshExecutor {
  async fn test_connection(&self, target: &SshTarget) -> bool {
    matches!(
      self.exec(target, "echo ok", super::SSH_PROBE_TIMEOUT).await,
      Ok(result) if result.ok() && result.stdout.trim() == "ok"
    )
  }

  async fn run_command(
    &self,
    target: &SshTarget,
    cmd: &str,
    timeout: Duration,
  ) -> anyhow::Result<CommandResult> {
    self.exec(target, cmd, timeout).await
  }

  async fn deploy_compose(
    &self,
    target: &SshTarget,
    app_id: &str,
    compose: &str,
  ) -> anyhow::Result<DeployResult> {
    validate_app_id(app_id)?;
    let dir = Self::app_dir(app_id);
    let mut steps = Vec::new();

    let mkdir = self
      .exec(
        target,
        &format!("mkdir -p {}", shlex::try_quote(&dir)?),
        super::DEFAULT_COMMAND_TIMEOUT,
      )
      .await?;
    steps.push(DeployStep {
      name: "create-directory".into(),
      ok: mkdir.ok(),
      detail: (!mkdir.ok()).then(|| mkdir.stderr.clone()),
    });
    if !mkdir.ok() {
      return Ok(DeployResult { status: DeployStatus::Failed, steps, containers: vec![] });
    }

    self
      .write_file(
        target,
        &format!("{dir}/docker-compose.yml"),
        compose.as_bytes(),
      )
      .await
      .context("write-compose")?;
    steps.push(DeployStep {
      name: "write-compose".into(),
      ok: true,
      detail: None,
    });

    if wants_metrics_config(app_id) {
      self
        .write_file(
          target,
          &format!("{dir}/prometheus.yml"),
          PROMETHEUS_SCRAPE_CONFIG.as_bytes(),
        )
        .await
        .context("write-supporting-config")?;
      steps.push(DeployStep {
        name: "write-supporting-config".into(),
        ok: true,
        detail: None,
      });
    }

    let docker_check = self
      .exec(target, "command -v docker", super::DEFAULT_COMMAND_TIMEOUT)
      .await?;
    steps.push(DeployStep {
      name: "docker-check".into(),
      ok: docker_check.ok(),
      detail: None,
    });

    if !docker_check.ok() {
      let install = self
        .exec(
          target,
          "curl -fsSL https://get.docker.com | sh",
          super::COMPOSE_UP_TIMEOUT,
        )
        .await?;
      steps.push(DeployStep {
        name: "docker-install".into(),
        ok: install.ok(),
        detail: (!install.ok()).then(|| install.stderr.clone()),
      });
      if !install.ok() {
        return Ok(DeployResult { status: DeployStatus::Failed, steps, containers: vec![] });
      }
    }

    let up = self
      .exec(
        target,
        &format!(
          "cd {} && docker compose up -d",
          shlex::try_quote(&dir)?
        ),
        super::COMPOSE_UP_TIMEOUT,
      )
      .await?;
    steps.push(DeployStep {
      name: "docker-compose-up".into(),
      ok: up.ok(),
      detail: (!up.ok()).then(|| up.stderr.clone()),
    });
    if !up.ok() {
      return Ok(DeployResult { status: DeployStatus::Failed, steps, containers: vec![] });
    }

    let containers = self.get_app_status(target, app_id).await?;
    steps.push(DeployStep {
      name: "container-list".into(),
      ok: true,
      detail: None,
    });

    Ok(DeployResult { status: DeployStatus::Running, steps, containers })
  }

  async fn setup_caddy_proxy(
    &self,
    target: &SshTarget,
    local_port: u16,
    subdomain: &str,
    base_domain: &str,
  ) -> anyhow::Result<String> {
    let caddy_check = self
      .exec(target, "command -v caddy", super::DEFAULT_COMMAND_TIMEOUT)
      .await?;
    if !caddy_check.ok() {
      let install = self
        .exec(
          target,
          "curl -1sLf 'https://dl.cloudsmith.io/public/caddy/stable/gpg.key' \
           | gpg --dearmor -o /usr/share/keyrings/caddy-stable-archive-keyring.gpg \
           && curl -1sLf 'https://dl.cloudsmith.io/public/caddy/stable/debian.deb.txt' \
           > /etc/apt/sources.list.d/caddy-stable.list \
           && apt-get update -y && apt-get install -y caddy",
          super::PROXY_INSTALL_TIMEOUT,
        )
        .await?;
      if !install.ok() {
        bail!("failed to install caddy: {}", install.stderr);
      }
    }

    self
      .exec(
        target,
        "mkdir -p /etc/caddy/sites",
        super::DEFAULT_COMMAND_TIMEOUT,
      )
      .await?;

    let site_config = format!(
      "{subdomain}.{base_domain} {{\n    reverse_proxy localhost:{local_port}\n}}\n"
    );
    self
      .write_file(
        target,
        &format!("/etc/caddy/sites/{subdomain}.caddy"),
        site_config.as_bytes(),
      )
      .await
      .context("write-caddy-site-config")?;

    let existing_caddyfile =
      self.read_file(target, "/etc/caddy/Caddyfile").await?.unwrap_or_default();
    if !existing_caddyfile.contains("import sites/*.caddy") {
      let mut updated = existing_caddyfile;
      updated.push_str("\nimport sites/*.caddy\n");
      self
        .write_file(target, "/etc/caddy/Caddyfile", updated.as_bytes())
        .await
        .context("write-caddyfile")?;
    }

    let reload = self
      .exec(
        target,
        "systemctl reload caddy || systemctl restart caddy",
        super::PROXY_INSTALL_TIMEOUT,
      )
      .await?;
    if !reload.ok() {
      bail!("failed to reload caddy: {}", reload.stderr);
    }

    Ok(format!("https://{subdomain}.{base_domain}"))
  }

  async fn get_app_status(
    &self,
    target: &SshTarget,
    app_id: &str,
  ) -> anyhow::Result<Vec<ContainerSummary>> {
    validate_app_id(app_id)?;
    let dir = Self::app_dir(app_id);
    let result = self
      .exec(
        target,
        &format!(
          "cd {} && docker compose ps --format json",
          shlex::try_quote(&dir)?
        ),
        super::DEFAULT_COMMAND_TIMEOUT,
      )
      .await?;
    if !result.ok() {
      return Ok(vec![]);
    }
    Ok(parse_compose_ps(&result.stdout))
  }

  async fn stop_app(
    &self,
    target: &SshTarget,
    app_id: &str,
  ) -> anyhow::Result<()> {
    validate_app_id(app_id)?;
    let dir = Self::app_dir(app_id);
    let result = self
      .exec(
        target,
        &format!(
          "cd {} && docker compose down",
          shlex::try_quote(&dir)?
        ),
        super::COMPOSE_UP_TIMEOUT,
      )
      .await?;
    if !result.ok() {
      bail!("failed to stop app: {}", result.stderr);
    }
    Ok(())
  }

  async fn remove_app(
    &self,
    target: &SshTarget,
    app_id: &str,
  ) -> anyhow::Result<()> {
    validate_app_id(app_id)?;
    let dir = Self::app_dir(app_id);
    let quoted = shlex::try_quote(&dir)?;
    // Idempotent: absent dir means `docker compose down` no-ops (compose
    // file missing) and `rm -rf` on an absent path succeeds.
    let result = self
      .exec(
        target,
        &format!(
          "if [ -d {quoted} ]; then cd {quoted} && docker compose down -v; fi; rm -rf {quoted}"
        ),
        super::COMPOSE_UP_TIMEOUT,
      )
      .await?;
    if !result.ok() {
      bail!("failed to remove app: {}", result.stderr);
    }
    Ok(())
  }

  async fn revoke_deployment_key(
    &self,
    target: &SshTarget,
    public_key: &str,
  ) -> anyhow::Result<()> {
    let fingerprint = key_match_prefix(public_key);
    let auth_keys_path = "~/.ssh/authorized_keys";
    let Some(current) = self.read_file(target, auth_keys_path).await? else {
      return Ok(());
    };

    let filtered: String = current
      .lines()
      .filter(|line| !line.trim_start().starts_with(&fingerprint))
      .map(|line| format!("{line}\n"))
      .collect();

    if filtered == current {
      return Ok(());
    }

    // Write to a sibling temp file, then atomically replace: safe for
    // concurrent SSH logins reading the original file mid-write.
    self
      .write_file(
        target,
        "~/.ssh/authorized_keys.tmp",
        filtered.as_bytes(),
      )
      .await
      .context("write-authorized-keys-temp")?;
    let mv = self
      .exec(
        target,
        "mv -f ~/.ssh/authorized_keys.tmp ~/.ssh/authorized_keys",
        super::DEFAULT_COMMAND_TIMEOUT,
      )
      .await?;
    if !mv.ok() {
      bail!("failed to replace authorized_keys: {}", mv.stderr);
    }
    Ok(())
  }
}

/// The `type base64` portion of an `authorized_keys` line, ignoring any
/// trailing comment.
fn key_match_prefix(public_key: &str) -> String {
  public_key
    .split_whitespace()
    .take(2)
    .collect::<Vec<_>>()
    .join(" ")
}

fn parse_compose_ps(stdout: &str) -> Vec<ContainerSummary> {
  // `docker compose ps --format json` emits either a JSON array or one
  // JSON object per line depending on compose version; handle both.
  let trimmed = stdout.trim();
  if trimmed.is_empty() {
    return vec![];
  }
  if let Ok(items) = serde_json::from_str::<Vec<serde_json::Value>>(trimmed) {
    return items.iter().filter_map(container_from_json).collect();
  }
  trimmed
    .lines()
    .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
    .filter_map(|v| container_from_json(&v))
    .collect()
}

fn container_from_json(v: &serde_json::Value) -> Option<ContainerSummary> {
  Some(ContainerSummary {
    name: v.get("Name")?.as_str()?.to_string(),
    image: v.get("Image").and_then(|i| i.as_str()).unwrap_or_default().to_string(),
    state: v.get("State").and_then(|s| s.as_str()).unwrap_or_default().to_string(),
    ports: v
      .get("Publishers")
      .and_then(|p| p.as_array())
      .map(|arr| {
        arr
          .iter()
          .filter_map(|p| p.get("PublishedPort").and_then(|n| n.as_u64()))
          .map(|n| n.to_string())
          .collect()
      })
      .unwrap_or_default(),
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tails_output_to_configured_sizes() {
    let long = vec![b'x'; 3_000];
    assert_eq!(tail(&long, STDOUT_TAIL_BYTES).len(), STDOUT_TAIL_BYTES);
  }

  #[test]
  fn tail_does_not_panic_on_split_multibyte_char() {
    // "é" is 2 bytes; asking for a tail length that lands the cut point
    // on its second byte must not panic.
    let mut bytes = vec![b'x'; 100];
    bytes.extend_from_slice("é".as_bytes());
    tail(&bytes, 1);
  }

  #[test]
  fn key_prefix_ignores_comment() {
    let key = "ssh-ed25519 AAAAC3Nz deploy@core";
    assert_eq!(key_match_prefix(key), "ssh-ed25519 AAAAC3Nz");
  }

  #[test]
  fn parses_compose_ps_array() {
    let json = r#"[{"Name":"demo-web-1","Image":"nginx","State":"running","Publishers":[{"PublishedPort":8080}]}]"#;
    let containers = parse_compose_ps(json);
    assert_eq!(containers.len(), 1);
    assert_eq!(containers[0].name, "demo-web-1");
    assert_eq!(containers[0].ports, vec!["8080".to_string()]);
  }
}
