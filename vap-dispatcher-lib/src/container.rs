//! Sandbox container lifecycle.
//!
//! Containers are driven through the `docker` CLI. Every sandbox runs with
//! a read-only root, all capabilities dropped, `no-new-privileges`, tmpfs
//! for `/tmp` and the agent cache, memory/CPU caps, auto-remove on exit,
//! and a loopback-only port mapping. The sandbox reaches upstream providers exclusively through
//! the credential proxy on the host: its bearer token is registered at the
//! proxy before the container is probed, and revoked before the runtime
//! stop on destroy.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::process::Command;

use vap_proxy_api::TokenRegistry;
use vap_runtime::{DispatcherConfig, DispatcherError, Identity, PortPool};

const HEALTH_PROBE_INTERVAL: Duration = Duration::from_secs(2);
const HEALTH_PROBE_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
pub const HEALTH_TIMEOUT: Duration = Duration::from_secs(30);
const SANDBOX_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const SANDBOX_HTTP_PORT: u16 = 8080;

/// Result of a successful container start.
#[derive(Debug, Clone)]
pub struct StartedContainer {
    pub port: u16,
    pub container_id: String,
    pub token: String,
}

/// Per-container metadata needed later in the lifecycle.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub job_id: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
}

struct ContainerHandle {
    job_id: String,
    container_name: String,
    container_id: String,
    token: String,
    started: Instant,
    created_at: DateTime<Utc>,
}

pub struct ContainerManager {
    config: Arc<DispatcherConfig>,
    registry: Arc<TokenRegistry>,
    ports: Mutex<PortPool>,
    containers: Mutex<HashMap<u16, ContainerHandle>>,
    http: reqwest::Client,
    mock_runtime: bool,
}

impl ContainerManager {
    pub fn new(config: Arc<DispatcherConfig>, registry: Arc<TokenRegistry>) -> Self {
        let ports = PortPool::new(
            config.port_range_start,
            config.port_range_end,
            config.port_cooldown,
        );
        Self {
            config,
            registry,
            ports: Mutex::new(ports),
            containers: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
            mock_runtime: false,
        }
    }

    /// Test constructor: skips the docker CLI and health probing, but keeps
    /// ports, tokens, config trees, and registry wiring fully live.
    pub fn with_mock_runtime(config: Arc<DispatcherConfig>, registry: Arc<TokenRegistry>) -> Self {
        Self { mock_runtime: true, ..Self::new(config, registry) }
    }

    /// Allocate a port, register a fresh bearer token at the proxy, write
    /// the per-job config tree, and launch the container. Returns
    /// `Ok(None)` when every port is in use or cooling down — the caller
    /// queues the job.
    pub async fn start(
        &self,
        job_id: &str,
        identity: &Identity,
    ) -> Result<Option<StartedContainer>, DispatcherError> {
        let Some(port) = self.lock_ports().allocate() else {
            return Ok(None);
        };

        let token = TokenRegistry::generate_token();
        let container_name = container_name(job_id, port);

        if let Err(e) = self.write_sandbox_config(job_id, identity, &token) {
            self.lock_ports().release(port);
            return Err(e.into());
        }

        // The proxy must know the token before anything probes the sandbox.
        self.registry.register(&token, job_id);

        let spawned = self.spawn_container(job_id, &container_name, port, &token).await;
        let container_id = match spawned {
            Ok(id) => id,
            Err(e) => {
                self.registry.revoke(&token);
                let _ = std::fs::remove_dir_all(self.sandbox_config_dir(job_id));
                self.lock_ports().release(port);
                return Err(e);
            }
        };

        tracing::info!(job_id, port, container_id = %container_id, "sandbox container started");
        self.lock_containers().insert(
            port,
            ContainerHandle {
                job_id: job_id.to_string(),
                container_name,
                container_id: container_id.clone(),
                token: token.clone(),
                started: Instant::now(),
                created_at: Utc::now(),
            },
        );

        Ok(Some(StartedContainer { port, container_id, token }))
    }

    /// Probe the sandbox until it answers an authenticated trivial chat
    /// completion with 2xx, or the deadline passes.
    pub async fn wait_for_health(&self, port: u16, timeout: Duration) -> bool {
        if self.mock_runtime {
            return true;
        }
        let deadline = Instant::now() + timeout;
        loop {
            if self.probe(port).await {
                return true;
            }
            if Instant::now() + HEALTH_PROBE_INTERVAL > deadline {
                return false;
            }
            tokio::time::sleep(HEALTH_PROBE_INTERVAL).await;
        }
    }

    async fn probe(&self, port: u16) -> bool {
        let Some(token) = self.token_for(port) else {
            return false;
        };
        let body = json!({
            "model": self.config.sandbox_model,
            "messages": [{"role": "user", "content": "ping"}],
            "max_tokens": 1,
        });
        self.http
            .post(completions_url(port))
            .bearer_auth(token)
            .json(&body)
            .timeout(HEALTH_PROBE_ATTEMPT_TIMEOUT)
            .send()
            .await
            .map(|resp| resp.status().is_success())
            .unwrap_or(false)
    }

    /// One buyer turn into the sandbox: bearer-authenticated chat
    /// completion, first choice's message content out.
    pub async fn send_request(&self, port: u16, message: &str) -> Result<String, DispatcherError> {
        let token = self
            .token_for(port)
            .ok_or_else(|| DispatcherError::Container(format!("no container on port {port}")))?;
        let body = json!({
            "model": self.config.sandbox_model,
            "messages": [{"role": "user", "content": message}],
        });
        let resp = self
            .http
            .post(completions_url(port))
            .bearer_auth(token)
            .json(&body)
            .timeout(SANDBOX_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| DispatcherError::Sandbox(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(DispatcherError::Sandbox(format!("sandbox returned HTTP {status}")));
        }
        let value: Value =
            resp.json().await.map_err(|e| DispatcherError::Sandbox(e.to_string()))?;
        value["choices"][0]["message"]["content"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                DispatcherError::Sandbox("completion reply carried no message content".into())
            })
    }

    /// Stop and remove the container behind `port`. The bearer token is
    /// revoked at the proxy first, the generated config tree is wiped, and
    /// the port enters cooldown.
    pub async fn destroy(&self, port: u16) {
        let Some(handle) = self.lock_containers().remove(&port) else {
            return;
        };
        self.registry.revoke(&handle.token);

        if !self.mock_runtime {
            if let Err(e) = run_docker(&["stop", "--time", "10", &handle.container_name]).await {
                tracing::warn!(port, error = %e, "docker stop failed");
            }
            if let Err(e) = run_docker(&["rm", "-f", &handle.container_name]).await {
                tracing::debug!(port, error = %e, "docker rm failed");
            }
        }

        let config_dir = self.sandbox_config_dir(&handle.job_id);
        if config_dir.exists() {
            if let Err(e) = std::fs::remove_dir_all(&config_dir) {
                tracing::warn!(job_id = %handle.job_id, error = %e, "failed wiping sandbox config tree");
            }
        }

        self.lock_ports().release(port);
        tracing::info!(job_id = %handle.job_id, port, "sandbox container destroyed");
    }

    /// Invoke `cb(job_id, port)` for every container past the configured
    /// maximum lifetime. The caller maps each hit to a retirement.
    pub fn enforce_lifetimes(&self, mut cb: impl FnMut(&str, u16)) {
        let max = self.config.container_max_lifetime;
        let expired: Vec<(String, u16)> = self
            .lock_containers()
            .iter()
            .filter(|(_, handle)| handle.started.elapsed() >= max)
            .map(|(port, handle)| (handle.job_id.clone(), *port))
            .collect();
        for (job_id, port) in expired {
            cb(&job_id, port);
        }
    }

    pub fn token_for(&self, port: u16) -> Option<String> {
        self.lock_containers().get(&port).map(|h| h.token.clone())
    }

    pub fn info_for(&self, port: u16) -> Option<ContainerInfo> {
        self.lock_containers().get(&port).map(|h| ContainerInfo {
            job_id: h.job_id.clone(),
            container_id: h.container_id.clone(),
            created_at: h.created_at,
        })
    }

    pub fn active_count(&self) -> usize {
        self.lock_containers().len()
    }

    pub fn active_ports(&self) -> Vec<u16> {
        self.lock_containers().keys().copied().collect()
    }

    /// Mount paths visible from inside a sandbox, enumerated in deletion
    /// attestations.
    pub fn data_volumes(&self) -> Vec<String> {
        let mut volumes = vec!["/config".to_string(), "/tmp".to_string(), "/cache".to_string()];
        if self.config.wiki_path.is_some() {
            volumes.push("/wiki".to_string());
        }
        volumes
    }

    fn sandbox_config_dir(&self, job_id: &str) -> PathBuf {
        self.config.jobs_path.join(job_id).join("sandbox-config")
    }

    /// Generated client configuration pointing the sandbox at the
    /// credential proxy instead of any real provider.
    fn write_sandbox_config(
        &self,
        job_id: &str,
        identity: &Identity,
        token: &str,
    ) -> std::io::Result<()> {
        let dir = self.sandbox_config_dir(job_id);
        std::fs::create_dir_all(&dir)?;
        let client = json!({
            "baseUrl": format!("http://host.docker.internal:{}", self.config.proxy_port),
            "apiKey": token,
            "model": self.config.sandbox_model,
            "jobId": job_id,
            "identity": identity.identity_name(),
        });
        std::fs::write(dir.join("client.json"), serde_json::to_vec_pretty(&client)?)?;
        Ok(())
    }

    async fn spawn_container(
        &self,
        job_id: &str,
        container_name: &str,
        port: u16,
        token: &str,
    ) -> Result<String, DispatcherError> {
        if self.mock_runtime {
            return Ok(format!("mock-{}", uuid::Uuid::new_v4()));
        }
        // A crash before destroy() can leave a stopped container holding
        // this name; clear it so the fresh run cannot hit a name conflict.
        if let Err(e) = run_docker(&["rm", "-f", container_name]).await {
            tracing::debug!(container_name, error = %e, "no stale container to remove");
        }
        let args = docker_run_args(
            &self.config,
            container_name,
            port,
            &self.sandbox_config_dir(job_id),
            token,
        );
        let refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_docker(&refs).await
    }

    fn lock_ports(&self) -> std::sync::MutexGuard<'_, PortPool> {
        match self.ports.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_containers(&self) -> std::sync::MutexGuard<'_, HashMap<u16, ContainerHandle>> {
        match self.containers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn completions_url(port: u16) -> String {
    format!("http://127.0.0.1:{port}/v1/chat/completions")
}

fn container_name(job_id: &str, port: u16) -> String {
    let safe: String = job_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    format!("vap-job-{safe}-{port}")
}

/// Full `docker run` argument list for one sandbox.
fn docker_run_args(
    config: &DispatcherConfig,
    container_name: &str,
    port: u16,
    config_dir: &std::path::Path,
    token: &str,
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "run".into(),
        "-d".into(),
        "--rm".into(),
        "--name".into(),
        container_name.into(),
        "--read-only".into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--tmpfs".into(),
        "/tmp:rw,size=256m".into(),
        "--tmpfs".into(),
        "/cache:rw,size=128m".into(),
        "--memory".into(),
        config.container_memory.clone(),
        "--cpus".into(),
        config.container_cpus.clone(),
        "--add-host".into(),
        "host.docker.internal:host-gateway".into(),
        "-p".into(),
        format!("127.0.0.1:{port}:{SANDBOX_HTTP_PORT}"),
        "-v".into(),
        format!("{}:/config:ro", config_dir.display()),
    ];
    if let Some(wiki) = &config.wiki_path {
        args.push("-v".into());
        args.push(format!("{}:/wiki:ro", wiki.display()));
    }
    args.push("-e".into());
    args.push(format!("VAP_PROXY_URL=http://host.docker.internal:{}", config.proxy_port));
    args.push("-e".into());
    args.push(format!("VAP_PROXY_TOKEN={token}"));
    args.push("-e".into());
    args.push(format!("VAP_MODEL={}", config.sandbox_model));
    args.push(config.sandbox_image.clone());
    args
}

/// Run a docker CLI command and return trimmed stdout on success.
async fn run_docker(args: &[&str]) -> Result<String, DispatcherError> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| DispatcherError::Container(format!("failed to exec docker: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(DispatcherError::Container(format!(
            "docker {} failed: {}",
            args.first().unwrap_or(&""),
            stderr.trim()
        )))
    }
}
