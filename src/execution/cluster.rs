//! Kubernetes cluster backend.
//!
//! Each command becomes one `batch/v1` Job: a single container running
//! `sh -c <command>` on the configured image, with the shared data folder
//! mounted from the host at the same path. The backend talks to the API server
//! named in a kubeconfig file using bearer-token authentication.
//!
//! By default the backend polls the job until it succeeds or fails, so the
//! task only commits outputs the job has actually finished writing. With
//! `wait_for_completion: false` it returns as soon as the job is accepted.

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{ExecutionBackend, ExecutionError};
use crate::core::types::{ExecMode, TaskId};
use crate::events::{Event, EventBus};

const NAME_PREFIX: &str = "scipipe";
const SUFFIX_LEN: usize = 6;

/// Settings for running tasks on a cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Path to the kubeconfig file describing the API server.
    pub kubeconfig: PathBuf,
    /// Container image the command runs in.
    pub image: String,
    /// Host directory mounted at the same path inside the container.
    pub data_folder: String,
    /// Namespace for jobs. Falls back to the kubeconfig context, then `default`.
    #[serde(default)]
    pub namespace: Option<String>,
    /// How often to poll a submitted job.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Block until the job reaches a terminal state.
    #[serde(default = "default_true")]
    pub wait_for_completion: bool,
}

fn default_poll_interval_ms() -> u64 {
    2000
}

fn default_true() -> bool {
    true
}

impl ClusterConfig {
    /// Create settings with default namespace resolution and polling.
    pub fn new(
        kubeconfig: impl Into<PathBuf>,
        image: impl Into<String>,
        data_folder: impl Into<String>,
    ) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
            image: image.into(),
            data_folder: data_folder.into(),
            namespace: None,
            poll_interval_ms: default_poll_interval_ms(),
            wait_for_completion: true,
        }
    }
}

/// Names of the objects created for one task execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobNames {
    pub job: String,
    pub pod: String,
    pub container: String,
    pub volume: String,
}

impl JobNames {
    /// Derive names from the task name and a random suffix.
    pub fn new(task_id: &TaskId, suffix: &str) -> Self {
        let id = format!("{}-{}", dns_label(task_id.as_str()), suffix);
        Self {
            job: format!("{}-job-{}", NAME_PREFIX, id),
            pod: format!("{}-pod-{}", NAME_PREFIX, id),
            container: format!("{}-container-{}", NAME_PREFIX, id),
            volume: format!("{}-volume-{}", NAME_PREFIX, id),
        }
    }

    /// Names with a fresh random suffix.
    pub fn random(task_id: &TaskId) -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self::new(task_id, &uuid[..SUFFIX_LEN])
    }
}

/// Lowercase the name and replace characters Kubernetes rejects in object names.
fn dns_label(name: &str) -> String {
    let label: String = name
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() { c } else { '-' }
        })
        .collect();
    let label = label.trim_matches('-');
    if label.is_empty() {
        "task".to_string()
    } else {
        label.to_string()
    }
}

/// Build the Job object submitted for `command`.
pub fn job_manifest(names: &JobNames, command: &str, config: &ClusterConfig) -> Value {
    json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": { "name": names.job },
        "spec": {
            "template": {
                "metadata": { "name": names.pod },
                "spec": {
                    "containers": [{
                        "name": names.container,
                        "image": config.image,
                        "command": ["sh", "-c", command],
                        "securityContext": { "privileged": false },
                        "imagePullPolicy": "IfNotPresent",
                        "volumeMounts": [{
                            "name": names.volume,
                            "mountPath": config.data_folder,
                        }],
                    }],
                    "restartPolicy": "OnFailure",
                    "volumes": [{
                        "name": names.volume,
                        "hostPath": { "path": config.data_folder },
                    }],
                },
            },
        },
    })
}

/// Progress of a submitted job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Running,
    Succeeded,
    Failed(String),
}

impl JobState {
    /// Read the state from a Job object's `status`.
    pub fn from_status(status: &Value) -> Self {
        if status.get("succeeded").and_then(Value::as_i64).unwrap_or(0) > 0 {
            return JobState::Succeeded;
        }
        let failed = status
            .get("conditions")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .find(|c| c["type"] == "Failed" && c["status"] == "True");
        match failed {
            Some(cond) => JobState::Failed(
                cond.get("message")
                    .or_else(|| cond.get("reason"))
                    .and_then(Value::as_str)
                    .unwrap_or("job failed")
                    .to_string(),
            ),
            None => JobState::Running,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(rename = "current-context")]
    current_context: Option<String>,
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    contexts: Vec<NamedContext>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    name: String,
    cluster: ClusterEntry,
}

#[derive(Debug, Deserialize)]
struct ClusterEntry {
    server: String,
    #[serde(rename = "certificate-authority-data")]
    ca_data: Option<String>,
    #[serde(rename = "certificate-authority")]
    ca_file: Option<PathBuf>,
    #[serde(rename = "insecure-skip-tls-verify", default)]
    insecure: bool,
}

#[derive(Debug, Deserialize)]
struct NamedContext {
    name: String,
    context: ContextEntry,
}

#[derive(Debug, Deserialize)]
struct ContextEntry {
    cluster: String,
    user: Option<String>,
    namespace: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    name: String,
    user: UserEntry,
}

#[derive(Debug, Deserialize)]
struct UserEntry {
    token: Option<String>,
    #[serde(rename = "tokenFile")]
    token_file: Option<PathBuf>,
}

/// Connection details resolved from a kubeconfig.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ApiEndpoint {
    server: String,
    token: Option<String>,
    ca_pem: Option<Vec<u8>>,
    insecure: bool,
    namespace: Option<String>,
}

fn config_err(msg: impl Into<String>) -> ExecutionError {
    ExecutionError::Config(msg.into())
}

impl ApiEndpoint {
    /// Resolve the current context of a kubeconfig. Relative file references
    /// are taken relative to `base_dir`.
    fn from_kubeconfig(text: &str, base_dir: &Path) -> Result<Self, ExecutionError> {
        let kc: Kubeconfig = serde_yaml::from_str(text)
            .map_err(|e| config_err(format!("invalid kubeconfig: {}", e)))?;

        let context = match &kc.current_context {
            Some(name) => kc.contexts.iter().find(|c| &c.name == name),
            None if kc.contexts.len() == 1 => kc.contexts.first(),
            None => None,
        }
        .ok_or_else(|| config_err("kubeconfig has no usable current-context"))?;

        let cluster = kc
            .clusters
            .iter()
            .find(|c| c.name == context.context.cluster)
            .ok_or_else(|| {
                config_err(format!(
                    "kubeconfig context '{}' refers to unknown cluster '{}'",
                    context.name, context.context.cluster
                ))
            })?;

        let user = match &context.context.user {
            Some(name) => Some(
                kc.users
                    .iter()
                    .find(|u| &u.name == name)
                    .map(|u| &u.user)
                    .ok_or_else(|| {
                        config_err(format!("kubeconfig refers to unknown user '{}'", name))
                    })?,
            ),
            None => None,
        };

        let token = match user.map(|u| (&u.token, &u.token_file)) {
            Some((Some(token), _)) => Some(token.clone()),
            Some((None, Some(file))) => Some(
                std::fs::read_to_string(base_dir.join(file))
                    .map_err(|e| config_err(format!("cannot read token file: {}", e)))?
                    .trim()
                    .to_string(),
            ),
            _ => None,
        };

        let ca_pem = match (&cluster.cluster.ca_data, &cluster.cluster.ca_file) {
            (Some(data), _) => Some(
                base64::engine::general_purpose::STANDARD
                    .decode(data.trim())
                    .map_err(|e| config_err(format!("invalid certificate-authority-data: {}", e)))?,
            ),
            (None, Some(file)) => Some(
                std::fs::read(base_dir.join(file))
                    .map_err(|e| config_err(format!("cannot read certificate authority: {}", e)))?,
            ),
            (None, None) => None,
        };

        Ok(Self {
            server: cluster.cluster.server.trim_end_matches('/').to_string(),
            token,
            ca_pem,
            insecure: cluster.cluster.insecure,
            namespace: context.context.namespace.clone(),
        })
    }

    fn client(&self) -> Result<reqwest::Client, ExecutionError> {
        let mut builder = reqwest::Client::builder();
        if let Some(pem) = &self.ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| config_err(format!("invalid certificate authority: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        if self.insecure {
            builder = builder.danger_accept_invalid_certs(true);
        }
        builder
            .build()
            .map_err(|e| config_err(format!("cannot build cluster client: {}", e)))
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) if !token.is_empty() => req.bearer_auth(token),
            _ => req,
        }
    }
}

async fn check_status(resp: reqwest::Response, url: &str) -> Result<Value, ExecutionError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp.json().await?);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ExecutionError::ApiStatus {
        status: status.as_u16(),
        url: url.to_string(),
        body,
    })
}

/// Runs commands as Kubernetes jobs.
#[derive(Debug, Clone)]
pub struct ClusterBackend {
    config: ClusterConfig,
}

impl ClusterBackend {
    pub fn new(config: ClusterConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn endpoint(&self) -> Result<ApiEndpoint, ExecutionError> {
        let path = &self.config.kubeconfig;
        let text = tokio::fs::read_to_string(path).await.map_err(|e| {
            config_err(format!("cannot read kubeconfig '{}': {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        ApiEndpoint::from_kubeconfig(&text, base_dir)
    }

    async fn wait_for_job(
        &self,
        client: &reqwest::Client,
        endpoint: &ApiEndpoint,
        url: &str,
        job: &str,
    ) -> Result<(), ExecutionError> {
        let interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            let resp = endpoint.auth(client.get(url)).send().await?;
            let object = check_status(resp, url).await?;
            match JobState::from_status(&object["status"]) {
                JobState::Succeeded => return Ok(()),
                JobState::Failed(reason) => {
                    return Err(ExecutionError::JobFailed {
                        job: job.to_string(),
                        reason,
                    })
                }
                JobState::Running => tokio::time::sleep(interval).await,
            }
        }
    }
}

#[async_trait]
impl ExecutionBackend for ClusterBackend {
    fn mode(&self) -> ExecMode {
        ExecMode::Cluster
    }

    async fn run(
        &self,
        task_id: &TaskId,
        command: &str,
        events: &EventBus,
    ) -> Result<(), ExecutionError> {
        let endpoint = self.endpoint().await?;
        let client = endpoint.client()?;
        let namespace = self
            .config
            .namespace
            .clone()
            .or_else(|| endpoint.namespace.clone())
            .unwrap_or_else(|| "default".to_string());

        let names = JobNames::random(task_id);
        let manifest = job_manifest(&names, command, &self.config);
        let jobs_url = format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            endpoint.server, namespace
        );

        let resp = endpoint.auth(client.post(&jobs_url)).json(&manifest).send().await?;
        check_status(resp, &jobs_url).await?;
        events
            .emit(Event::cluster_job_submitted(task_id.clone(), &names.job))
            .await;

        if !self.config.wait_for_completion {
            return Ok(());
        }
        let job_url = format!("{}/{}", jobs_url, names.job);
        self.wait_for_job(&client, &endpoint, &job_url, &names.job)
            .await
    }
}
