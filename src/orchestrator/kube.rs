//! Kubernetes API adapter over blocking REST calls.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tracing::{debug, warn};
use url::Url;

use super::{
    JobDefinition, Orchestrator, OrchestratorError, OrchestratorJob, OrchestratorStatus,
    ReportedResources, SubmissionReceipt, WORKLOAD_CONTAINER,
};
use crate::config::OrchestratorSettings;
use crate::http_client::{self, RetryPolicy};
use crate::jobs::{Driver, JobId};

const MAX_RESPONSE_BYTES: usize = 16 * 1024 * 1024;
const MAX_ERROR_BODY_BYTES: usize = 64 * 1024;

/// Orchestrator backed by the Kubernetes batch API.
pub struct KubeOrchestrator {
    base: Url,
    token: Option<String>,
    retry: RetryPolicy,
    agent: ureq::Agent,
}

impl KubeOrchestrator {
    /// Build a client from settings, reading the bearer token if configured.
    ///
    /// A configured token file that does not exist is logged and ignored, so
    /// the same config works in-cluster and through `kubectl proxy`.
    pub fn from_settings(settings: &OrchestratorSettings) -> Result<Self, OrchestratorError> {
        let token = match settings.token_path.as_deref() {
            Some(path) if !path.as_os_str().is_empty() => read_token(path)?,
            _ => None,
        };
        let mut client = Self::new(&settings.api_url, token)?;
        client.retry.attempts = settings.request_attempts.max(1);
        Ok(client)
    }

    pub fn new(api_url: &str, token: Option<String>) -> Result<Self, OrchestratorError> {
        let base = Url::parse(api_url)
            .map_err(|err| OrchestratorError::Config(format!("Invalid API URL '{api_url}': {err}")))?;
        if base.cannot_be_a_base() {
            return Err(OrchestratorError::Config(format!(
                "API URL '{api_url}' cannot be used as a base"
            )));
        }
        Ok(Self {
            base,
            token,
            retry: RetryPolicy::default(),
            agent: http_client::shared_agent().clone(),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn endpoint(&self, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, OrchestratorError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| OrchestratorError::Config("API URL cannot be used as a base".into()))?
            .pop_if_empty()
            .extend(segments);
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    fn jobs_path<'a>(namespace: &'a str) -> [&'a str; 6] {
        ["apis", "batch", "v1", "namespaces", namespace, "jobs"]
    }

    fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        url: &Url,
        body: Option<&Value>,
    ) -> Result<T, OrchestratorError> {
        let value = http_client::with_retries(
            self.retry,
            url.path(),
            || self.send_once(method, url, body),
            OrchestratorError::is_transient,
        )?;
        serde_json::from_value(value).map_err(|err| OrchestratorError::Decode(err.to_string()))
    }

    fn send_once(
        &self,
        method: &str,
        url: &Url,
        body: Option<&Value>,
    ) -> Result<Value, OrchestratorError> {
        debug!(%method, url = %url, "Kubernetes API request");
        let mut request = self
            .agent
            .request(method, url.as_str())
            .set("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.set("Authorization", &format!("Bearer {token}"));
        }
        let result = match body {
            Some(body) => request.send_json(body),
            None => request.call(),
        };
        match result {
            Ok(response) => {
                let bytes = http_client::read_bounded(response, MAX_RESPONSE_BYTES)
                    .map_err(|err| OrchestratorError::Connection(err.to_string()))?;
                serde_json::from_slice(&bytes).map_err(|err| OrchestratorError::Decode(err.to_string()))
            }
            Err(ureq::Error::Status(status, response)) => Err(status_error(status, response)),
            Err(ureq::Error::Transport(transport)) => {
                Err(OrchestratorError::Connection(transport.to_string()))
            }
        }
    }

    fn pod_names(&self, job_name: &str, namespace: &str) -> Result<Vec<String>, OrchestratorError> {
        let selector = format!("job-name={job_name}");
        let url = self.endpoint(
            &["api", "v1", "namespaces", namespace, "pods"],
            &[("labelSelector", selector.as_str())],
        )?;
        let pods: ObjectList<Pod> = self.request("GET", &url, None)?;
        Ok(pods.items.into_iter().map(|pod| pod.metadata.name).collect())
    }
}

impl Orchestrator for KubeOrchestrator {
    fn ping(&self) -> Result<(), OrchestratorError> {
        let url = self.endpoint(&["version"], &[])?;
        let _: Value = self.request("GET", &url, None)?;
        Ok(())
    }

    fn submit(&self, definition: &JobDefinition) -> Result<SubmissionReceipt, OrchestratorError> {
        let url = self.endpoint(&Self::jobs_path(&definition.namespace), &[])?;
        let created: KubeJob = self.request("POST", &url, Some(&definition.manifest()))?;
        Ok(SubmissionReceipt {
            name: created.metadata.name,
            uid: created.metadata.uid,
        })
    }

    fn list(
        &self,
        filter: Option<&JobId>,
        namespace: &str,
    ) -> Result<Vec<OrchestratorJob>, OrchestratorError> {
        let selector = filter.map(|job_id| format!("metadata.name={job_id}"));
        let query: Vec<(&str, &str)> = selector
            .as_deref()
            .map(|selector| vec![("fieldSelector", selector)])
            .unwrap_or_default();
        let url = self.endpoint(&Self::jobs_path(namespace), &query)?;
        let jobs: ObjectList<KubeJob> = self.request("GET", &url, None)?;
        let mut listed = Vec::with_capacity(jobs.items.len());
        for job in jobs.items {
            let pod_names = match self.pod_names(&job.metadata.name, namespace) {
                Ok(names) => names,
                Err(err) => {
                    warn!(job = %job.metadata.name, error = %err, "Failed to list job pods");
                    Vec::new()
                }
            };
            listed.push(job.into_orchestrator_job(pod_names));
        }
        Ok(listed)
    }

    fn terminate(&self, job_id: &JobId, namespace: &str) -> Result<(), OrchestratorError> {
        let mut segments = Self::jobs_path(namespace).to_vec();
        segments.push(job_id.as_str());
        let url = self.endpoint(&segments, &[])?;
        let options = json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": "Background",
        });
        let _: Value = self.request("DELETE", &url, Some(&options))?;
        Ok(())
    }
}

fn read_token(path: &Path) -> Result<Option<String>, OrchestratorError> {
    match std::fs::read_to_string(path) {
        Ok(token) => {
            let token = token.trim();
            Ok((!token.is_empty()).then(|| token.to_string()))
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            warn!(path = %path.display(), "Token file not found; sending unauthenticated requests");
            Ok(None)
        }
        Err(err) => Err(OrchestratorError::Config(format!(
            "Failed to read token {}: {err}",
            path.display()
        ))),
    }
}

fn status_error(status: u16, response: ureq::Response) -> OrchestratorError {
    let message = http_client::read_bounded(response, MAX_ERROR_BODY_BYTES)
        .ok()
        .and_then(|bytes| serde_json::from_slice::<ApiStatus>(&bytes).ok())
        .and_then(|body| body.message)
        .unwrap_or_else(|| format!("HTTP {status}"));
    if status == 404 {
        OrchestratorError::NotFound(message)
    } else {
        OrchestratorError::Rejected { status, message }
    }
}

/// Complete iff the job reports conditions and every one is `Complete`.
fn job_status(conditions: &[JobCondition]) -> OrchestratorStatus {
    if !conditions.is_empty() && conditions.iter().all(|condition| condition.kind == "Complete") {
        OrchestratorStatus::Complete
    } else {
        OrchestratorStatus::Incomplete
    }
}

#[derive(Debug, Deserialize)]
struct ApiStatus {
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
    #[serde(default)]
    uid: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Pod {
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct KubeJob {
    metadata: ObjectMeta,
    #[serde(default)]
    spec: Option<JobSpec>,
    #[serde(default)]
    status: Option<KubeJobStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JobSpec {
    #[serde(default)]
    active_deadline_seconds: Option<u64>,
    #[serde(default)]
    template: Option<PodTemplate>,
}

#[derive(Debug, Deserialize)]
struct PodTemplate {
    #[serde(default)]
    spec: Option<PodSpec>,
}

#[derive(Debug, Deserialize)]
struct PodSpec {
    #[serde(default)]
    containers: Vec<Container>,
}

#[derive(Debug, Deserialize)]
struct Container {
    #[serde(default)]
    name: String,
    #[serde(default)]
    env: Vec<EnvVar>,
    #[serde(default)]
    resources: Option<ContainerResources>,
}

#[derive(Debug, Deserialize)]
struct EnvVar {
    name: String,
    #[serde(default)]
    value: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContainerResources {
    #[serde(default)]
    requests: HashMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct KubeJobStatus {
    #[serde(default)]
    conditions: Vec<JobCondition>,
    #[serde(default)]
    active: Option<u32>,
    #[serde(default)]
    start_time: Option<String>,
}

#[derive(Debug, Deserialize)]
struct JobCondition {
    #[serde(rename = "type")]
    kind: String,
}

impl KubeJob {
    fn into_orchestrator_job(self, pod_names: Vec<String>) -> OrchestratorJob {
        let status = self.status.unwrap_or_default();
        let spec = self.spec;
        let deadline_secs = spec.as_ref().and_then(|spec| spec.active_deadline_seconds);
        let container = spec
            .and_then(|spec| spec.template)
            .and_then(|template| template.spec)
            .and_then(|pod| {
                let mut containers = pod.containers;
                let index = containers
                    .iter()
                    .position(|container| container.name == WORKLOAD_CONTAINER)
                    .unwrap_or(0);
                (index < containers.len()).then(|| containers.swap_remove(index))
            });
        let (driver, cpu, memory) = match container {
            Some(container) => {
                let driver = container
                    .env
                    .iter()
                    .find(|var| var.name == "DRIVER")
                    .and_then(|var| var.value.as_deref())
                    .and_then(|value| value.parse::<Driver>().ok());
                let mut requests = container.resources.map(|res| res.requests).unwrap_or_default();
                (driver, requests.remove("cpu"), requests.remove("memory"))
            }
            None => (None, None, None),
        };
        OrchestratorJob {
            name: self.metadata.name,
            status: job_status(&status.conditions),
            driver,
            resources: ReportedResources {
                cpu,
                memory,
                deadline_secs,
            },
            pod_names,
            active_pods: status.active.unwrap_or(0),
            start_time: status.start_time,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::tests::definition;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Serve canned responses in order, reporting each request line.
    fn serve(responses: Vec<(u16, String)>) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (sender, receiver) = mpsc::channel();
        thread::spawn(move || {
            for (status, body) in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut request_line = String::new();
                reader.read_line(&mut request_line).unwrap();
                let mut content_length = 0usize;
                loop {
                    let mut header = String::new();
                    reader.read_line(&mut header).unwrap();
                    if header == "\r\n" || header.is_empty() {
                        break;
                    }
                    if let Some(value) = header.to_ascii_lowercase().strip_prefix("content-length:") {
                        content_length = value.trim().parse().unwrap_or(0);
                    }
                }
                let mut body_in = vec![0u8; content_length];
                reader.read_exact(&mut body_in).unwrap();
                let _ = sender.send(format!(
                    "{} {}",
                    request_line.trim(),
                    String::from_utf8_lossy(&body_in)
                ));
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}"), receiver)
    }

    fn client(base: &str) -> KubeOrchestrator {
        KubeOrchestrator::new(base, Some("secret".into()))
            .unwrap()
            .with_retry(RetryPolicy::immediate(2))
    }

    const JOB_LIST: &str = r#"{"items":[
        {"metadata":{"name":"done"},
         "spec":{"activeDeadlineSeconds":240,"template":{"spec":{"containers":[
            {"name":"lagopus-fuzzer","env":[{"name":"DRIVER","value":"libfuzzer"}],
             "resources":{"requests":{"cpu":"2","memory":"200Mi"}}}]}}},
         "status":{"conditions":[{"type":"Complete","status":"True"}],"startTime":"2020-01-01T00:00:00Z"}},
        {"metadata":{"name":"failed"},
         "status":{"conditions":[{"type":"Failed","status":"True"}],"active":0}},
        {"metadata":{"name":"running"},"status":{"active":1}}
    ]}"#;

    #[test]
    fn list_maps_conditions_driver_and_pods() {
        let pods = r#"{"items":[{"metadata":{"name":"done-abcde"}}]}"#;
        let (base, requests) = serve(vec![
            (200, JOB_LIST.to_string()),
            (200, pods.to_string()),
            (200, r#"{"items":[]}"#.to_string()),
            (200, r#"{"items":[]}"#.to_string()),
        ]);
        let jobs = client(&base).list(None, "fuzz").unwrap();
        assert_eq!(jobs.len(), 3);
        assert_eq!(jobs[0].status, OrchestratorStatus::Complete);
        assert_eq!(jobs[0].driver, Some(Driver::LibFuzzer));
        assert_eq!(jobs[0].resources.memory.as_deref(), Some("200Mi"));
        assert_eq!(jobs[0].resources.deadline_secs, Some(240));
        assert_eq!(jobs[0].pod_names, vec!["done-abcde"]);
        assert_eq!(jobs[1].status, OrchestratorStatus::Incomplete);
        assert_eq!(jobs[2].status, OrchestratorStatus::Incomplete);
        assert_eq!(jobs[2].active_pods, 1);
        assert_eq!(jobs[2].driver, None);

        let first = requests.recv().unwrap();
        assert!(first.starts_with("GET /apis/batch/v1/namespaces/fuzz/jobs "));
        let second = requests.recv().unwrap();
        assert!(second.starts_with("GET /api/v1/namespaces/fuzz/pods?labelSelector=job-name%3Ddone "));
    }

    #[test]
    fn filtered_list_uses_field_selector() {
        let (base, requests) = serve(vec![(200, r#"{"items":[]}"#.to_string())]);
        let jobs = client(&base)
            .list(Some(&JobId::from_string("x.afl.1")), "default")
            .unwrap();
        assert!(jobs.is_empty());
        let request = requests.recv().unwrap();
        assert!(request.contains("fieldSelector=metadata.name%3Dx.afl.1"));
    }

    #[test]
    fn submit_posts_manifest() {
        let (base, requests) = serve(vec![(
            201,
            r#"{"metadata":{"name":"png.afl.1","uid":"u-1"}}"#.to_string(),
        )]);
        let receipt = client(&base)
            .submit(&definition("png.afl.1", Driver::Afl))
            .unwrap();
        assert_eq!(receipt.name, "png.afl.1");
        assert_eq!(receipt.uid.as_deref(), Some("u-1"));
        let request = requests.recv().unwrap();
        assert!(request.starts_with("POST /apis/batch/v1/namespaces/fuzz/jobs "));
        assert!(request.contains("\"kind\":\"Job\""));
    }

    #[test]
    fn conflict_is_rejected_without_retry() {
        let (base, requests) = serve(vec![(
            409,
            r#"{"kind":"Status","message":"jobs.batch \"png\" already exists"}"#.to_string(),
        )]);
        let err = client(&base)
            .submit(&definition("png", Driver::Afl))
            .unwrap_err();
        assert_eq!(
            err,
            OrchestratorError::Rejected {
                status: 409,
                message: "jobs.batch \"png\" already exists".to_string()
            }
        );
        requests.recv().unwrap();
        assert!(requests.recv_timeout(Duration::from_millis(200)).is_err());
    }

    #[test]
    fn terminate_unknown_job_is_not_found() {
        let (base, requests) = serve(vec![(404, r#"{"message":"not found"}"#.to_string())]);
        let err = client(&base)
            .terminate(&JobId::from_string("gone"), "fuzz")
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NotFound(_)));
        let request = requests.recv().unwrap();
        assert!(request.starts_with("DELETE /apis/batch/v1/namespaces/fuzz/jobs/gone "));
        assert!(request.contains("Background"));
    }

    #[test]
    fn unreachable_api_is_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(&format!("http://{addr}")).ping().unwrap_err();
        assert!(matches!(err, OrchestratorError::Connection(_)));
    }

    #[test]
    fn status_requires_every_condition_complete() {
        let complete = JobCondition {
            kind: "Complete".into(),
        };
        let failed = JobCondition {
            kind: "Failed".into(),
        };
        assert_eq!(job_status(&[]), OrchestratorStatus::Incomplete);
        assert_eq!(
            job_status(std::slice::from_ref(&complete)),
            OrchestratorStatus::Complete
        );
        assert_eq!(job_status(&[complete, failed]), OrchestratorStatus::Incomplete);
    }
}
