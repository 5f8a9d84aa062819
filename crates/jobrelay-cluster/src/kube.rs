use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::{json, Value};

use jobrelay_types::{ExecutionUnit, RunSnapshot, RunTemplate};

use crate::credentials::{KubeAuth, KubeCredentials};
use crate::error::truncate_for_error;
use crate::log_line::{parse_log_line, LineBuffer};
use crate::status::{job_list, job_snapshot, pod_list};
use crate::{ClusterError, ClusterGateway, DeletePropagation, OutputOptions, OutputStream};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Selector label the Job controller puts on every pod of a Job.
const RUN_SELECTOR_LABEL: &str = "job-name";

/// [`ClusterGateway`] over the Kubernetes REST API.
#[derive(Clone)]
pub struct KubeGateway {
    client: Client,
    server: String,
    namespace: String,
    auth: KubeAuth,
}

impl KubeGateway {
    pub fn new(
        credentials: KubeCredentials,
        namespace: impl Into<String>,
    ) -> Result<Self, ClusterError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .danger_accept_invalid_certs(credentials.insecure_skip_tls_verify);
        if let Some(ca) = credentials.ca_pem.as_deref() {
            let cert = reqwest::Certificate::from_pem(ca)
                .map_err(|e| ClusterError::Config(format!("invalid cluster CA: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let KubeAuth::ClientCert { cert_pem, key_pem } = &credentials.auth {
            let mut pem = cert_pem.clone();
            pem.push(b'\n');
            pem.extend_from_slice(key_pem);
            let identity = reqwest::Identity::from_pem(&pem)
                .map_err(|e| ClusterError::Config(format!("invalid client certificate: {e}")))?;
            builder = builder.identity(identity);
        }
        let client = builder.build()?;
        Ok(Self {
            client,
            server: credentials.server.trim_end_matches('/').to_string(),
            namespace: namespace.into(),
            auth: credentials.auth,
        })
    }

    fn jobs_url(&self) -> String {
        format!(
            "{}/apis/batch/v1/namespaces/{}/jobs",
            self.server, self.namespace
        )
    }

    fn job_url(&self, name: &str) -> String {
        format!("{}/{}", self.jobs_url(), name)
    }

    fn pods_url(&self) -> String {
        format!("{}/api/v1/namespaces/{}/pods", self.server, self.namespace)
    }

    async fn request(&self, method: Method, url: String) -> Result<RequestBuilder, ClusterError> {
        let req = self.client.request(method, url);
        let req = match &self.auth {
            KubeAuth::None | KubeAuth::ClientCert { .. } => req,
            KubeAuth::Bearer(token) => req.bearer_auth(token),
            KubeAuth::TokenFile(path) => {
                let token = tokio::fs::read_to_string(path).await.map_err(|e| {
                    ClusterError::Config(format!("cannot read token {}: {e}", path.display()))
                })?;
                req.bearer_auth(token.trim())
            }
            KubeAuth::Basic { username, password } => req.basic_auth(username, Some(password)),
        };
        Ok(req)
    }

    async fn send(&self, req: RequestBuilder) -> Result<Response, ClusterError> {
        let resp = req.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(ClusterError::from_response(status, &body))
    }

    async fn get_json(&self, req: RequestBuilder) -> Result<Value, ClusterError> {
        let resp = self.send(req.timeout(REQUEST_TIMEOUT)).await?;
        Ok(resp.json::<Value>().await?)
    }
}

#[async_trait]
impl ClusterGateway for KubeGateway {
    fn namespace(&self) -> &str {
        &self.namespace
    }

    async fn load_template(&self, name: &str) -> Result<RunTemplate, ClusterError> {
        let url = format!(
            "{}/apis/batch/v1/namespaces/{}/cronjobs/{}",
            self.server, self.namespace, name
        );
        let cronjob = self.get_json(self.request(Method::GET, url).await?).await?;
        let job_template = cronjob
            .pointer("/spec/jobTemplate")
            .cloned()
            .unwrap_or(Value::Null);
        let Some(job_spec) = job_template.get("spec").filter(|s| s.is_object()).cloned() else {
            return Err(ClusterError::InvalidResponse(format!(
                "CronJob {name} has no job template spec; cannot create runs from it"
            )));
        };
        let mut template = RunTemplate::new(name, self.namespace.clone(), job_spec);
        if let Some(labels) = job_template
            .pointer("/metadata/labels")
            .and_then(Value::as_object)
        {
            for (key, value) in labels {
                if let Some(value) = value.as_str() {
                    template.labels.insert(key.clone(), value.to_string());
                }
            }
        }
        Ok(template)
    }

    async fn create_run(
        &self,
        template: &RunTemplate,
        run_id: &str,
    ) -> Result<String, ClusterError> {
        let manifest = template.manifest_for(run_id);
        let req = self
            .request(Method::POST, self.jobs_url())
            .await?
            .json(&manifest);
        let created = self.get_json(req).await?;
        let name = created
            .pointer("/metadata/name")
            .and_then(Value::as_str)
            .unwrap_or(run_id)
            .to_string();
        tracing::debug!(run_id = %name, "run created");
        Ok(name)
    }

    async fn get_run(&self, run_id: &str) -> Result<RunSnapshot, ClusterError> {
        let job = self
            .get_json(self.request(Method::GET, self.job_url(run_id)).await?)
            .await?;
        job_snapshot(job)
    }

    async fn list_runs(&self, prefix: &str) -> Result<Vec<RunSnapshot>, ClusterError> {
        let list = self
            .get_json(self.request(Method::GET, self.jobs_url()).await?)
            .await?;
        Ok(job_list(list)?
            .into_iter()
            .filter(|run| run.name.starts_with(prefix))
            .collect())
    }

    async fn delete_run(
        &self,
        run_id: &str,
        propagation: DeletePropagation,
    ) -> Result<(), ClusterError> {
        let body = json!({
            "kind": "DeleteOptions",
            "apiVersion": "v1",
            "propagationPolicy": propagation.as_str(),
        });
        let req = self
            .request(Method::DELETE, self.job_url(run_id))
            .await?
            .timeout(REQUEST_TIMEOUT)
            .json(&body);
        match self.send(req).await {
            Ok(_) => Ok(()),
            Err(ClusterError::NotFound(_)) => {
                tracing::debug!(run_id, "delete of absent run treated as success");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn list_execution_units(
        &self,
        run_id: &str,
    ) -> Result<Vec<ExecutionUnit>, ClusterError> {
        let selector = format!("{RUN_SELECTOR_LABEL}={run_id}");
        let req = self
            .request(Method::GET, self.pods_url())
            .await?
            .query(&[("labelSelector", selector)]);
        pod_list(self.get_json(req).await?)
    }

    async fn stream_output(
        &self,
        unit: &str,
        options: OutputOptions,
    ) -> Result<OutputStream, ClusterError> {
        let url = format!("{}/{}/log", self.pods_url(), unit);
        let mut query: Vec<(&str, String)> = vec![
            ("follow", options.follow.to_string()),
            ("timestamps", options.timestamps.to_string()),
        ];
        if let Some(tail) = options.tail_lines {
            query.push(("tailLines", tail.to_string()));
        }
        if let Some(since) = options.since_time {
            query.push((
                "sinceTime",
                since.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            ));
        }
        let req = self.request(Method::GET, url).await?.query(&query);
        let resp = self.send(req).await?;
        let timestamps = options.timestamps;
        let mut body = resp.bytes_stream();
        let stream = try_stream! {
            let mut lines = LineBuffer::new();
            while let Some(chunk) = body.next().await {
                let chunk = chunk.map_err(ClusterError::from)?;
                for line in lines.push(&chunk) {
                    yield parse_log_line(&line, timestamps);
                }
            }
            if let Some(rest) = lines.finish() {
                yield parse_log_line(&rest, timestamps);
            }
        };
        Ok(Box::pin(stream))
    }

    async fn read_output(
        &self,
        unit: &str,
        tail_lines: Option<i64>,
    ) -> Result<String, ClusterError> {
        let url = format!("{}/{}/log", self.pods_url(), unit);
        let mut query: Vec<(&str, String)> = vec![("timestamps", "true".to_string())];
        if let Some(tail) = tail_lines {
            query.push(("tailLines", tail.to_string()));
        }
        let req = self
            .request(Method::GET, url)
            .await?
            .timeout(REQUEST_TIMEOUT)
            .query(&query);
        let resp = self.send(req).await?;
        let text = resp.text().await?;
        tracing::debug!(
            unit,
            bytes = text.len(),
            preview = %truncate_for_error(&text, 80),
            "read unit output"
        );
        Ok(text)
    }
}
