//! Cluster endpoint and credential discovery.
//!
//! Resolution order: the in-cluster service account (when running inside a
//! pod), then the kubeconfig named by `KUBECONFIG` or `~/.kube/config`.

use std::path::{Path, PathBuf};

use base64::Engine as _;
use serde::Deserialize;

use crate::ClusterError;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

#[derive(Clone)]
pub enum KubeAuth {
    None,
    Bearer(String),
    /// Re-read on every request; projected service account tokens rotate.
    TokenFile(PathBuf),
    ClientCert {
        cert_pem: Vec<u8>,
        key_pem: Vec<u8>,
    },
    Basic {
        username: String,
        password: String,
    },
}

impl std::fmt::Debug for KubeAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self {
            KubeAuth::None => "none",
            KubeAuth::Bearer(_) => "bearer",
            KubeAuth::TokenFile(_) => "token_file",
            KubeAuth::ClientCert { .. } => "client_cert",
            KubeAuth::Basic { .. } => "basic",
        };
        f.write_str(kind)
    }
}

#[derive(Debug, Clone)]
pub struct KubeCredentials {
    pub server: String,
    pub ca_pem: Option<Vec<u8>>,
    pub auth: KubeAuth,
    pub insecure_skip_tls_verify: bool,
    /// Namespace of the selected context, if it names one.
    pub default_namespace: Option<String>,
}

impl KubeCredentials {
    pub fn discover() -> Result<Self, ClusterError> {
        if let Some(creds) = Self::in_cluster()? {
            tracing::info!(server = %creds.server, "using in-cluster service account");
            return Ok(creds);
        }
        let path = kubeconfig_path().ok_or_else(|| {
            ClusterError::Config(
                "not running in a cluster and no kubeconfig found (set KUBECONFIG)".to_string(),
            )
        })?;
        let creds = Self::from_kubeconfig_file(&path)?;
        tracing::info!(
            server = %creds.server,
            kubeconfig = %path.display(),
            "using kubeconfig credentials"
        );
        Ok(creds)
    }

    /// `Ok(None)` when the process is not running inside a pod.
    pub fn in_cluster() -> Result<Option<Self>, ClusterError> {
        let Ok(host) = std::env::var("KUBERNETES_SERVICE_HOST") else {
            return Ok(None);
        };
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());
        let dir = Path::new(SERVICE_ACCOUNT_DIR);
        let token_path = dir.join("token");
        if !token_path.exists() {
            return Ok(None);
        }
        let ca_pem = std::fs::read(dir.join("ca.crt")).ok();
        let default_namespace = std::fs::read_to_string(dir.join("namespace"))
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host
        };
        Ok(Some(Self {
            server: format!("https://{host}:{port}"),
            ca_pem,
            auth: KubeAuth::TokenFile(token_path),
            insecure_skip_tls_verify: false,
            default_namespace,
        }))
    }

    pub fn from_kubeconfig_file(path: &Path) -> Result<Self, ClusterError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            ClusterError::Config(format!("cannot read kubeconfig {}: {e}", path.display()))
        })?;
        let base = path.parent().map(Path::to_path_buf).unwrap_or_default();
        Self::from_kubeconfig_str(&raw, &base)
    }

    /// Parses a kubeconfig using its `current-context`. Relative file
    /// references resolve against `base_dir`.
    pub fn from_kubeconfig_str(raw: &str, base_dir: &Path) -> Result<Self, ClusterError> {
        let config: KubeConfig = serde_yaml::from_str(raw)
            .map_err(|e| ClusterError::Config(format!("invalid kubeconfig: {e}")))?;
        let context_name = config
            .current_context
            .as_deref()
            .filter(|c| !c.is_empty())
            .ok_or_else(|| ClusterError::Config("kubeconfig has no current-context".into()))?;
        let context = config
            .contexts
            .iter()
            .find(|c| c.name == context_name)
            .map(|c| &c.context)
            .ok_or_else(|| ClusterError::Config(format!("context `{context_name}` not found")))?;
        let cluster = config
            .clusters
            .iter()
            .find(|c| c.name == context.cluster)
            .map(|c| &c.cluster)
            .ok_or_else(|| {
                ClusterError::Config(format!("cluster `{}` not found", context.cluster))
            })?;
        let user = match context.user.as_deref() {
            Some(name) => config
                .users
                .iter()
                .find(|u| u.name == name)
                .map(|u| u.user.clone())
                .ok_or_else(|| ClusterError::Config(format!("user `{name}` not found")))?,
            None => KubeUser::default(),
        };

        let ca_pem = load_data_or_file(
            cluster.certificate_authority_data.as_deref(),
            cluster.certificate_authority.as_deref(),
            base_dir,
        )?;

        Ok(Self {
            server: cluster.server.trim_end_matches('/').to_string(),
            ca_pem,
            auth: user.into_auth(base_dir)?,
            insecure_skip_tls_verify: cluster.insecure_skip_tls_verify,
            default_namespace: context.namespace.clone(),
        })
    }
}

fn kubeconfig_path() -> Option<PathBuf> {
    if let Ok(raw) = std::env::var("KUBECONFIG") {
        // KUBECONFIG may hold a path list; the first existing entry wins.
        let sep = if cfg!(windows) { ';' } else { ':' };
        if let Some(found) = raw
            .split(sep)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(PathBuf::from)
            .find(|p| p.exists())
        {
            return Some(found);
        }
    }
    let default = dirs::home_dir()?.join(".kube").join("config");
    default.exists().then_some(default)
}

fn load_data_or_file(
    data: Option<&str>,
    file: Option<&str>,
    base_dir: &Path,
) -> Result<Option<Vec<u8>>, ClusterError> {
    if let Some(data) = data.filter(|d| !d.trim().is_empty()) {
        let decoded = base64::engine::general_purpose::STANDARD
            .decode(data.trim())
            .map_err(|e| ClusterError::Config(format!("invalid base64 certificate data: {e}")))?;
        return Ok(Some(decoded));
    }
    if let Some(file) = file.filter(|f| !f.trim().is_empty()) {
        let path = base_dir.join(file);
        let bytes = std::fs::read(&path)
            .map_err(|e| ClusterError::Config(format!("cannot read {}: {e}", path.display())))?;
        return Ok(Some(bytes));
    }
    Ok(None)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeConfig {
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
#[serde(rename_all = "kebab-case")]
struct ClusterEntry {
    server: String,
    certificate_authority: Option<String>,
    certificate_authority_data: Option<String>,
    #[serde(default)]
    insecure_skip_tls_verify: bool,
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
    #[serde(default)]
    user: KubeUser,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeUser {
    token: Option<String>,
    token_file: Option<String>,
    client_certificate: Option<String>,
    client_certificate_data: Option<String>,
    client_key: Option<String>,
    client_key_data: Option<String>,
    username: Option<String>,
    password: Option<String>,
    exec: Option<serde_yaml::Value>,
    auth_provider: Option<serde_yaml::Value>,
}

impl KubeUser {
    fn into_auth(self, base_dir: &Path) -> Result<KubeAuth, ClusterError> {
        if let Some(token) = self.token.filter(|t| !t.trim().is_empty()) {
            return Ok(KubeAuth::Bearer(token.trim().to_string()));
        }
        if let Some(file) = self.token_file.filter(|t| !t.trim().is_empty()) {
            return Ok(KubeAuth::TokenFile(base_dir.join(file)));
        }
        let cert = load_data_or_file(
            self.client_certificate_data.as_deref(),
            self.client_certificate.as_deref(),
            base_dir,
        )?;
        let key = load_data_or_file(
            self.client_key_data.as_deref(),
            self.client_key.as_deref(),
            base_dir,
        )?;
        if let (Some(cert_pem), Some(key_pem)) = (cert, key) {
            return Ok(KubeAuth::ClientCert { cert_pem, key_pem });
        }
        if let (Some(username), Some(password)) = (self.username, self.password) {
            return Ok(KubeAuth::Basic { username, password });
        }
        if self.exec.is_some() || self.auth_provider.is_some() {
            return Err(ClusterError::Config(
                "exec and auth-provider credential plugins are not supported; use a token or client certificate".to_string(),
            ));
        }
        Ok(KubeAuth::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
current-context: qa
clusters:
  - name: qa-cluster
    cluster:
      server: https://10.0.0.1:6443/
      certificate-authority-data: LS0tLS1CRUdJTiBDRVJUSUZJQ0FURS0tLS0t
contexts:
  - name: qa
    context:
      cluster: qa-cluster
      user: qa-user
      namespace: ddbmetadata-qa
users:
  - name: qa-user
    user:
      token: abc123
"#;

    #[test]
    fn resolves_current_context() {
        let creds = KubeCredentials::from_kubeconfig_str(KUBECONFIG, Path::new("/tmp"))
            .expect("credentials");
        assert_eq!(creds.server, "https://10.0.0.1:6443");
        assert_eq!(creds.default_namespace.as_deref(), Some("ddbmetadata-qa"));
        assert_eq!(
            creds.ca_pem.as_deref(),
            Some("-----BEGIN CERTIFICATE-----".as_bytes())
        );
        assert!(matches!(creds.auth, KubeAuth::Bearer(ref t) if t == "abc123"));
    }

    #[test]
    fn token_file_is_relative_to_kubeconfig() {
        let raw = KUBECONFIG.replace("token: abc123", "token-file: secrets/token");
        let creds =
            KubeCredentials::from_kubeconfig_str(&raw, Path::new("/etc/kube")).expect("creds");
        match creds.auth {
            KubeAuth::TokenFile(path) => assert_eq!(path, Path::new("/etc/kube/secrets/token")),
            other => panic!("unexpected auth {other:?}"),
        }
    }

    #[test]
    fn exec_plugins_are_rejected() {
        let raw = KUBECONFIG.replace(
            "token: abc123",
            "exec:\n        command: aws\n        apiVersion: client.authentication.k8s.io/v1",
        );
        let err = KubeCredentials::from_kubeconfig_str(&raw, Path::new("/tmp")).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn missing_context_is_a_config_error() {
        let raw = KUBECONFIG.replace("current-context: qa", "current-context: prod");
        let err = KubeCredentials::from_kubeconfig_str(&raw, Path::new("/tmp")).unwrap_err();
        assert!(matches!(err, ClusterError::Config(ref m) if m.contains("`prod`")));
    }
}
