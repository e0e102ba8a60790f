//! Minimal in-cluster Kubernetes API access
//!
//! The local adapter only needs three verbs: replace the data of a
//! ConfigMap, replace the data of a Secret, and trigger a rolling restart
//! of the IdP DaemonSet. Those are strategic-merge PATCHes against the
//! core and apps APIs, authenticated with the pod's service account.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use reqwest::{Client, StatusCode};
use tracing::{debug, warn};

use crate::{Error, Result};

/// Annotation that makes the kubelet roll the pods of a workload.
const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Mount point of the pod's service-account credentials.
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Cluster operations the local adapter depends on.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Replace the `data` of a ConfigMap.
    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Replace the `stringData` of a Secret.
    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()>;

    /// Restart the pods of a DaemonSet by bumping its template annotation.
    async fn restart_daemonset(&self, namespace: &str, name: &str) -> Result<()>;
}

/// API-server client using the pod's service-account token.
pub struct InClusterClient {
    http: Client,
    base_url: String,
    token: String,
}

impl InClusterClient {
    /// Build from the in-cluster environment: API server address from
    /// `KUBERNETES_SERVICE_HOST`/`KUBERNETES_SERVICE_PORT`, token and CA
    /// from the service-account mount.
    pub fn from_cluster_env() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| Error::Validation("not running in a cluster".to_string()))?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = std::fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))?
            .trim()
            .to_string();
        let ca = std::fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))?;
        let certificate = reqwest::Certificate::from_pem(&ca)
            .map_err(|e| Error::Unexpected(format!("cluster ca: {e}")))?;

        let http = Client::builder()
            .add_root_certificate(certificate)
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| Error::Unexpected(format!("build http client: {e}")))?;

        Ok(Self::new(http, format!("https://{host}:{port}"), token))
    }

    /// Build against an explicit API server. Test seam.
    #[must_use]
    pub fn new(http: Client, base_url: String, token: String) -> Self {
        Self {
            http,
            base_url,
            token,
        }
    }

    async fn strategic_merge_patch(
        &self,
        url: String,
        body: serde_json::Value,
        what: &str,
    ) -> Result<()> {
        debug!(target = %what, "patching cluster object");

        let response = self
            .http
            .patch(&url)
            .bearer_auth(&self.token)
            .header(
                reqwest::header::CONTENT_TYPE,
                "application/strategic-merge-patch+json",
            )
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let detail = response.text().await.unwrap_or_default();
        warn!(target = %what, status = %status, "cluster patch failed");
        match status {
            StatusCode::NOT_FOUND => Err(Error::NotFound(format!("{what} not found"))),
            StatusCode::UNAUTHORIZED => {
                Err(Error::Unauthorized(format!("{what}: unauthorized")))
            }
            StatusCode::FORBIDDEN => Err(Error::Forbidden(format!("{what}: forbidden"))),
            _ => Err(Error::Unexpected(format!(
                "{what}: status {status}: {detail}"
            ))),
        }
    }
}

#[async_trait]
impl ClusterClient for InClusterClient {
    async fn apply_config_map(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.strategic_merge_patch(
            format!(
                "{}/api/v1/namespaces/{namespace}/configmaps/{name}",
                self.base_url
            ),
            serde_json::json!({"data": data}),
            "configmap",
        )
        .await
    }

    async fn apply_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        // stringData lets the API server do the base64 encoding
        self.strategic_merge_patch(
            format!(
                "{}/api/v1/namespaces/{namespace}/secrets/{name}",
                self.base_url
            ),
            serde_json::json!({"stringData": data}),
            "secret",
        )
        .await
    }

    async fn restart_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let now = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        self.strategic_merge_patch(
            format!(
                "{}/apis/apps/v1/namespaces/{namespace}/daemonsets/{name}",
                self.base_url
            ),
            serde_json::json!({
                "spec": {"template": {"metadata": {"annotations": {
                    RESTARTED_AT_ANNOTATION: now,
                }}}},
            }),
            "daemonset",
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> InClusterClient {
        InClusterClient::new(Client::new(), server.uri(), "sa-token".to_string())
    }

    #[tokio::test]
    async fn configmap_patch_targets_core_api() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/namespaces/lfx/configmaps/authelia-users"))
            .and(header("authorization", "Bearer sa-token"))
            .and(header(
                "content-type",
                "application/strategic-merge-patch+json",
            ))
            .and(body_partial_json(json!({"data": {"users.yml": "users: {}"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .apply_config_map(
                "lfx",
                "authelia-users",
                BTreeMap::from([("users.yml".to_string(), "users: {}".to_string())]),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn secret_patch_uses_string_data() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/api/v1/namespaces/lfx/secrets/authelia-users"))
            .and(body_partial_json(json!({"stringData": {"users.yml": "users: {}"}})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .apply_secret(
                "lfx",
                "authelia-users",
                BTreeMap::from([("users.yml".to_string(), "users: {}".to_string())]),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn restart_bumps_template_annotation() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path(
                "/apis/apps/v1/namespaces/lfx/daemonsets/lfx-platform-authelia",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&server)
            .await;

        client(&server)
            .restart_daemonset("lfx", "lfx-platform-authelia")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn missing_object_maps_to_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = client(&server)
            .restart_daemonset("lfx", "gone")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }
}
