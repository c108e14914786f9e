use std::collections::{BTreeSet, HashMap};

use anyhow::{Context, Result, anyhow};
use k8s_openapi::api::core::v1::{Namespace, Service};
use kube::api::{Api, ListParams};
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::{self, ApiCapabilities};
use kube::{Client, ResourceExt};
use tokio::sync::Mutex;
use tracing::debug;

use crate::policies::TargetResource;

/// Services exposing a PolicyServer's audit endpoint carry this label, with
/// the policy server name appended.
const POLICY_SERVER_APP_LABEL_PREFIX: &str = "kubewarden-policy-server-";

/* ============================= GATEWAY ============================= */

/// Read-only gateway to the cluster: namespace enumeration, paged listing of
/// arbitrary resource types, and PolicyServer service resolution.
///
/// Listing errors are returned to the caller unchanged; retry and
/// partial-failure policy live in the scan engine.
pub struct K8sClient {
    client: Client,
    kubewarden_namespace: String,
    skipped_namespaces: BTreeSet<String>,
    page_size: u32,
    discovery_cache: Mutex<HashMap<TargetResource, (ApiResource, ApiCapabilities)>>,
}

impl K8sClient {
    pub fn new(
        client: Client,
        kubewarden_namespace: &str,
        skipped_namespaces: &[String],
        page_size: u32,
    ) -> Self {
        Self {
            client,
            kubewarden_namespace: kubewarden_namespace.to_string(),
            skipped_namespaces: skip_set(kubewarden_namespace, skipped_namespaces),
            page_size,
            discovery_cache: Mutex::new(HashMap::new()),
        }
    }

    /// All cluster namespaces except the configured skip set.
    pub async fn list_namespaces(&self) -> Result<Vec<Namespace>> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let mut namespaces = Vec::new();
        let mut continue_token: Option<String> = None;

        loop {
            let mut params = ListParams::default().limit(self.page_size);
            if let Some(token) = &continue_token {
                params = params.continue_token(token);
            }
            let page = api
                .list(&params)
                .await
                .context("failed to list namespaces")?;

            namespaces.extend(
                page.items
                    .into_iter()
                    .filter(|ns| !self.skipped_namespaces.contains(&ns.name_any())),
            );

            continue_token = page.metadata.continue_.filter(|token| !token.is_empty());
            if continue_token.is_none() {
                return Ok(namespaces);
            }
        }
    }

    pub async fn get_namespace(&self, name: &str) -> Result<Namespace> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get(name)
            .await
            .with_context(|| format!("failed to get namespace {name}"))
    }

    /// Map a rule target to the served API resource and its capabilities.
    ///
    /// The capabilities answer whether the resource is namespaced or
    /// cluster-scoped. Results are cached for the lifetime of the scan.
    pub async fn resolve(&self, target: &TargetResource) -> Result<(ApiResource, ApiCapabilities)> {
        if let Some(found) = self.discovery_cache.lock().await.get(target) {
            return Ok(found.clone());
        }

        let group = discovery::group(&self.client, &target.group)
            .await
            .with_context(|| format!("discovery failed for group {:?}", target.group))?;
        let resolved = group
            .versioned_resources(&target.version)
            .into_iter()
            .find(|(resource, _)| resource.plural == target.resource)
            .ok_or_else(|| anyhow!("resource {target} is not served by this cluster"))?;

        debug!(target = %target, kind = %resolved.0.kind, "resolved rule target");
        self.discovery_cache
            .lock()
            .await
            .insert(target.clone(), resolved.clone());
        Ok(resolved)
    }

    /// Fetch one page of resources; the returned token resumes the listing.
    pub async fn list_page(
        &self,
        api_resource: &ApiResource,
        namespace: Option<&str>,
        continue_token: Option<&str>,
    ) -> Result<(Vec<DynamicObject>, Option<String>)> {
        let api: Api<DynamicObject> = match namespace {
            Some(ns) => Api::namespaced_with(self.client.clone(), ns, api_resource),
            None => Api::all_with(self.client.clone(), api_resource),
        };

        let mut params = ListParams::default().limit(self.page_size);
        if let Some(token) = continue_token {
            params = params.continue_token(token);
        }

        let page = api.list(&params).await.with_context(|| {
            format!(
                "failed to list {} in {}",
                api_resource.plural,
                namespace.unwrap_or("the cluster")
            )
        })?;

        let next = page.metadata.continue_.filter(|token| !token.is_empty());
        Ok((page.items, next))
    }

    /// Resolve the audit endpoint of a PolicyServer through its Service.
    pub async fn policy_server_endpoint(&self, policy_server: &str) -> Result<String> {
        let services: Api<Service> =
            Api::namespaced(self.client.clone(), &self.kubewarden_namespace);
        let params = ListParams::default()
            .labels(&format!("app={POLICY_SERVER_APP_LABEL_PREFIX}{policy_server}"));

        let list = services
            .list(&params)
            .await
            .with_context(|| format!("failed to list services for policy server {policy_server}"))?;
        let service = list
            .items
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("no service found for policy server {policy_server}"))?;

        let port = service
            .spec
            .as_ref()
            .and_then(|spec| spec.ports.as_ref())
            .and_then(|ports| ports.first())
            .map(|port| port.port)
            .ok_or_else(|| anyhow!("service for policy server {policy_server} exposes no port"))?;

        Ok(service_url(
            &service.name_any(),
            &self.kubewarden_namespace,
            port,
        ))
    }
}

fn service_url(service: &str, namespace: &str, port: i32) -> String {
    format!("https://{service}.{namespace}.svc:{port}")
}

/// The kubewarden install namespace is never audited, on top of whatever the
/// operator asked to skip.
fn skip_set(kubewarden_namespace: &str, skipped_namespaces: &[String]) -> BTreeSet<String> {
    let mut skipped: BTreeSet<String> = skipped_namespaces.iter().cloned().collect();
    skipped.insert(kubewarden_namespace.to_string());
    skipped
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // Client::try_default needs a kubeconfig, so these tests cover the pure
    // parts of the gateway; listing behavior is exercised against a cluster.

    #[test]
    fn test_service_url_format() {
        assert_eq!(
            service_url("policy-server-default", "kubewarden", 443),
            "https://policy-server-default.kubewarden.svc:443"
        );
    }

    #[test]
    fn test_skip_set_includes_kubewarden_namespace() {
        let skipped = skip_set("kubewarden", &["kube-system".to_string()]);
        assert!(skipped.contains("kubewarden"));
        assert!(skipped.contains("kube-system"));
        assert!(!skipped.contains("default"));
    }

    #[test]
    fn test_skip_set_deduplicates() {
        let skipped = skip_set("kubewarden", &["kubewarden".to_string()]);
        assert_eq!(skipped.len(), 1);
    }
}
