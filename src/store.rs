use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::evaluator::{HttpClient, TlsOptions, build_http_client};
use crate::report::{
    ClusterPolicyReport, PolicyReport, PolicyReportResult, PolicyResult, stale_report_selector,
};

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to encode intake payload: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("request to observability endpoint failed: {0}")]
    Request(String),

    #[error("observability endpoint returned HTTP {0}")]
    HttpStatus(hyper::StatusCode),
}

/* ============================= CAPABILITY ============================= */

/// Where finished reports go.
///
/// A sink upserts at most one report per resource UID, sweeps reports left
/// over from previous runs, and gets a pair of begin/end notifications
/// framing the scan.
#[allow(async_fn_in_trait)]
pub trait ReportStore {
    async fn create_or_patch_policy_report(&self, report: &PolicyReport) -> Result<(), StoreError>;

    async fn create_or_patch_cluster_policy_report(
        &self,
        report: &ClusterPolicyReport,
    ) -> Result<(), StoreError>;

    /// Remove reports in `namespace` not written by the run `run_uid`.
    async fn delete_old_policy_reports(
        &self,
        run_uid: &str,
        namespace: &str,
    ) -> Result<(), StoreError>;

    /// Remove cluster-scoped reports not written by the run `run_uid`.
    async fn delete_old_cluster_policy_reports(&self, run_uid: &str) -> Result<(), StoreError>;

    async fn before_scan(&self, run_uid: &str) -> Result<(), StoreError>;

    async fn after_scan(&self, run_uid: &str) -> Result<(), StoreError>;
}

/* ============================= CRD STORE ============================= */

/// Persists reports as `PolicyReport`/`ClusterPolicyReport` resources in the
/// cluster.
pub struct PolicyReportStore {
    client: Client,
}

/// Carry the desired report content onto the stored object, preserving the
/// server-side identity fields (resourceVersion in particular).
trait MergeReport: Sized {
    fn merge_onto(&self, current: Self) -> Self;
}

impl MergeReport for PolicyReport {
    fn merge_onto(&self, mut current: Self) -> Self {
        current.metadata.labels = self.metadata.labels.clone();
        current.metadata.owner_references = self.metadata.owner_references.clone();
        current.scope = self.scope.clone();
        current.summary = self.summary.clone();
        current.results = self.results.clone();
        current
    }
}

impl MergeReport for ClusterPolicyReport {
    fn merge_onto(&self, mut current: Self) -> Self {
        current.metadata.labels = self.metadata.labels.clone();
        current.metadata.owner_references = self.metadata.owner_references.clone();
        current.scope = self.scope.clone();
        current.summary = self.summary.clone();
        current.results = self.results.clone();
        current
    }
}

impl PolicyReportStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Fetch-merge-update, creating the report when it does not exist yet.
    /// A conflicting concurrent write is retried once against the fresh
    /// version.
    async fn upsert<K>(&self, api: Api<K>, desired: &K) -> Result<(), StoreError>
    where
        K: Resource<DynamicType = ()>
            + MergeReport
            + Clone
            + Serialize
            + DeserializeOwned
            + std::fmt::Debug,
    {
        let name = desired.meta().name.clone().unwrap_or_default();

        let current = match api.get(&name).await {
            Ok(current) => current,
            Err(kube::Error::Api(response)) if response.code == 404 => {
                api.create(&PostParams::default(), desired).await?;
                info!(report = %name, "created report");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        match api
            .replace(&name, &PostParams::default(), &desired.merge_onto(current))
            .await
        {
            Ok(_) => {}
            Err(kube::Error::Api(response)) if response.code == 409 => {
                let latest = api.get(&name).await?;
                api.replace(&name, &PostParams::default(), &desired.merge_onto(latest))
                    .await?;
            }
            Err(err) => return Err(err.into()),
        }

        info!(report = %name, "updated report");
        Ok(())
    }
}

impl ReportStore for PolicyReportStore {
    async fn create_or_patch_policy_report(&self, report: &PolicyReport) -> Result<(), StoreError> {
        let namespace = report.metadata.namespace.clone().unwrap_or_default();
        let api: Api<PolicyReport> = Api::namespaced(self.client.clone(), &namespace);
        self.upsert(api, report).await
    }

    async fn create_or_patch_cluster_policy_report(
        &self,
        report: &ClusterPolicyReport,
    ) -> Result<(), StoreError> {
        let api: Api<ClusterPolicyReport> = Api::all(self.client.clone());
        self.upsert(api, report).await
    }

    async fn delete_old_policy_reports(
        &self,
        run_uid: &str,
        namespace: &str,
    ) -> Result<(), StoreError> {
        let api: Api<PolicyReport> = Api::namespaced(self.client.clone(), namespace);
        let params = ListParams::default().labels(&stale_report_selector(run_uid));
        api.delete_collection(&DeleteParams::default(), &params)
            .await?;
        debug!(namespace, "deleted stale policy reports");
        Ok(())
    }

    async fn delete_old_cluster_policy_reports(&self, run_uid: &str) -> Result<(), StoreError> {
        let api: Api<ClusterPolicyReport> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&stale_report_selector(run_uid));
        api.delete_collection(&DeleteParams::default(), &params)
            .await?;
        debug!("deleted stale cluster policy reports");
        Ok(())
    }

    async fn before_scan(&self, _run_uid: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn after_scan(&self, _run_uid: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

/* ============================= SUSE OBSERVABILITY STORE ============================= */

const CONSISTENCY_MODEL: &str = "REPEAT_SNAPSHOTS";
const HEALTH_CLEAR: &str = "Clear";
const HEALTH_DEVIATING: &str = "Deviating";

#[derive(Debug, Clone)]
pub struct SuseObsSettings {
    pub url: String,
    pub api_key: String,
    pub urn: String,
    pub cluster: String,
    /// Seconds between snapshot repetitions announced to the backend.
    pub repeat_interval: u64,
    /// Seconds after which the backend expires unrefreshed check states.
    pub expire_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CheckState {
    #[serde(rename = "checkStateId")]
    pub check_state_id: String,
    pub message: String,
    pub health: String,
    #[serde(rename = "topologyElementIdentifier")]
    pub topology_element_identifier: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotStart {
    pub repeat_interval_s: u64,
    pub expiry_interval_s: u64,
}

/// Serializes to the empty object the protocol expects.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotStop {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStream {
    pub consistency_model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_snapshot: Option<SnapshotStart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop_snapshot: Option<SnapshotStop>,
    pub stream: HealthStreamId,
    pub check_states: Vec<CheckState>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStreamId {
    pub urn: String,
    pub sub_stream_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntakePayload {
    #[serde(rename = "apiKey")]
    pub api_key: String,
    pub collection_timestamp: i64,
    #[serde(rename = "internalHostname")]
    pub internal_hostname: String,
    pub events: Option<serde_json::Value>,
    pub metrics: Vec<serde_json::Value>,
    pub service_checks: Vec<serde_json::Value>,
    pub topologies: Vec<serde_json::Value>,
    pub health: HealthStream,
}

/// Pushes report outcomes to a SUSE Observability intake endpoint as health
/// check states.
///
/// Each scan is framed as a snapshot: a start frame before any work, one
/// frame per report, and a stop frame after the scan. The backend expires
/// states on its own, so the reap operations are no-ops here.
pub struct SuseObsStore {
    client: HttpClient,
    settings: SuseObsSettings,
    internal_hostname: String,
    intake_url: String,
}

impl SuseObsStore {
    pub fn new(settings: SuseObsSettings, tls: &TlsOptions) -> anyhow::Result<Self> {
        let uri: hyper::Uri = settings
            .url
            .parse()
            .map_err(|err| anyhow::anyhow!("invalid SUSE Observability URL: {err}"))?;
        let internal_hostname = uri
            .host()
            .ok_or_else(|| anyhow::anyhow!("SUSE Observability URL has no host"))?
            .to_string();

        let base = settings.url.trim_end_matches('/');
        let intake_url = format!("{base}/receiver/stsAgent/intake?api_key={}", settings.api_key);

        Ok(Self {
            client: build_http_client(tls)?,
            settings,
            internal_hostname,
            intake_url,
        })
    }

    fn payload(
        &self,
        check_states: Vec<CheckState>,
        start_snapshot: Option<SnapshotStart>,
        stop_snapshot: Option<SnapshotStop>,
    ) -> IntakePayload {
        IntakePayload {
            api_key: self.settings.api_key.clone(),
            collection_timestamp: chrono::Utc::now().timestamp(),
            internal_hostname: self.internal_hostname.clone(),
            events: None,
            metrics: Vec::new(),
            service_checks: Vec::new(),
            topologies: Vec::new(),
            health: HealthStream {
                consistency_model: CONSISTENCY_MODEL.to_string(),
                start_snapshot,
                stop_snapshot,
                stream: HealthStreamId {
                    urn: self.settings.urn.clone(),
                    sub_stream_id: self.settings.cluster.clone(),
                },
                check_states,
            },
        }
    }

    async fn send(&self, payload: &IntakePayload) -> Result<(), StoreError> {
        let body = serde_json::to_vec(payload)?;
        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(&self.intake_url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| StoreError::Request(err.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus(status));
        }
        // Drain the body so the connection can be reused.
        let _ = response.into_body().collect().await;
        Ok(())
    }

    fn check_states(
        &self,
        scope: Option<&ObjectReference>,
        results: &[PolicyReportResult],
    ) -> Vec<CheckState> {
        let Some(scope) = scope else {
            return Vec::new();
        };

        results
            .iter()
            .map(|result| check_state(&self.settings.cluster, scope, result))
            .collect()
    }
}

fn check_state(cluster: &str, scope: &ObjectReference, result: &PolicyReportResult) -> CheckState {
    let namespace = scope.namespace.as_deref().unwrap_or_default();
    let kind = scope.kind.as_deref().unwrap_or_default();
    let name = scope.name.as_deref().unwrap_or_default();
    let policy = &result.policy;

    let health = match result.result {
        PolicyResult::Fail => HEALTH_DEVIATING,
        _ => HEALTH_CLEAR,
    };

    // Cluster-scoped resources have no namespace segment in the topology id.
    let topology_element_identifier = if namespace.is_empty() {
        format!("urn:kubernetes:/{cluster}:{kind}/{name}").to_lowercase()
    } else {
        format!("urn:kubernetes:/{cluster}:{namespace}:{kind}/{name}").to_lowercase()
    };

    CheckState {
        check_state_id: format!("{policy}-{namespace}-{kind}-{name}-{policy}").to_lowercase(),
        message: result.description.clone(),
        health: health.to_string(),
        topology_element_identifier,
        name: policy.clone(),
    }
}

impl ReportStore for SuseObsStore {
    async fn create_or_patch_policy_report(&self, report: &PolicyReport) -> Result<(), StoreError> {
        let states = self.check_states(report.scope.as_ref(), &report.results);
        if states.is_empty() {
            return Ok(());
        }
        self.send(&self.payload(states, None, None)).await
    }

    async fn create_or_patch_cluster_policy_report(
        &self,
        report: &ClusterPolicyReport,
    ) -> Result<(), StoreError> {
        let states = self.check_states(report.scope.as_ref(), &report.results);
        if states.is_empty() {
            return Ok(());
        }
        self.send(&self.payload(states, None, None)).await
    }

    async fn delete_old_policy_reports(
        &self,
        _run_uid: &str,
        _namespace: &str,
    ) -> Result<(), StoreError> {
        // The backend expires unrefreshed check states after expiry_interval_s.
        Ok(())
    }

    async fn delete_old_cluster_policy_reports(&self, _run_uid: &str) -> Result<(), StoreError> {
        Ok(())
    }

    async fn before_scan(&self, _run_uid: &str) -> Result<(), StoreError> {
        let start = SnapshotStart {
            repeat_interval_s: self.settings.repeat_interval,
            expiry_interval_s: self.settings.expire_interval,
        };
        self.send(&self.payload(Vec::new(), Some(start), None)).await
    }

    async fn after_scan(&self, _run_uid: &str) -> Result<(), StoreError> {
        self.send(&self.payload(Vec::new(), None, Some(SnapshotStop {})))
            .await
    }
}

/* ============================= SELECTION ============================= */

/// The sink picked by configuration, or none at all with `--disable-store`.
pub enum Store {
    Cluster(PolicyReportStore),
    SuseObs(SuseObsStore),
    Disabled,
}

impl ReportStore for Store {
    async fn create_or_patch_policy_report(&self, report: &PolicyReport) -> Result<(), StoreError> {
        match self {
            Store::Cluster(store) => store.create_or_patch_policy_report(report).await,
            Store::SuseObs(store) => store.create_or_patch_policy_report(report).await,
            Store::Disabled => Ok(()),
        }
    }

    async fn create_or_patch_cluster_policy_report(
        &self,
        report: &ClusterPolicyReport,
    ) -> Result<(), StoreError> {
        match self {
            Store::Cluster(store) => store.create_or_patch_cluster_policy_report(report).await,
            Store::SuseObs(store) => store.create_or_patch_cluster_policy_report(report).await,
            Store::Disabled => Ok(()),
        }
    }

    async fn delete_old_policy_reports(
        &self,
        run_uid: &str,
        namespace: &str,
    ) -> Result<(), StoreError> {
        match self {
            Store::Cluster(store) => store.delete_old_policy_reports(run_uid, namespace).await,
            Store::SuseObs(store) => store.delete_old_policy_reports(run_uid, namespace).await,
            Store::Disabled => Ok(()),
        }
    }

    async fn delete_old_cluster_policy_reports(&self, run_uid: &str) -> Result<(), StoreError> {
        match self {
            Store::Cluster(store) => store.delete_old_cluster_policy_reports(run_uid).await,
            Store::SuseObs(store) => store.delete_old_cluster_policy_reports(run_uid).await,
            Store::Disabled => Ok(()),
        }
    }

    async fn before_scan(&self, run_uid: &str) -> Result<(), StoreError> {
        match self {
            Store::Cluster(store) => store.before_scan(run_uid).await,
            Store::SuseObs(store) => store.before_scan(run_uid).await,
            Store::Disabled => Ok(()),
        }
    }

    async fn after_scan(&self, run_uid: &str) -> Result<(), StoreError> {
        match self {
            Store::Cluster(store) => store.after_scan(run_uid).await,
            Store::SuseObs(store) => store.after_scan(run_uid).await,
            Store::Disabled => Ok(()),
        }
    }
}

/* ============================= TESTS ============================= */
