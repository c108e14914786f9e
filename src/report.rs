use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::core::{ApiResource, DynamicObject, TypeMeta};
use kube::ResourceExt;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeMap;

/* ============================= LABELS ============================= */

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "kubewarden";
pub const SCAN_RUN_UID_LABEL: &str = "kubewarden.io/scan-run-uid";

const GROUP: &str = "wgpolicyk8s.io";
const VERSION: &str = "v1alpha2";

fn run_labels(run_uid: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (SCAN_RUN_UID_LABEL.to_string(), run_uid.to_string()),
    ])
}

/// Label selector matching reports written by this tool during any run other
/// than `run_uid`. Used to sweep leftovers from previous scans.
pub fn stale_report_selector(run_uid: &str) -> String {
    format!("{MANAGED_BY_LABEL}={MANAGED_BY},{SCAN_RUN_UID_LABEL}!={run_uid}")
}

/* ============================= RESULT TYPES ============================= */

/// Outcome of evaluating one policy against one resource.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PolicyResult {
    Pass,
    Fail,
    Warn,
    Error,
    Skip,
}

/// A single per-policy entry in a report's `results` list.
///
/// The human-readable text is named `description` here but serializes to the
/// wire field `message`, matching the wgpolicyk8s.io v1alpha2 schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyReportResult {
    pub policy: String,
    pub result: PolicyResult,
    #[serde(rename = "message", default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyReportSummary {
    #[serde(default)]
    pub pass: i32,
    #[serde(default)]
    pub fail: i32,
    #[serde(default)]
    pub warn: i32,
    #[serde(default)]
    pub error: i32,
    #[serde(default)]
    pub skip: i32,
}

impl PolicyReportSummary {
    /// Count results by outcome.
    pub fn tally(results: &[PolicyReportResult]) -> Self {
        let mut summary = Self::default();
        for result in results {
            match result.result {
                PolicyResult::Pass => summary.pass += 1,
                PolicyResult::Fail => summary.fail += 1,
                PolicyResult::Warn => summary.warn += 1,
                PolicyResult::Error => summary.error += 1,
                PolicyResult::Skip => summary.skip += 1,
            }
        }
        summary
    }
}

/* ============================= POLICY REPORT ============================= */

/// Namespaced `wgpolicyk8s.io/v1alpha2` PolicyReport.
///
/// These report CRDs have no `spec` block (scope, summary and results live
/// at the top level), so `kube::Resource` is implemented by hand instead of
/// going through the derive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyReport {
    #[serde(flatten)]
    pub types: Option<TypeMeta>,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ObjectReference>,
    #[serde(default)]
    pub summary: PolicyReportSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PolicyReportResult>,
}

impl kube::Resource for PolicyReport {
    type DynamicType = ();
    type Scope = NamespaceResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("PolicyReport")
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("policyreports")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl PolicyReport {
    /// Build the report for one namespaced resource.
    ///
    /// The report name is the resource UID, the durable key used for upserts,
    /// and the owner reference lets cluster garbage collection remove the
    /// report when the resource itself goes away.
    pub fn for_resource(
        run_uid: &str,
        resource: &DynamicObject,
        api_resource: &ApiResource,
        results: Vec<PolicyReportResult>,
    ) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{GROUP}/{VERSION}"),
                kind: "PolicyReport".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(resource.uid().unwrap_or_default()),
                namespace: resource.namespace(),
                labels: Some(run_labels(run_uid)),
                owner_references: Some(vec![owner_reference(resource, api_resource)]),
                ..Default::default()
            },
            scope: Some(resource_scope(resource, api_resource)),
            summary: PolicyReportSummary::tally(&results),
            results,
        }
    }
}

/* ============================= CLUSTER POLICY REPORT ============================= */

/// Cluster-scoped `wgpolicyk8s.io/v1alpha2` ClusterPolicyReport.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterPolicyReport {
    #[serde(flatten)]
    pub types: Option<TypeMeta>,
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<ObjectReference>,
    #[serde(default)]
    pub summary: PolicyReportSummary,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub results: Vec<PolicyReportResult>,
}

impl kube::Resource for ClusterPolicyReport {
    type DynamicType = ();
    type Scope = ClusterResourceScope;

    fn kind(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("ClusterPolicyReport")
    }

    fn group(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(GROUP)
    }

    fn version(_: &()) -> Cow<'_, str> {
        Cow::Borrowed(VERSION)
    }

    fn plural(_: &()) -> Cow<'_, str> {
        Cow::Borrowed("clusterpolicyreports")
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

impl ClusterPolicyReport {
    /// Build the report for one cluster-scoped resource.
    pub fn for_resource(
        run_uid: &str,
        resource: &DynamicObject,
        api_resource: &ApiResource,
        results: Vec<PolicyReportResult>,
    ) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: format!("{GROUP}/{VERSION}"),
                kind: "ClusterPolicyReport".to_string(),
            }),
            metadata: ObjectMeta {
                name: Some(resource.uid().unwrap_or_default()),
                labels: Some(run_labels(run_uid)),
                owner_references: Some(vec![owner_reference(resource, api_resource)]),
                ..Default::default()
            },
            scope: Some(resource_scope(resource, api_resource)),
            summary: PolicyReportSummary::tally(&results),
            results,
        }
    }
}

/* ============================= SCOPE & OWNERSHIP ============================= */

fn owner_reference(resource: &DynamicObject, api_resource: &ApiResource) -> OwnerReference {
    OwnerReference {
        api_version: api_resource.api_version.clone(),
        kind: api_resource.kind.clone(),
        name: resource.name_any(),
        uid: resource.uid().unwrap_or_default(),
        ..Default::default()
    }
}

fn resource_scope(resource: &DynamicObject, api_resource: &ApiResource) -> ObjectReference {
    ObjectReference {
        api_version: Some(api_resource.api_version.clone()),
        kind: Some(api_resource.kind.clone()),
        name: Some(resource.name_any()),
        namespace: resource.namespace(),
        uid: resource.uid(),
        resource_version: resource.resource_version(),
        ..Default::default()
    }
}

/* ============================= TESTS ============================= */
