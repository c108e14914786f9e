use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/* ============================= ANNOTATIONS ============================= */

/// Policy annotation carrying the severity to be copied into report results.
pub const SEVERITY_ANNOTATION: &str = "io.kubewarden.policy.severity";

/// Policy annotation carrying the category to be copied into report results.
pub const CATEGORY_ANNOTATION: &str = "io.kubewarden.policy.category";

/* ============================= STATUS ============================= */

/// Lifecycle state of a policy as reported by the Kubewarden controller.
///
/// Only `active` policies take part in an audit scan.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum PolicyState {
    Active,
    #[default]
    Pending,
    Failed,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_status: Option<PolicyState>,
}

/* ============================= ADMISSION POLICY ============================= */

/// AdmissionPolicy is a namespaced policy bound to a PolicyServer.
///
/// The scanner consumes these resources as-is; it never mutates them.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "AdmissionPolicy",
    plural = "admissionpolicies",
    status = "PolicyStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionPolicySpec {
    /// OCI reference to the WebAssembly module evaluated by the PolicyServer.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,

    /// Name of the PolicyServer hosting this policy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_server: Option<String>,

    /// Admission rules selecting the resources this policy applies to.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleWithOperations>,

    /// Label selector narrowing the policy to a subset of objects.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,

    /// Whether the policy takes part in background audit scans. Defaults to true.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_audit: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutating: Option<bool>,
}

/* ============================= CLUSTER ADMISSION POLICY ============================= */

/// ClusterAdmissionPolicy is the cluster-scoped policy variant.
///
/// In addition to the namespaced fields it carries a namespace selector
/// limiting which namespaces the policy applies to.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[kube(
    group = "policies.kubewarden.io",
    version = "v1",
    kind = "ClusterAdmissionPolicy",
    plural = "clusteradmissionpolicies",
    status = "PolicyStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterAdmissionPolicySpec {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub module: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_server: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<RuleWithOperations>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_selector: Option<LabelSelector>,

    /// Label selector limiting the namespaces this policy applies to.
    /// An empty or absent selector matches every namespace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace_selector: Option<LabelSelector>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub background_audit: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mutating: Option<bool>,
}

/* ============================= POLICY WRAPPER ============================= */

/// Either variant of a Kubewarden policy, with uniform accessors.
///
/// The catalog works on this type so rule matching, selector filtering and
/// endpoint resolution are written once for both kinds.
#[derive(Debug, Clone)]
pub enum Policy {
    Admission(AdmissionPolicy),
    ClusterAdmission(ClusterAdmissionPolicy),
}

impl Policy {
    pub fn name(&self) -> &str {
        match self {
            Policy::Admission(p) => p.metadata.name.as_deref().unwrap_or_default(),
            Policy::ClusterAdmission(p) => p.metadata.name.as_deref().unwrap_or_default(),
        }
    }

    /// Namespace of the policy, `None` for the cluster-scoped variant.
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Policy::Admission(p) => p.metadata.namespace.as_deref(),
            Policy::ClusterAdmission(_) => None,
        }
    }

    pub fn rules(&self) -> &[RuleWithOperations] {
        match self {
            Policy::Admission(p) => &p.spec.rules,
            Policy::ClusterAdmission(p) => &p.spec.rules,
        }
    }

    pub fn object_selector(&self) -> Option<&LabelSelector> {
        match self {
            Policy::Admission(p) => p.spec.object_selector.as_ref(),
            Policy::ClusterAdmission(p) => p.spec.object_selector.as_ref(),
        }
    }

    /// Namespace selector, only meaningful for the cluster-scoped variant.
    pub fn namespace_selector(&self) -> Option<&LabelSelector> {
        match self {
            Policy::Admission(_) => None,
            Policy::ClusterAdmission(p) => p.spec.namespace_selector.as_ref(),
        }
    }

    pub fn policy_server(&self) -> Option<&str> {
        match self {
            Policy::Admission(p) => p.spec.policy_server.as_deref(),
            Policy::ClusterAdmission(p) => p.spec.policy_server.as_deref(),
        }
    }

    /// Whether the policy opted into background audit scans. Defaults to true.
    pub fn background_audit(&self) -> bool {
        match self {
            Policy::Admission(p) => p.spec.background_audit.unwrap_or(true),
            Policy::ClusterAdmission(p) => p.spec.background_audit.unwrap_or(true),
        }
    }

    pub fn is_active(&self) -> bool {
        let status = match self {
            Policy::Admission(p) => p.status.as_ref(),
            Policy::ClusterAdmission(p) => p.status.as_ref(),
        };
        matches!(
            status.and_then(|s| s.policy_status.as_ref()),
            Some(PolicyState::Active)
        )
    }

    fn annotations(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Policy::Admission(p) => p.metadata.annotations.as_ref(),
            Policy::ClusterAdmission(p) => p.metadata.annotations.as_ref(),
        }
    }

    /// Severity declared on the policy, copied verbatim into report results.
    pub fn severity(&self) -> Option<&str> {
        self.annotations()
            .and_then(|a| a.get(SEVERITY_ANNOTATION))
            .map(String::as_str)
    }

    /// Category declared on the policy, copied verbatim into report results.
    pub fn category(&self) -> Option<&str> {
        self.annotations()
            .and_then(|a| a.get(CATEGORY_ANNOTATION))
            .map(String::as_str)
    }
}

/* ============================= TESTS ============================= */
