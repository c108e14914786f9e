use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::api::admissionregistration::v1::RuleWithOperations;
use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{AdmissionPolicy, ClusterAdmissionPolicy, Policy};
use crate::k8s::K8sClient;

/// Policies without an explicit `policyServer` are hosted by this one.
const DEFAULT_POLICY_SERVER: &str = "default";

/* ============================= TARGETS ============================= */

/// One concrete (group, version, resource) a policy rule expands to.
///
/// Rules speak in plural resource names, so this is the unit the scanner
/// lists by; discovery maps it back to a kind when reports are built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetResource {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl fmt::Display for TargetResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Expand a policy's rules into the set of concrete targets it audits.
///
/// Rules that only watch operations other than CREATE are ignored, as are
/// wildcard groups/versions/resources (they cannot be enumerated) and
/// subresources such as `pods/status`.
pub fn rule_targets(rules: &[RuleWithOperations]) -> Vec<TargetResource> {
    let mut seen = HashSet::new();
    let mut targets = Vec::new();

    for rule in rules {
        let audits_creates = rule
            .operations
            .as_deref()
            .unwrap_or_default()
            .iter()
            .any(|op| op == "CREATE" || op == "*");
        if !audits_creates {
            continue;
        }

        for group in rule.api_groups.as_deref().unwrap_or_default() {
            for version in rule.api_versions.as_deref().unwrap_or_default() {
                for resource in rule.resources.as_deref().unwrap_or_default() {
                    if group == "*" || version == "*" || resource == "*" || resource.contains('/') {
                        debug!(%group, %version, %resource, "skipping non-enumerable rule target");
                        continue;
                    }
                    let target = TargetResource {
                        group: group.clone(),
                        version: version.clone(),
                        resource: resource.clone(),
                    };
                    if seen.insert(target.clone()) {
                        targets.push(target);
                    }
                }
            }
        }
    }

    targets
}

/* ============================= SELECTOR MATCHING ============================= */

/// Evaluate a `LabelSelector` against a label map.
///
/// `matchLabels` and `matchExpressions` are ANDed; an absent or empty
/// selector matches everything. An expression with an operator/values shape
/// the API would reject matches nothing.
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> bool {
    let Some(selector) = selector else {
        return true;
    };

    for (key, value) in selector.match_labels.iter().flatten() {
        if labels.get(key) != Some(value) {
            return false;
        }
    }

    for requirement in selector.match_expressions.iter().flatten() {
        let values = requirement.values.as_deref();
        let matched = match (requirement.operator.as_str(), values) {
            ("In", Some(values)) => labels
                .get(&requirement.key)
                .is_some_and(|v| values.contains(v)),
            ("NotIn", Some(values)) => labels
                .get(&requirement.key)
                .is_none_or(|v| !values.contains(v)),
            ("Exists", _) => labels.contains_key(&requirement.key),
            ("DoesNotExist", _) => !labels.contains_key(&requirement.key),
            (operator, values) => {
                warn!(%operator, key = %requirement.key, ?values, "illegal match expression");
                false
            }
        };
        if !matched {
            return false;
        }
    }

    true
}

/* ============================= BINDINGS ============================= */

/// Where a policy's audit endpoint resolved to, or why it did not.
///
/// Resolution failures are carried here instead of failing the catalog so a
/// broken PolicyServer turns into per-policy `error` results at evaluation
/// time rather than preventing the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyEndpoint {
    Resolved(String),
    Failed(String),
}

/// One auditable policy together with its resolved audit URL.
#[derive(Debug, Clone)]
pub struct PolicyBinding {
    pub policy: Policy,
    pub endpoint: PolicyEndpoint,
}

impl PolicyBinding {
    /// Whether the policy's object selector accepts the given labels.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        selector_matches(self.policy.object_selector(), labels)
    }
}

/* ============================= CATALOG ============================= */

/// Snapshot of the auditable policies installed in the cluster.
///
/// Taken once per invocation, before any fan-out starts: a scan reflects the
/// policy state at its start and is immune to mid-scan changes. Reads are
/// lock-free afterwards.
pub struct PolicyCatalog {
    namespaced: Vec<Arc<PolicyBinding>>,
    cluster: Vec<Arc<PolicyBinding>>,
}

impl PolicyCatalog {
    /// List all policies and resolve their audit endpoints.
    ///
    /// When `policy_server_url` is set every policy is routed there,
    /// bypassing the in-cluster Service lookup.
    pub async fn load(
        client: Client,
        k8s: &K8sClient,
        policy_server_url: Option<&str>,
    ) -> Result<Self> {
        let admission: Api<AdmissionPolicy> = Api::all(client.clone());
        let cluster_admission: Api<ClusterAdmissionPolicy> = Api::all(client);

        let admission_policies = admission
            .list(&ListParams::default())
            .await
            .context("failed to list AdmissionPolicies")?
            .items;
        let cluster_policies = cluster_admission
            .list(&ListParams::default())
            .await
            .context("failed to list ClusterAdmissionPolicies")?
            .items;

        let policies: Vec<Policy> = admission_policies
            .into_iter()
            .map(Policy::Admission)
            .chain(cluster_policies.into_iter().map(Policy::ClusterAdmission))
            .collect();

        let server_names: HashSet<String> = policies
            .iter()
            .map(|p| p.policy_server().unwrap_or(DEFAULT_POLICY_SERVER).to_string())
            .collect();

        let mut endpoints = HashMap::new();
        for name in server_names {
            let endpoint = match policy_server_url {
                Some(base) => PolicyEndpoint::Resolved(base.trim_end_matches('/').to_string()),
                None => match k8s.policy_server_endpoint(&name).await {
                    Ok(base) => PolicyEndpoint::Resolved(base),
                    Err(err) => {
                        warn!(policy_server = %name, error = %err, "policy server endpoint resolution failed");
                        PolicyEndpoint::Failed(format!("policy server {name}: {err:#}"))
                    }
                },
            };
            endpoints.insert(name, endpoint);
        }

        Ok(Self::assemble(policies, &endpoints))
    }

    /// Build the catalog from an already-fetched policy list.
    ///
    /// Policies that are not active or that opted out of background audit
    /// never enter the catalog, so they cannot contribute results.
    pub fn assemble(policies: Vec<Policy>, endpoints: &HashMap<String, PolicyEndpoint>) -> Self {
        let mut namespaced = Vec::new();
        let mut cluster = Vec::new();
        let mut skipped = 0usize;

        for policy in policies {
            if !policy.is_active() {
                debug!(policy = policy.name(), "skipping policy that is not active");
                skipped += 1;
                continue;
            }
            if !policy.background_audit() {
                debug!(policy = policy.name(), "skipping policy with background audit disabled");
                skipped += 1;
                continue;
            }

            let server = policy.policy_server().unwrap_or(DEFAULT_POLICY_SERVER);
            let endpoint = match endpoints.get(server) {
                Some(PolicyEndpoint::Resolved(base)) => {
                    PolicyEndpoint::Resolved(format!("{base}/audit/{}", policy.name()))
                }
                Some(PolicyEndpoint::Failed(reason)) => PolicyEndpoint::Failed(reason.clone()),
                None => PolicyEndpoint::Failed(format!("policy server {server}: unknown")),
            };

            let binding = Arc::new(PolicyBinding { policy, endpoint });
            match &binding.policy {
                Policy::Admission(_) => namespaced.push(binding),
                Policy::ClusterAdmission(_) => cluster.push(binding),
            }
        }

        info!(
            namespaced = namespaced.len(),
            cluster_wide = cluster.len(),
            skipped,
            "policy catalog loaded"
        );

        Self { namespaced, cluster }
    }

    /// Policies auditing resources inside `namespace`, grouped by target.
    ///
    /// Namespaced policies apply only to their own namespace; cluster-scoped
    /// policies apply when their namespace selector accepts the namespace's
    /// labels. The key set is the union of targets to enumerate; the binding
    /// order within each entry is the catalog order and fixes the order of
    /// results in reports.
    pub fn policies_for_namespace(
        &self,
        namespace: &Namespace,
    ) -> HashMap<TargetResource, Vec<Arc<PolicyBinding>>> {
        let name = namespace.name_any();
        let labels = namespace.labels();

        let bindings = self
            .namespaced
            .iter()
            .filter(|b| b.policy.namespace() == Some(name.as_str()))
            .chain(
                self.cluster
                    .iter()
                    .filter(|b| selector_matches(b.policy.namespace_selector(), labels)),
            );

        group_by_target(bindings)
    }

    /// Cluster-scoped policies grouped by target.
    ///
    /// Targets that discovery reveals to be namespaced are skipped by the
    /// scan engine, not here.
    pub fn cluster_wide_policies(&self) -> HashMap<TargetResource, Vec<Arc<PolicyBinding>>> {
        group_by_target(self.cluster.iter())
    }
}

fn group_by_target<'a>(
    bindings: impl Iterator<Item = &'a Arc<PolicyBinding>>,
) -> HashMap<TargetResource, Vec<Arc<PolicyBinding>>> {
    let mut by_target: HashMap<TargetResource, Vec<Arc<PolicyBinding>>> = HashMap::new();
    for binding in bindings {
        for target in rule_targets(binding.policy.rules()) {
            by_target.entry(target).or_default().push(binding.clone());
        }
    }
    by_target
}

/* ============================= TESTS ============================= */
