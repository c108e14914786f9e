use std::sync::Arc;

use anyhow::Result;
use futures::StreamExt;
use futures::stream;
use k8s_openapi::api::core::v1::Namespace;
use kube::ResourceExt;
use kube::core::{ApiResource, DynamicObject};
use kube::discovery::Scope;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::cancellation::{Cancelled, CancellationToken};
use crate::evaluator::PolicyEvaluator;
use crate::k8s::K8sClient;
use crate::policies::{PolicyBinding, PolicyCatalog, TargetResource};
use crate::report::{ClusterPolicyReport, PolicyReport};
use crate::store::ReportStore;

/* ============================= FAILURE TRACKING ============================= */

/// Remembers the first report-store failure of a run.
///
/// One bad resource must not mask scan breadth, so errors are recorded here
/// while the fan-out keeps draining; the run fails with the first error only
/// after all work finished.
#[derive(Default)]
struct FirstFailure(Mutex<Option<anyhow::Error>>);

impl FirstFailure {
    async fn record(&self, err: anyhow::Error) {
        let mut slot = self.0.lock().await;
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    fn into_result(self) -> Result<()> {
        match self.0.into_inner() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/* ============================= SCANNER ============================= */

/// The scan engine: fans out over namespaces, resources and policies with
/// independent concurrency bounds and hands finished reports to the store.
///
/// Every fan-out level checks the run's cancellation token before starting
/// new work, and in-flight evaluations race it, so a canceled run drains
/// quickly, skips the reap, still notifies the store that the scan ended,
/// and surfaces a single "scan canceled" error. Reports are only written
/// after every policy for their resource resolved, so partial reports never
/// reach the store.
pub struct Scanner<S> {
    k8s: K8sClient,
    catalog: PolicyCatalog,
    evaluator: PolicyEvaluator,
    store: S,
    parallel_namespaces: usize,
    parallel_resources: usize,
    output_scan: bool,
    cancel: CancellationToken,
    stdout: Mutex<()>,
}

impl<S: ReportStore> Scanner<S> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        k8s: K8sClient,
        catalog: PolicyCatalog,
        evaluator: PolicyEvaluator,
        store: S,
        parallel_namespaces: usize,
        parallel_resources: usize,
        output_scan: bool,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            k8s,
            catalog,
            evaluator,
            store,
            parallel_namespaces: parallel_namespaces.max(1),
            parallel_resources: parallel_resources.max(1),
            output_scan,
            cancel,
            stdout: Mutex::new(()),
        }
    }

    /* ── public operations ── */

    /// Audit every matching resource in one namespace.
    pub async fn scan_namespace(&self, namespace: &str, run_uid: &str) -> Result<()> {
        self.notify_before(run_uid).await;

        let result = async {
            let namespace = self.k8s.get_namespace(namespace).await?;
            let failure = FirstFailure::default();
            self.audit_namespace(&namespace, run_uid, &failure).await;
            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            self.reap_namespace(&namespace.name_any(), run_uid).await;
            failure.into_result()
        }
        .await;

        self.notify_after(run_uid).await;
        result
    }

    /// Audit all namespaces, at most `parallel_namespaces` at a time.
    pub async fn scan_all_namespaces(&self, run_uid: &str) -> Result<()> {
        self.notify_before(run_uid).await;

        let result = async {
            let namespaces = self.k8s.list_namespaces().await?;
            info!(namespaces = namespaces.len(), run_uid, "scan started");

            let failure = FirstFailure::default();
            stream::iter(namespaces)
                .for_each_concurrent(self.parallel_namespaces, |namespace| {
                    let failure = &failure;
                    async move {
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        self.audit_namespace(&namespace, run_uid, failure).await;
                        // Stale reports are left alone on a canceled run.
                        if self.cancel.is_cancelled() {
                            return;
                        }
                        self.reap_namespace(&namespace.name_any(), run_uid).await;
                    }
                })
                .await;

            if self.cancel.is_cancelled() {
                return Err(Cancelled.into());
            }
            info!(run_uid, "scan finished");
            failure.into_result()
        }
        .await;

        self.notify_after(run_uid).await;
        result
    }

    /// Audit cluster-scoped resources targeted by cluster-wide policies.
    pub async fn scan_cluster_wide_resources(&self, run_uid: &str) -> Result<()> {
        self.notify_before(run_uid).await;

        let mut by_target: Vec<(TargetResource, Vec<Arc<PolicyBinding>>)> =
            self.catalog.cluster_wide_policies().into_iter().collect();
        by_target.sort_by(|a, b| a.0.cmp(&b.0));
        info!(targets = by_target.len(), run_uid, "cluster-wide scan started");

        let failure = FirstFailure::default();
        for (target, bindings) in &by_target {
            if self.cancel.is_cancelled() {
                break;
            }
            self.audit_target(target, bindings, None, run_uid, &failure)
                .await;
        }

        let result = if self.cancel.is_cancelled() {
            Err(Cancelled.into())
        } else {
            self.reap_cluster(run_uid).await;
            info!(run_uid, "cluster-wide scan finished");
            failure.into_result()
        };

        self.notify_after(run_uid).await;
        result
    }

    /* ── namespace level ── */

    async fn audit_namespace(
        &self,
        namespace: &Namespace,
        run_uid: &str,
        failure: &FirstFailure,
    ) {
        let name = namespace.name_any();
        let mut by_target: Vec<(TargetResource, Vec<Arc<PolicyBinding>>)> = self
            .catalog
            .policies_for_namespace(namespace)
            .into_iter()
            .collect();

        if by_target.is_empty() {
            debug!(namespace = %name, "no policies apply to this namespace");
            return;
        }
        by_target.sort_by(|a, b| a.0.cmp(&b.0));

        info!(namespace = %name, targets = by_target.len(), "auditing namespace");
        for (target, bindings) in &by_target {
            if self.cancel.is_cancelled() {
                return;
            }
            self.audit_target(target, bindings, Some(&name), run_uid, failure)
                .await;
        }
    }

    /* ── resource level ── */

    /// Page through one target's resources, feeding each page into the
    /// bounded resource pool as it arrives. Memory stays bounded by one page.
    async fn audit_target(
        &self,
        target: &TargetResource,
        bindings: &[Arc<PolicyBinding>],
        namespace: Option<&str>,
        run_uid: &str,
        failure: &FirstFailure,
    ) {
        let (api_resource, capabilities) = match self.k8s.resolve(target).await {
            Ok(resolved) => resolved,
            Err(err) => {
                warn!(target = %target, error = format!("{err:#}"), "skipping unresolvable target");
                return;
            }
        };

        let namespaced = matches!(capabilities.scope, Scope::Namespaced);
        match (namespace, namespaced) {
            (Some(_), false) => {
                debug!(target = %target, "cluster-scoped target skipped in namespace scan");
                return;
            }
            (None, true) => {
                debug!(target = %target, "namespaced target skipped in cluster-wide scan");
                return;
            }
            _ => {}
        }

        let api_resource = &api_resource;
        let mut continue_token: Option<String> = None;
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let (resources, next) = match self
                .k8s
                .list_page(api_resource, namespace, continue_token.as_deref())
                .await
            {
                Ok(page) => page,
                Err(err) => {
                    // One broken target must not stop the rest of the scan.
                    warn!(target = %target, error = format!("{err:#}"), "listing failed, skipping remainder of target");
                    return;
                }
            };

            stream::iter(resources)
                .for_each_concurrent(self.parallel_resources, |resource| async move {
                    self.audit_resource(bindings, api_resource, resource, run_uid, failure)
                        .await;
                })
                .await;

            continue_token = next;
            if continue_token.is_none() {
                return;
            }
        }
    }

    /* ── policy level ── */

    async fn audit_resource(
        &self,
        bindings: &[Arc<PolicyBinding>],
        api_resource: &ApiResource,
        resource: DynamicObject,
        run_uid: &str,
        failure: &FirstFailure,
    ) {
        if self.cancel.is_cancelled() {
            return;
        }

        let matched: Vec<Arc<PolicyBinding>> = bindings
            .iter()
            .filter(|binding| binding.selects(resource.labels()))
            .cloned()
            .collect();
        if matched.is_empty() {
            debug!(resource = %resource.name_any(), "no policy selects this resource");
            return;
        }

        if resource.uid().is_none() {
            warn!(resource = %resource.name_any(), "resource without uid cannot be reported");
            return;
        }

        let results = self
            .evaluator
            .evaluate_policies(&matched, &resource, api_resource)
            .await;

        // A run canceled mid-resource yields skip results; the report for it
        // is discarded rather than stored.
        if self.cancel.is_cancelled() {
            debug!(resource = %resource.name_any(), "scan canceled, discarding report");
            return;
        }

        if resource.namespace().is_some() {
            let report = PolicyReport::for_resource(run_uid, &resource, api_resource, results);
            self.emit(&report).await;
            if let Err(err) = self.store.create_or_patch_policy_report(&report).await {
                warn!(
                    report = report.metadata.name.as_deref().unwrap_or_default(),
                    error = %err,
                    "failed to store policy report"
                );
                failure.record(err.into()).await;
            }
        } else {
            let report =
                ClusterPolicyReport::for_resource(run_uid, &resource, api_resource, results);
            self.emit(&report).await;
            if let Err(err) = self
                .store
                .create_or_patch_cluster_policy_report(&report)
                .await
            {
                warn!(
                    report = report.metadata.name.as_deref().unwrap_or_default(),
                    error = %err,
                    "failed to store cluster policy report"
                );
                failure.record(err.into()).await;
            }
        }
    }

    /* ── reap & lifecycle ── */

    async fn reap_namespace(&self, namespace: &str, run_uid: &str) {
        if let Err(err) = self.store.delete_old_policy_reports(run_uid, namespace).await {
            warn!(namespace, error = %err, "failed to delete stale policy reports");
        }
    }

    async fn reap_cluster(&self, run_uid: &str) {
        if let Err(err) = self.store.delete_old_cluster_policy_reports(run_uid).await {
            warn!(error = %err, "failed to delete stale cluster policy reports");
        }
    }

    async fn notify_before(&self, run_uid: &str) {
        if let Err(err) = self.store.before_scan(run_uid).await {
            warn!(error = %err, "store rejected scan start notification");
        }
    }

    async fn notify_after(&self, run_uid: &str) {
        if let Err(err) = self.store.after_scan(run_uid).await {
            warn!(error = %err, "store rejected scan end notification");
        }
    }

    /// JSON dump of the finished report, one object per line. The lock keeps
    /// concurrent resource tasks from interleaving lines.
    async fn emit<T: Serialize>(&self, report: &T) {
        if !self.output_scan {
            return;
        }
        match serde_json::to_string(report) {
            Ok(line) => {
                let _guard = self.stdout.lock().await;
                println!("{line}");
            }
            Err(err) => warn!(error = %err, "failed to serialize report for stdout"),
        }
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    // ── FirstFailure ──

    #[tokio::test]
    async fn test_first_failure_keeps_first_error_only() {
        let failure = FirstFailure::default();
        failure.record(anyhow::anyhow!("first")).await;
        failure.record(anyhow::anyhow!("second")).await;

        let err = failure.into_result().unwrap_err();
        assert_eq!(err.to_string(), "first");
    }

    #[tokio::test]
    async fn test_first_failure_empty_is_ok() {
        let failure = FirstFailure::default();
        assert!(failure.into_result().is_ok());
    }
}
