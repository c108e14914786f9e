use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use kube::ResourceExt;
use kube::core::admission::{AdmissionResponse, AdmissionReview};
use kube::core::{ApiResource, DynamicObject};
use rustls::DigitallySignedStruct;
use rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cancellation::CancellationToken;
use crate::crd::Policy;
use crate::policies::{PolicyBinding, PolicyEndpoint};
use crate::report::{PolicyReportResult, PolicyResult};

/// Username the synthetic admission request is attributed to.
const AUDIT_USER: &str = "audit-scanner";

pub(crate) type HttpClient = HyperClient<HttpsConnector<HttpConnector>, Full<Bytes>>;

/* ============================= TLS ============================= */

/// TLS material for talking to PolicyServer endpoints.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    /// Skip server certificate validation. Development only.
    pub insecure: bool,
    /// Extra CA bundle in PEM format, appended to the platform roots.
    pub ca_file: Option<PathBuf>,
    /// Client certificate in PEM format for mTLS.
    pub client_cert: Option<PathBuf>,
    /// Client key in PEM format for mTLS. Must be set together with the cert.
    pub client_key: Option<PathBuf>,
}

/// Build the shared HTTPS client used for a whole scan.
///
/// Plain HTTP endpoints are also accepted so `--policy-server-url` can point
/// at a local development server.
pub(crate) fn build_http_client(tls: &TlsOptions) -> Result<HttpClient> {
    // First caller wins; later installs fail harmlessly once a process-wide
    // provider exists.
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(build_tls_config(tls)?)
        .https_or_http()
        .enable_http1()
        .build();
    Ok(HyperClient::builder(TokioExecutor::new()).build(connector))
}

fn build_tls_config(tls: &TlsOptions) -> Result<rustls::ClientConfig> {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
        // Unusable platform certificates are not fatal.
        let _ = roots.add(cert);
    }

    if let Some(path) = &tls.ca_file {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read CA bundle {}", path.display()))?;
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert
                .with_context(|| format!("invalid certificate in CA bundle {}", path.display()))?;
            roots
                .add(cert)
                .with_context(|| format!("unusable certificate in CA bundle {}", path.display()))?;
        }
    }

    let builder = rustls::ClientConfig::builder().with_root_certificates(roots);

    let mut config = match (&tls.client_cert, &tls.client_key) {
        (Some(cert_path), Some(key_path)) => {
            let cert_pem = std::fs::read(cert_path)
                .with_context(|| format!("failed to read client cert {}", cert_path.display()))?;
            let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
                .collect::<std::result::Result<Vec<_>, _>>()
                .with_context(|| format!("invalid client cert {}", cert_path.display()))?;

            let key_pem = std::fs::read(key_path)
                .with_context(|| format!("failed to read client key {}", key_path.display()))?;
            let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                .with_context(|| format!("invalid client key {}", key_path.display()))?
                .ok_or_else(|| anyhow!("no private key found in {}", key_path.display()))?;

            builder
                .with_client_auth_cert(certs, key)
                .context("client certificate and key do not form a usable identity")?
        }
        (None, None) => builder.with_no_client_auth(),
        _ => anyhow::bail!("client cert and client key must be provided together"),
    };

    if tls.insecure {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(InsecureVerifier::new()));
    }

    Ok(config)
}

/// Accepts any server certificate. Only installed with `--insecure-ssl`.
#[derive(Debug)]
struct InsecureVerifier {
    provider: rustls::crypto::CryptoProvider,
}

impl InsecureVerifier {
    fn new() -> Self {
        Self {
            provider: rustls::crypto::aws_lc_rs::default_provider(),
        }
    }
}

impl ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/* ============================= ERRORS ============================= */

#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("policy server endpoint unavailable: {0}")]
    Endpoint(String),

    #[error("request to policy server failed: {0}")]
    Request(String),

    #[error("policy server returned HTTP {0}")]
    HttpStatus(hyper::StatusCode),

    #[error("invalid admission review response: {0}")]
    Response(String),
}

/* ============================= EVALUATOR ============================= */

/// Client side of the PolicyServer admission protocol.
///
/// One instance, and therefore one connection pool, is shared by a whole
/// scan.
pub struct PolicyEvaluator {
    client: HttpClient,
    parallel_policies: usize,
    cancel: CancellationToken,
}

impl PolicyEvaluator {
    pub fn new(
        tls: &TlsOptions,
        parallel_policies: usize,
        cancel: CancellationToken,
    ) -> Result<Self> {
        Ok(Self {
            client: build_http_client(tls)?,
            parallel_policies: parallel_policies.max(1),
            cancel,
        })
    }

    /// Evaluate one policy against one resource.
    ///
    /// This never fails: transport and protocol problems are folded into an
    /// `error` entry for the resource's report, and a run canceled before or
    /// during the request yields a `skip` entry instead.
    pub async fn evaluate(
        &self,
        binding: &PolicyBinding,
        resource: &DynamicObject,
        api_resource: &ApiResource,
    ) -> PolicyReportResult {
        if self.cancel.is_cancelled() {
            return skip_result(&binding.policy);
        }

        let review = tokio::select! {
            review = self.post_admission_review(binding, resource, api_resource) => review,
            _ = self.cancel.cancelled() => {
                debug!(
                    policy = binding.policy.name(),
                    resource = %resource.name_any(),
                    "evaluation canceled mid-flight"
                );
                return skip_result(&binding.policy);
            }
        };

        match review {
            Ok(response) => result_from_response(&binding.policy, &response),
            Err(err) => {
                warn!(
                    policy = binding.policy.name(),
                    resource = %resource.name_any(),
                    error = %err,
                    "policy evaluation errored"
                );
                error_result(&binding.policy, &err.to_string())
            }
        }
    }

    /// Evaluate all policies for one resource, at most `parallel_policies`
    /// in flight at a time.
    ///
    /// Results come back in the order of `bindings` regardless of which
    /// policy server answered first, so reports are stable across runs.
    /// Permit acquisition races the cancellation token, so queued work is
    /// abandoned as a `skip` result once the run is canceled.
    pub async fn evaluate_policies(
        &self,
        bindings: &[Arc<PolicyBinding>],
        resource: &DynamicObject,
        api_resource: &ApiResource,
    ) -> Vec<PolicyReportResult> {
        let permits = Arc::new(Semaphore::new(self.parallel_policies));

        let evaluations = bindings.iter().map(|binding| {
            let permits = permits.clone();
            async move {
                let _permit = tokio::select! {
                    permit = permits.acquire() => permit.expect("semaphore is never closed"),
                    _ = self.cancel.cancelled() => return skip_result(&binding.policy),
                };
                self.evaluate(binding, resource, api_resource).await
            }
        });

        futures::future::join_all(evaluations).await
    }

    async fn post_admission_review(
        &self,
        binding: &PolicyBinding,
        resource: &DynamicObject,
        api_resource: &ApiResource,
    ) -> std::result::Result<AdmissionResponse, EvaluationError> {
        let url = match &binding.endpoint {
            PolicyEndpoint::Resolved(url) => url,
            PolicyEndpoint::Failed(reason) => {
                return Err(EvaluationError::Endpoint(reason.clone()));
            }
        };

        let body = admission_review_request(resource, api_resource)
            .map_err(|err| EvaluationError::Request(err.to_string()))?;
        let request = hyper::Request::builder()
            .method(hyper::Method::POST)
            .uri(url)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|err| EvaluationError::Request(err.to_string()))?;

        let response = self
            .client
            .request(request)
            .await
            .map_err(|err| EvaluationError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(EvaluationError::HttpStatus(status));
        }

        let bytes = response
            .into_body()
            .collect()
            .await
            .map_err(|err| EvaluationError::Request(err.to_string()))?
            .to_bytes();
        let review: AdmissionReview<DynamicObject> = serde_json::from_slice(&bytes)
            .map_err(|err| EvaluationError::Response(err.to_string()))?;

        review
            .response
            .ok_or_else(|| EvaluationError::Response("missing response block".to_string()))
    }
}

/* ============================= ADMISSION REVIEW ============================= */

/// Serialize a synthetic CREATE admission of the resource.
fn admission_review_request(
    resource: &DynamicObject,
    api_resource: &ApiResource,
) -> serde_json::Result<Vec<u8>> {
    let mut object = serde_json::to_value(resource)?;
    // Listed objects come back without type information; the policy sees the
    // same shape a live admission request would carry.
    object["apiVersion"] = Value::String(api_resource.api_version.clone());
    object["kind"] = Value::String(api_resource.kind.clone());

    let review = json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "request": {
            "uid": Uuid::new_v4().to_string(),
            "kind": {
                "group": api_resource.group,
                "version": api_resource.version,
                "kind": api_resource.kind,
            },
            "resource": {
                "group": api_resource.group,
                "version": api_resource.version,
                "resource": api_resource.plural,
            },
            "name": resource.name_any(),
            "namespace": resource.namespace(),
            "operation": "CREATE",
            "userInfo": {
                "username": AUDIT_USER,
                "groups": [AUDIT_USER],
            },
            "object": object,
        },
    });

    serde_json::to_vec(&review)
}

/* ============================= RESULT MAPPING ============================= */

fn base_result(policy: &Policy, result: PolicyResult, description: String) -> PolicyReportResult {
    PolicyReportResult {
        policy: policy.name().to_string(),
        result,
        description,
        severity: policy.severity().map(str::to_string),
        category: policy.category().map(str::to_string),
    }
}

fn result_from_response(policy: &Policy, response: &AdmissionResponse) -> PolicyReportResult {
    if response.allowed {
        return base_result(policy, PolicyResult::Pass, String::new());
    }

    let message = response.result.message.clone();
    let code = response.result.code;
    let description = match (message.is_empty(), code != 0) {
        (false, true) => format!("{message} (code {code})"),
        (false, false) => message,
        (true, true) => format!("request rejected with code {code}"),
        (true, false) => String::new(),
    };

    base_result(policy, PolicyResult::Fail, description)
}

fn error_result(policy: &Policy, message: &str) -> PolicyReportResult {
    base_result(policy, PolicyResult::Error, message.to_string())
}

fn skip_result(policy: &Policy) -> PolicyReportResult {
    base_result(
        policy,
        PolicyResult::Skip,
        "evaluation canceled before completion".to_string(),
    )
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        AdmissionPolicy, AdmissionPolicySpec, CATEGORY_ANNOTATION, SEVERITY_ANNOTATION,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn policy(name: &str) -> Policy {
        Policy::Admission(AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                ..Default::default()
            },
            spec: AdmissionPolicySpec::default(),
            status: None,
        })
    }

    fn annotated_policy(name: &str) -> Policy {
        Policy::Admission(AdmissionPolicy {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("ns".to_string()),
                annotations: Some(BTreeMap::from([
                    (SEVERITY_ANNOTATION.to_string(), "high".to_string()),
                    (CATEGORY_ANNOTATION.to_string(), "PSP".to_string()),
                ])),
                ..Default::default()
            },
            spec: AdmissionPolicySpec::default(),
            status: None,
        })
    }

    fn pod_api_resource() -> ApiResource {
        ApiResource {
            group: String::new(),
            version: "v1".to_string(),
            api_version: "v1".to_string(),
            kind: "Pod".to_string(),
            plural: "pods".to_string(),
        }
    }

    fn pod(name: &str) -> DynamicObject {
        let mut object = DynamicObject::new(name, &pod_api_resource());
        object.metadata.namespace = Some("ns".to_string());
        object.metadata.uid = Some(format!("{name}-uid"));
        object
    }

    // Built from wire JSON so the test exercises the same shape a
    // PolicyServer actually produces.
    fn response(allowed: bool, message: Option<&str>, code: Option<i32>) -> AdmissionResponse {
        let mut status = serde_json::Map::new();
        if let Some(message) = message {
            status.insert("message".to_string(), json!(message));
        }
        if let Some(code) = code {
            status.insert("code".to_string(), json!(code));
        }
        serde_json::from_value(json!({
            "uid": "review-uid",
            "allowed": allowed,
            "status": status,
        }))
        .unwrap()
    }

    // ── result mapping ──

    #[test]
    fn test_allowed_maps_to_pass() {
        let result = result_from_response(&policy("a"), &response(true, None, None));
        assert_eq!(result.policy, "a");
        assert_eq!(result.result, PolicyResult::Pass);
        assert!(result.description.is_empty());
    }

    #[test]
    fn test_denied_maps_to_fail_with_message_and_code() {
        let result = result_from_response(
            &policy("a"),
            &response(false, Some("privileged pod not allowed"), Some(400)),
        );
        assert_eq!(result.result, PolicyResult::Fail);
        assert_eq!(result.description, "privileged pod not allowed (code 400)");
    }

    #[test]
    fn test_denied_without_status_details() {
        let result = result_from_response(&policy("a"), &response(false, None, None));
        assert_eq!(result.result, PolicyResult::Fail);
        assert!(result.description.is_empty());
    }

    #[test]
    fn test_denied_with_code_only() {
        let result = result_from_response(&policy("a"), &response(false, None, Some(500)));
        assert_eq!(result.description, "request rejected with code 500");
    }

    #[test]
    fn test_results_carry_policy_severity_and_category() {
        let result = result_from_response(&annotated_policy("a"), &response(true, None, None));
        assert_eq!(result.severity.as_deref(), Some("high"));
        assert_eq!(result.category.as_deref(), Some("PSP"));
    }

    #[test]
    fn test_error_result() {
        let result = error_result(&policy("a"), "connection refused");
        assert_eq!(result.result, PolicyResult::Error);
        assert_eq!(result.description, "connection refused");
    }

    // ── request construction ──

    #[test]
    fn test_admission_review_request_shape() {
        let body = admission_review_request(&pod("p1"), &pod_api_resource()).unwrap();
        let review: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(review["apiVersion"], "admission.k8s.io/v1");
        assert_eq!(review["kind"], "AdmissionReview");

        let request = &review["request"];
        assert!(!request["uid"].as_str().unwrap().is_empty());
        assert_eq!(request["operation"], "CREATE");
        assert_eq!(request["name"], "p1");
        assert_eq!(request["namespace"], "ns");
        assert_eq!(request["kind"]["kind"], "Pod");
        assert_eq!(request["resource"]["resource"], "pods");
        assert_eq!(request["userInfo"]["username"], "audit-scanner");
    }

    #[test]
    fn test_admission_review_injects_object_type_information() {
        let mut untyped = pod("p1");
        untyped.types = None;

        let body = admission_review_request(&untyped, &pod_api_resource()).unwrap();
        let review: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(review["request"]["object"]["apiVersion"], "v1");
        assert_eq!(review["request"]["object"]["kind"], "Pod");
    }

    #[test]
    fn test_request_uids_are_unique() {
        let first = admission_review_request(&pod("p1"), &pod_api_resource()).unwrap();
        let second = admission_review_request(&pod("p1"), &pod_api_resource()).unwrap();
        let first: Value = serde_json::from_slice(&first).unwrap();
        let second: Value = serde_json::from_slice(&second).unwrap();
        assert_ne!(first["request"]["uid"], second["request"]["uid"]);
    }

    // ── endpoint failures ──

    #[tokio::test]
    async fn test_unresolved_endpoint_becomes_error_result() {
        let evaluator =
            PolicyEvaluator::new(&TlsOptions::default(), 5, CancellationToken::new()).unwrap();
        let binding = PolicyBinding {
            policy: policy("broken"),
            endpoint: PolicyEndpoint::Failed("policy server default: no service".to_string()),
        };

        let result = evaluator
            .evaluate(&binding, &pod("p1"), &pod_api_resource())
            .await;
        assert_eq!(result.result, PolicyResult::Error);
        assert!(result.description.contains("no service"));
    }

    // ── cancellation ──

    #[tokio::test]
    async fn test_canceled_run_maps_evaluation_to_skip() {
        let cancel = CancellationToken::new();
        let evaluator = PolicyEvaluator::new(&TlsOptions::default(), 5, cancel.clone()).unwrap();
        cancel.cancel();

        let binding = PolicyBinding {
            policy: policy("a"),
            endpoint: PolicyEndpoint::Resolved("http://127.0.0.1:1/audit/a".to_string()),
        };

        // The canceled token short-circuits before any request is made.
        let result = evaluator
            .evaluate(&binding, &pod("p1"), &pod_api_resource())
            .await;
        assert_eq!(result.result, PolicyResult::Skip);
        assert!(result.description.contains("canceled"));
    }

    #[tokio::test]
    async fn test_canceled_run_skips_queued_policies() {
        let cancel = CancellationToken::new();
        let evaluator = PolicyEvaluator::new(&TlsOptions::default(), 2, cancel.clone()).unwrap();
        cancel.cancel();

        let bindings: Vec<Arc<PolicyBinding>> = (0..4)
            .map(|i| {
                Arc::new(PolicyBinding {
                    policy: policy(&format!("p{i}")),
                    endpoint: PolicyEndpoint::Resolved(format!("http://127.0.0.1:1/audit/p{i}")),
                })
            })
            .collect();

        let results = evaluator
            .evaluate_policies(&bindings, &pod("p1"), &pod_api_resource())
            .await;
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| r.result == PolicyResult::Skip));
        // Slot order still follows the binding order.
        assert_eq!(results[0].policy, "p0");
        assert_eq!(results[3].policy, "p3");
    }
}
