#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, RawQuery, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::core::{ApiResource, DynamicObject};
use serde_json::{Value, json};

use audit_scanner::crd::{AdmissionPolicy, AdmissionPolicySpec, Policy, PolicyState, PolicyStatus};
use audit_scanner::policies::{PolicyBinding, PolicyEndpoint};

/* ============================= RESOURCE BUILDERS ============================= */

pub fn pod_api_resource() -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        plural: "pods".to_string(),
    }
}

pub fn namespace_api_resource() -> ApiResource {
    ApiResource {
        group: String::new(),
        version: "v1".to_string(),
        api_version: "v1".to_string(),
        kind: "Namespace".to_string(),
        plural: "namespaces".to_string(),
    }
}

pub fn pod(name: &str, namespace: &str, uid: &str, labels: &[(&str, &str)]) -> DynamicObject {
    let mut object = DynamicObject::new(name, &pod_api_resource());
    object.metadata.namespace = Some(namespace.to_string());
    object.metadata.uid = Some(uid.to_string());
    if !labels.is_empty() {
        object.metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<BTreeMap<_, _>>(),
        );
    }
    object
}

pub fn admission_policy(name: &str, namespace: &str) -> Policy {
    Policy::Admission(AdmissionPolicy {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: AdmissionPolicySpec::default(),
        status: Some(PolicyStatus {
            policy_status: Some(PolicyState::Active),
        }),
    })
}

/// A binding routed to `base_url`, the way the catalog would resolve it.
pub fn binding(policy_name: &str, base_url: &str) -> Arc<PolicyBinding> {
    Arc::new(PolicyBinding {
        policy: admission_policy(policy_name, "n1"),
        endpoint: PolicyEndpoint::Resolved(format!("{base_url}/audit/{policy_name}")),
    })
}

/* ============================= MOCK POLICY SERVER ============================= */

/// Scripted behavior of the mock policy server for one policy name.
#[derive(Clone)]
pub enum PolicyBehavior {
    Allow,
    AllowAfter(Duration),
    Deny { message: String, code: i32 },
    HttpError(u16),
    Garbage,
}

/// Tracks how many admission requests are in flight at once.
#[derive(Clone, Default)]
pub struct InFlight {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl InFlight {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct PolicyServerState {
    behaviors: Arc<HashMap<String, PolicyBehavior>>,
    in_flight: InFlight,
}

/// Start a policy server answering `/audit/{policy}` with the scripted
/// behavior. Returns its base URL and the in-flight gauge.
pub async fn start_policy_server(
    behaviors: HashMap<String, PolicyBehavior>,
) -> (String, InFlight) {
    let state = PolicyServerState {
        behaviors: Arc::new(behaviors),
        in_flight: InFlight::default(),
    };
    let in_flight = state.in_flight.clone();

    let app = Router::new()
        .route("/audit/{policy}", post(audit_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock policy server");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock policy server failed");
    });

    (format!("http://{addr}"), in_flight)
}

async fn audit_handler(
    State(state): State<PolicyServerState>,
    Path(policy): Path<String>,
) -> Response {
    state.in_flight.enter();
    let response = match state.behaviors.get(&policy) {
        Some(PolicyBehavior::Allow) | None => Json(allowed_review()).into_response(),
        Some(PolicyBehavior::AllowAfter(delay)) => {
            tokio::time::sleep(*delay).await;
            Json(allowed_review()).into_response()
        }
        Some(PolicyBehavior::Deny { message, code }) => {
            Json(denied_review(message, *code)).into_response()
        }
        Some(PolicyBehavior::HttpError(status)) => {
            StatusCode::from_u16(*status).expect("valid status code").into_response()
        }
        Some(PolicyBehavior::Garbage) => "this is not an admission review".into_response(),
    };
    state.in_flight.exit();
    response
}

fn allowed_review() -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": "review-uid",
            "allowed": true,
            "status": {},
        },
    })
}

fn denied_review(message: &str, code: i32) -> Value {
    json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": "review-uid",
            "allowed": false,
            "status": {
                "message": message,
                "code": code,
            },
        },
    })
}

/* ============================= MOCK INTAKE SERVER ============================= */

/// One request captured by the mock observability intake endpoint.
#[derive(Clone, Debug)]
pub struct IntakeRequest {
    pub query: String,
    pub body: Value,
}

#[derive(Clone)]
struct IntakeState {
    requests: Arc<Mutex<Vec<IntakeRequest>>>,
    status: StatusCode,
}

/// Start a mock SUSE Observability receiver and capture everything POSTed to
/// the intake path. `status` is the response every request gets.
pub async fn start_intake_server(status: u16) -> (String, Arc<Mutex<Vec<IntakeRequest>>>) {
    let requests: Arc<Mutex<Vec<IntakeRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let state = IntakeState {
        requests: requests.clone(),
        status: StatusCode::from_u16(status).expect("valid status code"),
    };

    let app = Router::new()
        .route("/receiver/stsAgent/intake", post(intake_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind mock intake server");
    let addr = listener.local_addr().expect("listener has an address");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("mock intake server failed");
    });

    (format!("http://{addr}"), requests)
}

async fn intake_handler(
    State(state): State<IntakeState>,
    RawQuery(query): RawQuery,
    body: String,
) -> Response {
    let body: Value = serde_json::from_str(&body).expect("intake body is JSON");
    state.requests.lock().unwrap().push(IntakeRequest {
        query: query.unwrap_or_default(),
        body,
    });
    state.status.into_response()
}
