use std::collections::HashMap;
use std::time::Duration;

use audit_scanner::cancellation::CancellationToken;
use audit_scanner::evaluator::{PolicyEvaluator, TlsOptions};
use audit_scanner::report::PolicyResult;

mod common;

use common::{PolicyBehavior, binding, pod, pod_api_resource, start_policy_server};

fn evaluator(parallel_policies: usize) -> PolicyEvaluator {
    evaluator_with(parallel_policies, CancellationToken::new())
}

fn evaluator_with(parallel_policies: usize, cancel: CancellationToken) -> PolicyEvaluator {
    PolicyEvaluator::new(&TlsOptions::default(), parallel_policies, cancel)
        .expect("evaluator construction should succeed")
}

#[tokio::test]
async fn test_allowing_policy_produces_pass_result() {
    let (url, _) = start_policy_server(HashMap::from([(
        "a".to_string(),
        PolicyBehavior::Allow,
    )]))
    .await;

    let results = evaluator(5)
        .evaluate_policies(
            &[binding("a", &url)],
            &pod("p1", "n1", "p1-uid", &[]),
            &pod_api_resource(),
        )
        .await;

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].policy, "a");
    assert_eq!(results[0].result, PolicyResult::Pass);
}

#[tokio::test]
async fn test_denying_policy_produces_fail_result_with_message() {
    let (url, _) = start_policy_server(HashMap::from([(
        "a".to_string(),
        PolicyBehavior::Deny {
            message: "privileged pod not allowed".to_string(),
            code: 400,
        },
    )]))
    .await;

    let results = evaluator(5)
        .evaluate_policies(
            &[binding("a", &url)],
            &pod("p1", "n1", "p1-uid", &[]),
            &pod_api_resource(),
        )
        .await;

    assert_eq!(results[0].result, PolicyResult::Fail);
    assert_eq!(results[0].description, "privileged pod not allowed (code 400)");
}

#[tokio::test]
async fn test_results_follow_policy_order_not_completion_order() {
    let (url, _) = start_policy_server(HashMap::from([
        (
            "slow".to_string(),
            PolicyBehavior::AllowAfter(Duration::from_millis(300)),
        ),
        ("fast".to_string(), PolicyBehavior::Allow),
    ]))
    .await;

    let bindings = [binding("slow", &url), binding("fast", &url)];
    let results = evaluator(5)
        .evaluate_policies(&bindings, &pod("p1", "n1", "p1-uid", &[]), &pod_api_resource())
        .await;

    // The fast policy answers first, but the slot order is the binding order.
    assert_eq!(results[0].policy, "slow");
    assert_eq!(results[1].policy, "fast");
    assert!(results.iter().all(|r| r.result == PolicyResult::Pass));
}

#[tokio::test]
async fn test_server_error_does_not_poison_other_policies() {
    let (url, _) = start_policy_server(HashMap::from([
        ("a".to_string(), PolicyBehavior::Allow),
        ("b".to_string(), PolicyBehavior::HttpError(500)),
    ]))
    .await;

    let bindings = [binding("a", &url), binding("b", &url)];
    let results = evaluator(5)
        .evaluate_policies(&bindings, &pod("p1", "n1", "p1-uid", &[]), &pod_api_resource())
        .await;

    assert_eq!(results.len(), 2);
    assert_eq!(results[0].policy, "a");
    assert_eq!(results[0].result, PolicyResult::Pass);
    assert_eq!(results[1].policy, "b");
    assert_eq!(results[1].result, PolicyResult::Error);
    assert!(results[1].description.contains("500"));
}

#[tokio::test]
async fn test_unparsable_response_is_an_error_result() {
    let (url, _) = start_policy_server(HashMap::from([(
        "a".to_string(),
        PolicyBehavior::Garbage,
    )]))
    .await;

    let results = evaluator(5)
        .evaluate_policies(
            &[binding("a", &url)],
            &pod("p1", "n1", "p1-uid", &[]),
            &pod_api_resource(),
        )
        .await;

    assert_eq!(results[0].result, PolicyResult::Error);
}

#[tokio::test]
async fn test_unreachable_server_is_an_error_result() {
    // Grab a free port, then close the listener so nothing answers.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let results = evaluator(5)
        .evaluate_policies(
            &[binding("a", &format!("http://{addr}"))],
            &pod("p1", "n1", "p1-uid", &[]),
            &pod_api_resource(),
        )
        .await;

    assert_eq!(results[0].result, PolicyResult::Error);
}

#[tokio::test]
async fn test_cancellation_turns_pending_evaluations_into_skips() {
    let behaviors: HashMap<String, PolicyBehavior> = (0..3)
        .map(|i| {
            (
                format!("p{i}"),
                PolicyBehavior::AllowAfter(Duration::from_secs(5)),
            )
        })
        .collect();
    let (url, _) = start_policy_server(behaviors).await;

    let cancel = CancellationToken::new();
    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    // With one permit, p0 is in flight when the cancel fires and p1/p2 are
    // still waiting on the semaphore; all three end up as skips without
    // waiting out the 5s responses.
    let bindings: Vec<_> = (0..3).map(|i| binding(&format!("p{i}"), &url)).collect();
    let results = tokio::time::timeout(
        Duration::from_secs(2),
        evaluator_with(1, cancel).evaluate_policies(
            &bindings,
            &pod("p1", "n1", "p1-uid", &[]),
            &pod_api_resource(),
        ),
    )
    .await
    .expect("canceled evaluations should not wait for slow responses");

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.result == PolicyResult::Skip));
    assert_eq!(results[0].policy, "p0");
    assert_eq!(results[2].policy, "p2");
}

#[tokio::test]
async fn test_policy_fanout_respects_concurrency_bound() {
    let behaviors: HashMap<String, PolicyBehavior> = (0..8)
        .map(|i| {
            (
                format!("p{i}"),
                PolicyBehavior::AllowAfter(Duration::from_millis(50)),
            )
        })
        .collect();
    let (url, in_flight) = start_policy_server(behaviors).await;

    let bindings: Vec<_> = (0..8).map(|i| binding(&format!("p{i}"), &url)).collect();
    let results = evaluator(2)
        .evaluate_policies(&bindings, &pod("p1", "n1", "p1-uid", &[]), &pod_api_resource())
        .await;

    assert_eq!(results.len(), 8);
    assert!(results.iter().all(|r| r.result == PolicyResult::Pass));
    assert!(
        in_flight.peak() <= 2,
        "at most 2 evaluations may be in flight, saw {}",
        in_flight.peak()
    );
}
