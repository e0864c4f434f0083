use std::time::{Duration, Instant};

use gce_scaler::fleet::{ComputeClient, FleetClient, FleetError, LaunchRequest, TokenSource};
use gce_scaler_reconcile::BackoffPolicy;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{
    body_json, body_partial_json, header, method, path, path_regex, query_param,
    query_param_is_missing,
};
use wiremock::{Mock, MockServer, ResponseTemplate};

const ZONE: &str = "/projects/proj/zones/us-central1-a";

fn fast_backoff() -> BackoffPolicy {
    BackoffPolicy::deterministic(Duration::from_millis(10), 1.0, Duration::from_millis(10))
}

fn client(server: &MockServer) -> ComputeClient {
    ComputeClient::new(
        &server.uri(),
        TokenSource::Static("test-token".to_string()),
        fast_backoff(),
    )
    .unwrap()
}

fn launch_request() -> LaunchRequest {
    LaunchRequest {
        project: "proj".to_string(),
        zone: "us-central1-a".to_string(),
        group: "agents".to_string(),
        template: "agent".to_string(),
        max_run_duration_secs: 3600,
    }
}

fn operation(name: &str, status: &str) -> Value {
    json!({"kind": "compute#operation", "name": name, "status": status})
}

async fn mount_insert(server: &MockServer, target_link: &str) {
    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instances")))
        .and(query_param(
            "sourceInstanceTemplate",
            "projects/proj/global/instanceTemplates/agent",
        ))
        .and(header("authorization", "Bearer test-token"))
        .and(body_partial_json(json!({
            "scheduling": {
                "instanceTerminationAction": "DELETE",
                "maxRunDuration": {"seconds": "3600"}
            }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "op-insert",
            "status": "RUNNING",
            "targetLink": target_link,
        })))
        .expect(1)
        .mount(server)
        .await;
}

async fn mount_operation(server: &MockServer, name: &str, body: Value, times: u64) {
    Mock::given(method("GET"))
        .and(path(format!("{ZONE}/operations/{name}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .expect(times)
        .mount(server)
        .await;
}

async fn mount_delete(server: &MockServer, times: u64) {
    Mock::given(method("DELETE"))
        .and(path_regex(format!(r"^{ZONE}/instances/agent-[0-9a-f]{{6}}$")))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-delete", "PENDING")))
        .expect(times)
        .mount(server)
        .await;
}

#[tokio::test]
async fn live_count_follows_pages_and_filters_status() {
    let server = MockServer::start().await;
    let list = format!("{ZONE}/instanceGroups/agents/listInstances");

    Mock::given(method("POST"))
        .and(path(list.clone()))
        .and(query_param_is_missing("pageToken"))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({"instanceState": "ALL"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"instance": "https://compute/instances/a", "status": "RUNNING"},
                {"instance": "https://compute/instances/b", "status": "PROVISIONING"},
                {"instance": "https://compute/instances/c", "status": "STOPPING"}
            ],
            "nextPageToken": "page-2"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(list))
        .and(query_param("pageToken", "page-2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [
                {"instance": "https://compute/instances/d", "status": "TERMINATED"},
                {"instance": "https://compute/instances/e", "status": "RUNNING"},
                {"instance": "https://compute/instances/f", "status": "STAGING"}
            ]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let count = client(&server)
        .live_instance_count("proj", "us-central1-a", "agents")
        .await
        .unwrap();

    assert_eq!(count, 3);
}

#[tokio::test]
async fn empty_group_counts_zero() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/listInstances")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "compute#instanceGroupsListInstances"
        })))
        .mount(&server)
        .await;

    let count = client(&server)
        .live_instance_count("proj", "us-central1-a", "agents")
        .await
        .unwrap();

    assert_eq!(count, 0);
}

#[tokio::test]
async fn missing_group_is_api_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/listInstances")))
        .respond_with(ResponseTemplate::new(404).set_body_string("group not found"))
        .mount(&server)
        .await;

    let err = client(&server)
        .live_instance_count("proj", "us-central1-a", "agents")
        .await
        .unwrap_err();

    match err {
        FleetError::Api { status, body, .. } => {
            assert_eq!(status, 404);
            assert_eq!(body, "group not found");
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn launch_creates_waits_and_attaches() {
    let server = MockServer::start().await;
    let link = format!("{}{ZONE}/instances/agent-0a1b2c", server.uri());

    mount_insert(&server, &link).await;

    // Insert operation reports RUNNING once before finishing.
    Mock::given(method("GET"))
        .and(path(format!("{ZONE}/operations/op-insert")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-insert", "RUNNING")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    mount_operation(&server, "op-insert", operation("op-insert", "DONE"), 1).await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/addInstances")))
        .and(header("authorization", "Bearer test-token"))
        .and(body_json(json!({"instances": [{"instance": link}]})))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-add", "PENDING")))
        .expect(1)
        .mount(&server)
        .await;
    mount_operation(&server, "op-add", operation("op-add", "DONE"), 1).await;

    client(&server)
        .launch_instance(&CancellationToken::new(), &launch_request())
        .await
        .unwrap();

    let requests = server.received_requests().await.unwrap();
    let insert = requests
        .iter()
        .find(|r| r.url.path() == format!("{ZONE}/instances"))
        .unwrap();
    let body: Value = insert.body_json().unwrap();
    let name = body["name"].as_str().unwrap();
    let suffix = name.strip_prefix("agent-").unwrap();
    assert_eq!(suffix.len(), 6);
    assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn failed_attach_operation_stops_polling() {
    let server = MockServer::start().await;
    let link = format!("{}{ZONE}/instances/agent-0a1b2c", server.uri());

    mount_insert(&server, &link).await;
    mount_operation(&server, "op-insert", operation("op-insert", "DONE"), 1).await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/addInstances")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-add", "RUNNING")))
        .mount(&server)
        .await;
    mount_operation(
        &server,
        "op-add",
        json!({
            "name": "op-add",
            "status": "DONE",
            "error": {"errors": [
                {"code": "RESOURCE_NOT_FOUND", "message": "instance not found"}
            ]}
        }),
        1,
    )
    .await;
    mount_delete(&server, 0).await;

    let err = client(&server)
        .launch_instance(&CancellationToken::new(), &launch_request())
        .await
        .unwrap_err();

    match err {
        FleetError::Operation { operation, issues } => {
            assert_eq!(operation, "op-add");
            assert_eq!(issues.len(), 1);
            assert_eq!(issues[0].code, "RESOURCE_NOT_FOUND");
        }
        other => panic!("expected operation error, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_insert_never_attaches() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instances")))
        .respond_with(ResponseTemplate::new(403).set_body_string("permission denied"))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/addInstances")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-add", "DONE")))
        .expect(0)
        .mount(&server)
        .await;
    mount_delete(&server, 0).await;

    let err = client(&server)
        .launch_instance(&CancellationToken::new(), &launch_request())
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Api { status: 403, .. }));
    assert!(err.to_string().contains("permission denied"));
}

#[tokio::test]
async fn stuck_operation_times_out() {
    let server = MockServer::start().await;
    let link = format!("{}{ZONE}/instances/agent-0a1b2c", server.uri());

    mount_insert(&server, &link).await;
    Mock::given(method("GET"))
        .and(path(format!("{ZONE}/operations/op-insert")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-insert", "RUNNING")))
        .mount(&server)
        .await;

    mount_delete(&server, 1).await;

    let backoff = fast_backoff().with_max_elapsed(Some(Duration::from_millis(50)));
    let client = ComputeClient::new(
        &server.uri(),
        TokenSource::Static("test-token".to_string()),
        backoff,
    )
    .unwrap();

    let err = client
        .launch_instance(&CancellationToken::new(), &launch_request())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        FleetError::OperationTimedOut { ref operation, .. } if operation == "op-insert"
    ));
}

#[tokio::test]
async fn cancelled_launch_deletes_unattached_instance() {
    let server = MockServer::start().await;
    let link = format!("{}{ZONE}/instances/agent-0a1b2c", server.uri());

    mount_insert(&server, &link).await;
    Mock::given(method("GET"))
        .and(path(format!("{ZONE}/operations/op-insert")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-insert", "RUNNING")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/addInstances")))
        .respond_with(ResponseTemplate::new(200).set_body_json(operation("op-add", "DONE")))
        .expect(0)
        .mount(&server)
        .await;
    mount_delete(&server, 1).await;

    let client = client(&server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();

    let request = launch_request();
    let (result, _) = tokio::join!(client.launch_instance(&cancel, &request), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    assert!(matches!(result, Err(FleetError::Cancelled)));
}

#[tokio::test]
async fn cancel_interrupts_slow_insert() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instances")))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(operation("op-insert", "RUNNING"))
                .set_delay(Duration::from_secs(5)),
        )
        .mount(&server)
        .await;
    mount_delete(&server, 1).await;

    let client = client(&server);
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    let started = Instant::now();

    let request = launch_request();
    let (result, _) = tokio::join!(client.launch_instance(&cancel, &request), async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    assert!(matches!(result, Err(FleetError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(2), "took {:?}", started.elapsed());
}

#[tokio::test]
async fn rejected_attach_deletes_instance() {
    let server = MockServer::start().await;
    let link = format!("{}{ZONE}/instances/agent-0a1b2c", server.uri());

    mount_insert(&server, &link).await;
    mount_operation(&server, "op-insert", operation("op-insert", "DONE"), 1).await;
    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/addInstances")))
        .respond_with(ResponseTemplate::new(400).set_body_string("wrong network"))
        .expect(1)
        .mount(&server)
        .await;
    mount_delete(&server, 1).await;

    let err = client(&server)
        .launch_instance(&CancellationToken::new(), &launch_request())
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Api { status: 400, .. }));
}

#[tokio::test]
async fn failed_insert_operation_deletes_nothing() {
    let server = MockServer::start().await;
    let link = format!("{}{ZONE}/instances/agent-0a1b2c", server.uri());

    mount_insert(&server, &link).await;
    mount_operation(
        &server,
        "op-insert",
        json!({
            "name": "op-insert",
            "status": "DONE",
            "error": {"errors": [
                {"code": "QUOTA_EXCEEDED", "message": "Quota 'CPUS' exceeded"}
            ]}
        }),
        1,
    )
    .await;
    mount_delete(&server, 0).await;

    let err = client(&server)
        .launch_instance(&CancellationToken::new(), &launch_request())
        .await
        .unwrap_err();

    assert!(matches!(err, FleetError::Operation { ref operation, .. } if operation == "op-insert"));
}

#[tokio::test]
async fn metadata_token_is_cached() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/token"))
        .and(header("Metadata-Flavor", "Google"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "ya29.metadata",
            "expires_in": 3599,
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(path(format!("{ZONE}/instanceGroups/agents/listInstances")))
        .and(header("authorization", "Bearer ya29.metadata"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"instance": "https://compute/instances/a", "status": "RUNNING"}]
        })))
        .expect(2)
        .mount(&server)
        .await;

    let tokens = TokenSource::metadata(format!("{}/token", server.uri())).unwrap();
    let client = ComputeClient::new(&server.uri(), tokens, fast_backoff()).unwrap();

    for _ in 0..2 {
        let count = client
            .live_instance_count("proj", "us-central1-a", "agents")
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
