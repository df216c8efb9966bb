use super::*;
use axum::{
    extract::State,
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use shared::domain::RequestId;
use tokio::{net::TcpListener, sync::oneshot};

fn sample_request() -> RequestRecord {
    RequestRecord {
        id: RequestId("r1".into()),
        customer_name: "Acme Corp".into(),
        email: "ops@acme.example".into(),
        website_url: "https://acme.example".into(),
        description: "storefront bot".into(),
        qchatform_status: RequestStatus::Pending,
        application_id_q: None,
        token: None,
        created_at: "2024-01-01T00:00:00Z".parse().expect("timestamp"),
    }
}

struct TestAuthProvider {
    id_token: Option<String>,
    fail_with: Option<String>,
}

impl TestAuthProvider {
    fn ok(id_token: &str) -> Self {
        Self {
            id_token: Some(id_token.to_string()),
            fail_with: None,
        }
    }

    fn without_id_token() -> Self {
        Self {
            id_token: None,
            fail_with: None,
        }
    }

    fn failing(err: impl Into<String>) -> Self {
        Self {
            id_token: None,
            fail_with: Some(err.into()),
        }
    }
}

#[async_trait]
impl AuthSessionProvider for TestAuthProvider {
    async fn fetch_session(&self) -> Result<AuthSession> {
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        Ok(AuthSession {
            access_token: Some("access".to_string()),
            id_token: self.id_token.clone(),
        })
    }
}

struct TestRequestStore {
    records: Arc<Mutex<Vec<RequestRecord>>>,
    updates: Arc<Mutex<Vec<RequestUpdate>>>,
    fail_with: Option<String>,
}

impl TestRequestStore {
    fn ok() -> Self {
        Self {
            records: Arc::new(Mutex::new(vec![sample_request()])),
            updates: Arc::new(Mutex::new(Vec::new())),
            fail_with: None,
        }
    }

    fn failing(err: impl Into<String>) -> Self {
        Self {
            records: Arc::new(Mutex::new(vec![sample_request()])),
            updates: Arc::new(Mutex::new(Vec::new())),
            fail_with: Some(err.into()),
        }
    }
}

#[async_trait]
impl RequestStore for TestRequestStore {
    async fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        Ok(self.records.lock().await.clone())
    }

    async fn update_request(&self, update: &RequestUpdate) -> Result<Option<RequestRecord>> {
        if let Some(err) = &self.fail_with {
            return Err(anyhow!(err.clone()));
        }
        self.updates.lock().await.push(update.clone());
        let mut records = self.records.lock().await;
        let Some(record) = records.iter_mut().find(|record| record.id == update.id) else {
            return Ok(None);
        };
        record.qchatform_status = update.qchatform_status;
        record.application_id_q = Some(update.application_id_q.clone());
        record.token = Some(update.token.clone());
        Ok(Some(record.clone()))
    }
}

struct CapturedSubmission {
    authorization: Option<String>,
    payload: ProvisionPayload,
}

#[derive(Clone)]
struct EndpointState {
    tx: Arc<Mutex<Option<oneshot::Sender<CapturedSubmission>>>>,
    response_body: String,
}

async fn handle_create_br_app(
    State(state): State<EndpointState>,
    headers: HeaderMap,
    Json(payload): Json<ProvisionPayload>,
) -> (StatusCode, String) {
    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    if let Some(tx) = state.tx.lock().await.take() {
        let _ = tx.send(CapturedSubmission {
            authorization,
            payload,
        });
    }
    (StatusCode::OK, state.response_body.clone())
}

async fn spawn_workflow_endpoint(
    response_body: &str,
) -> Result<(String, oneshot::Receiver<CapturedSubmission>)> {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let (tx, rx) = oneshot::channel();
    let state = EndpointState {
        tx: Arc::new(Mutex::new(Some(tx))),
        response_body: response_body.to_string(),
    };
    let app = Router::new()
        .route("/createBRApp", post(handle_create_br_app))
        .with_state(state);
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    Ok((format!("http://{addr}/"), rx))
}

fn drain_events(rx: &mut broadcast::Receiver<ControllerEvent>) -> Vec<ControllerEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn submit_posts_bare_identity_token_and_records_completion() {
    let (endpoint_url, captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let store = Arc::new(TestRequestStore::ok());
    let updates = store.updates.clone();
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        store,
    );

    controller.submit(&sample_request()).await.expect("submit");

    let captured = captured_rx.await.expect("captured request");
    assert_eq!(captured.authorization.as_deref(), Some("id-token-1"));
    assert_eq!(captured.payload.id, RequestId("r1".into()));
    assert_eq!(captured.payload.customer_name, "Acme Corp");
    assert_eq!(captured.payload.website_url, "https://acme.example");

    let updates = updates.lock().await;
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].qchatform_status, RequestStatus::Completed);
    assert_eq!(updates[0].application_id_q.0, "app-1");
    assert_eq!(updates[0].token, "t1");

    assert_eq!(controller.phase().await, SubmissionPhase::Idle);
    assert_eq!(controller.progress().await, 0);
}

#[tokio::test]
async fn submit_prefers_string_public_url_over_token() {
    let (endpoint_url, _captured_rx) = spawn_workflow_endpoint(
        r#"{"applicationIdQ":"app-1","token":"t1","publicURL":"https://x"}"#,
    )
    .await
    .expect("spawn endpoint");
    let store = Arc::new(TestRequestStore::ok());
    let updates = store.updates.clone();
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        store,
    );

    controller.submit(&sample_request()).await.expect("submit");

    let updates = updates.lock().await;
    assert_eq!(updates[0].token, "https://x");
}

#[tokio::test]
async fn submit_falls_back_to_token_for_non_string_public_url() {
    let (endpoint_url, _captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1","publicURL":42}"#)
            .await
            .expect("spawn endpoint");
    let store = Arc::new(TestRequestStore::ok());
    let updates = store.updates.clone();
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        store,
    );

    controller.submit(&sample_request()).await.expect("submit");

    let updates = updates.lock().await;
    assert_eq!(updates[0].token, "t1");
}

#[tokio::test]
async fn submit_emits_invalidation_after_success() {
    let (endpoint_url, _captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        Arc::new(TestRequestStore::ok()),
    );

    let mut rx = controller.subscribe_events();
    controller.submit(&sample_request()).await.expect("submit");

    let events = drain_events(&mut rx);
    assert!(events.contains(&ControllerEvent::RequestListInvalidated));
    assert!(events.contains(&ControllerEvent::PhaseChanged(SubmissionPhase::Idle)));

    let notifications: Vec<String> = events
        .into_iter()
        .filter_map(|event| match event {
            ControllerEvent::Notification {
                severity: Severity::Success,
                text,
            } => Some(text),
            _ => None,
        })
        .collect();
    assert_eq!(
        notifications,
        vec![
            "Request submitted... \u{1f44d}".to_string(),
            "Application created successfully. \u{1f60e}".to_string(),
        ]
    );
}

#[tokio::test]
async fn progress_moves_forward_and_resets_after_completion() {
    let (endpoint_url, _captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        Arc::new(TestRequestStore::ok()),
    );

    let mut rx = controller.subscribe_events();
    controller.submit(&sample_request()).await.expect("submit");

    let values: Vec<u8> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ControllerEvent::ProgressChanged { value, .. } => Some(value),
            _ => None,
        })
        .collect();
    assert_eq!(values, vec![30, 60, 90, 100, 0]);
}

#[tokio::test]
async fn auth_failure_leaves_request_pending_and_form_open() {
    let (endpoint_url, mut captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let store = Arc::new(TestRequestStore::ok());
    let records = store.records.clone();
    let updates = store.updates.clone();
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::failing("cognito is down")),
        store,
    );

    let mut rx = controller.subscribe_events();
    let err = controller
        .submit(&sample_request())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubmissionError::Auth(_)));

    // Nothing was posted and nothing was written.
    assert!(captured_rx.try_recv().is_err());
    assert!(updates.lock().await.is_empty());
    assert_eq!(
        records.lock().await[0].qchatform_status,
        RequestStatus::Pending
    );

    assert_eq!(controller.phase().await, SubmissionPhase::FormOpen);
    assert_eq!(controller.progress().await, 0);

    let events = drain_events(&mut rx);
    let error_notifications: Vec<_> = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                ControllerEvent::Notification {
                    severity: Severity::Error,
                    ..
                }
            )
        })
        .collect();
    assert_eq!(error_notifications.len(), 1);
    match error_notifications[0] {
        ControllerEvent::Notification { text, .. } => {
            assert!(text.starts_with("An Error has occurred:"), "got: {text}");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!events.contains(&ControllerEvent::RequestListInvalidated));
}

#[tokio::test]
async fn session_without_identity_token_is_an_auth_failure() {
    let (endpoint_url, mut captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::without_id_token()),
        Arc::new(TestRequestStore::ok()),
    );

    let err = controller
        .submit(&sample_request())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubmissionError::Auth(_)));
    assert!(captured_rx.try_recv().is_err());
}

#[tokio::test]
async fn malformed_endpoint_response_is_a_response_failure() {
    let (endpoint_url, _captured_rx) = spawn_workflow_endpoint("definitely not json")
        .await
        .expect("spawn endpoint");
    let store = Arc::new(TestRequestStore::ok());
    let updates = store.updates.clone();
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        store,
    );

    let err = controller
        .submit(&sample_request())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubmissionError::Response(_)));
    assert!(updates.lock().await.is_empty());
    assert_eq!(controller.phase().await, SubmissionPhase::FormOpen);
}

#[tokio::test]
async fn unreachable_endpoint_is_a_transport_failure() {
    let controller = SubmissionController::new_with_dependencies(
        "http://127.0.0.1:1/",
        Arc::new(TestAuthProvider::ok("id-token-1")),
        Arc::new(TestRequestStore::ok()),
    );

    let mut rx = controller.subscribe_events();
    let err = controller
        .submit(&sample_request())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubmissionError::Transport(_)));
    assert_eq!(controller.phase().await, SubmissionPhase::FormOpen);

    // The provisioning step is announced before the call goes out, so it is
    // visible even when the endpoint is unreachable.
    let events = drain_events(&mut rx);
    assert!(events.contains(&ControllerEvent::ProgressChanged {
        value: 60,
        message: Some(MESSAGE_PROVISIONING.to_string()),
    }));
}

#[tokio::test]
async fn store_failure_surfaces_after_provisioning() {
    let (endpoint_url, captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        Arc::new(TestRequestStore::failing("table locked")),
    );

    let err = controller
        .submit(&sample_request())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubmissionError::Store(_)));
    // The endpoint call itself went through.
    assert!(captured_rx.await.is_ok());
    assert_eq!(controller.phase().await, SubmissionPhase::FormOpen);
    assert_eq!(controller.progress().await, 0);
}

#[tokio::test]
async fn new_request_and_cancel_cycle_without_side_effects() {
    let store = Arc::new(TestRequestStore::ok());
    let updates = store.updates.clone();
    let controller = SubmissionController::new_with_dependencies(
        "http://127.0.0.1:1/",
        Arc::new(TestAuthProvider::ok("id-token-1")),
        store,
    );

    let mut rx = controller.subscribe_events();

    controller.new_request().await;
    assert_eq!(controller.phase().await, SubmissionPhase::FormOpen);

    controller.cancel().await;
    assert_eq!(controller.phase().await, SubmissionPhase::Idle);
    assert_eq!(controller.progress().await, 0);
    assert!(updates.lock().await.is_empty());

    let events = drain_events(&mut rx);
    assert_eq!(
        events,
        vec![
            ControllerEvent::PhaseChanged(SubmissionPhase::FormOpen),
            ControllerEvent::PhaseChanged(SubmissionPhase::Idle),
        ]
    );
}

#[tokio::test]
async fn cancel_is_ignored_outside_the_form() {
    let controller = SubmissionController::new("http://127.0.0.1:1/");

    controller.cancel().await;
    assert_eq!(controller.phase().await, SubmissionPhase::Idle);

    let mut rx = controller.subscribe_events();
    controller.cancel().await;
    assert!(drain_events(&mut rx).is_empty());
}

#[tokio::test]
async fn progress_messages_accumulate_newest_first() {
    let (endpoint_url, _captured_rx) =
        spawn_workflow_endpoint(r#"{"applicationIdQ":"app-1","token":"t1"}"#)
            .await
            .expect("spawn endpoint");
    let controller = SubmissionController::new_with_dependencies(
        endpoint_url,
        Arc::new(TestAuthProvider::ok("id-token-1")),
        Arc::new(TestRequestStore::ok()),
    );

    let mut rx = controller.subscribe_events();
    controller.submit(&sample_request()).await.expect("submit");

    let messages: Vec<String> = drain_events(&mut rx)
        .into_iter()
        .filter_map(|event| match event {
            ControllerEvent::ProgressChanged {
                message: Some(message),
                ..
            } => Some(message),
            _ => None,
        })
        .collect();
    assert_eq!(
        messages,
        vec![
            MESSAGE_SUBMITTED.to_string(),
            MESSAGE_PROVISIONING.to_string(),
            MESSAGE_PROVISIONED.to_string(),
            MESSAGE_COMPLETE.to_string(),
        ]
    );
    // Cleared once the cycle ends.
    assert!(controller.progress_messages().await.is_empty());
}

#[tokio::test]
async fn missing_dependencies_fail_loudly() {
    let controller = SubmissionController::new("http://127.0.0.1:1/");

    let err = controller
        .submit(&sample_request())
        .await
        .expect_err("must fail");
    assert!(matches!(err, SubmissionError::Auth(_)));
    assert!(err.to_string().contains("unavailable"));

    let err = controller.requests().await.expect_err("must fail");
    assert!(matches!(err, SubmissionError::Store(_)));
}

#[tokio::test]
async fn http_auth_provider_returns_minted_session() {
    async fn handle_login(Json(_req): Json<serde_json::Value>) -> Json<AuthSession> {
        Json(AuthSession {
            access_token: Some("access-1".to_string()),
            id_token: Some("id-1".to_string()),
        })
    }

    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().route("/login", post(handle_login));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let provider = HttpAuthSessionProvider::new(format!("http://{addr}"), "alice");
    let session = provider.fetch_session().await.expect("session");
    assert_eq!(session.access_token.as_deref(), Some("access-1"));
    assert_eq!(session.id_token.as_deref(), Some("id-1"));
}
