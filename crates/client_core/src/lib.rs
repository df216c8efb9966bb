use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use reqwest::{header, Client};
use serde::Serialize;
use shared::{
    domain::{ApplicationId, RequestStatus},
    protocol::{AuthSession, ProvisionPayload, ProvisionResponse, RequestRecord, RequestUpdate},
};
use thiserror::Error;
use tokio::sync::{broadcast, Mutex};
use tracing::{info, warn};

mod durable_store;
pub use durable_store::DurableRequestStore;

const PROGRESS_SUBMITTED: u8 = 30;
const PROGRESS_PROVISIONING: u8 = 60;
const PROGRESS_PROVISIONED: u8 = 90;
const PROGRESS_COMPLETE: u8 = 100;

const MESSAGE_SUBMITTED: &str = "Request Submitted...";
const MESSAGE_PROVISIONING: &str = "Creating Chatbot powered by Amazon Bedrock... \u{23f3}";
const MESSAGE_PROVISIONED: &str = "Chatbot created successfully";
const MESSAGE_COMPLETE: &str = "Updated Completion Status.";

const NOTICE_SUBMITTED: &str = "Request submitted... \u{1f44d}";
const NOTICE_COMPLETED: &str = "Application created successfully. \u{1f60e}";

/// Where the console sits in the submission cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionPhase {
    Idle,
    FormOpen,
    Submitting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    Notification { severity: Severity, text: String },
    ProgressChanged { value: u8, message: Option<String> },
    PhaseChanged(SubmissionPhase),
    RequestListInvalidated,
}

/// Failure taxonomy for a submission attempt. Every variant surfaces to the
/// operator through the same error notification.
#[derive(Debug, Error)]
pub enum SubmissionError {
    #[error("auth session unavailable: {0}")]
    Auth(String),
    #[error("workflow endpoint request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("malformed workflow response: {0}")]
    Response(String),
    #[error("failed to record completion: {0}")]
    Store(String),
}

#[async_trait]
pub trait AuthSessionProvider: Send + Sync {
    async fn fetch_session(&self) -> Result<AuthSession>;
}

pub struct MissingAuthSessionProvider;

#[async_trait]
impl AuthSessionProvider for MissingAuthSessionProvider {
    async fn fetch_session(&self) -> Result<AuthSession> {
        Err(anyhow!("auth session provider is unavailable"))
    }
}

#[derive(Debug, Serialize)]
struct LoginRequest {
    username: String,
}

/// [`AuthSessionProvider`] that logs in against the provisioning server and
/// returns the minted session tokens.
pub struct HttpAuthSessionProvider {
    http: Client,
    server_url: String,
    username: String,
}

impl HttpAuthSessionProvider {
    pub fn new(server_url: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            username: username.into(),
        }
    }
}

#[async_trait]
impl AuthSessionProvider for HttpAuthSessionProvider {
    async fn fetch_session(&self) -> Result<AuthSession> {
        let session = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest {
                username: self.username.clone(),
            })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(session)
    }
}

#[async_trait]
pub trait RequestStore: Send + Sync {
    async fn list_requests(&self) -> Result<Vec<RequestRecord>>;
    async fn update_request(&self, update: &RequestUpdate) -> Result<Option<RequestRecord>>;
}

pub struct MissingRequestStore;

#[async_trait]
impl RequestStore for MissingRequestStore {
    async fn list_requests(&self) -> Result<Vec<RequestRecord>> {
        Err(anyhow!("request store is unavailable"))
    }

    async fn update_request(&self, update: &RequestUpdate) -> Result<Option<RequestRecord>> {
        Err(anyhow!("request store is unavailable for request {}", update.id))
    }
}

struct ControllerState {
    phase: SubmissionPhase,
    progress: u8,
    progress_messages: Vec<String>,
}

/// Drives a pending request through the provisioning workflow: posts the form
/// payload to the workflow endpoint, then records the completed status in the
/// request store. Observers follow along via [`SubmissionController::subscribe_events`].
pub struct SubmissionController {
    http: Client,
    endpoint_url: String,
    auth: Arc<dyn AuthSessionProvider>,
    store: Arc<dyn RequestStore>,
    inner: Mutex<ControllerState>,
    events: broadcast::Sender<ControllerEvent>,
}

impl SubmissionController {
    pub fn new(endpoint_url: impl Into<String>) -> Arc<Self> {
        Self::new_with_dependencies(
            endpoint_url,
            Arc::new(MissingAuthSessionProvider),
            Arc::new(MissingRequestStore),
        )
    }

    pub fn new_with_dependencies(
        endpoint_url: impl Into<String>,
        auth: Arc<dyn AuthSessionProvider>,
        store: Arc<dyn RequestStore>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            http: Client::new(),
            endpoint_url: endpoint_url.into(),
            auth,
            store,
            inner: Mutex::new(ControllerState {
                phase: SubmissionPhase::Idle,
                progress: 0,
                progress_messages: Vec::new(),
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ControllerEvent> {
        self.events.subscribe()
    }

    pub async fn phase(&self) -> SubmissionPhase {
        self.inner.lock().await.phase
    }

    pub async fn progress(&self) -> u8 {
        self.inner.lock().await.progress
    }

    /// Progress log, newest entry first.
    pub async fn progress_messages(&self) -> Vec<String> {
        self.inner.lock().await.progress_messages.clone()
    }

    pub async fn requests(&self) -> Result<Vec<RequestRecord>, SubmissionError> {
        self.store
            .list_requests()
            .await
            .map_err(|err| SubmissionError::Store(err.to_string()))
    }

    /// Opens a blank request form. Ignored while a submission is running.
    pub async fn new_request(&self) {
        {
            let mut guard = self.inner.lock().await;
            if guard.phase == SubmissionPhase::Submitting {
                return;
            }
            guard.phase = SubmissionPhase::FormOpen;
            guard.progress = 0;
            guard.progress_messages.clear();
        }
        let _ = self
            .events
            .send(ControllerEvent::PhaseChanged(SubmissionPhase::FormOpen));
    }

    /// Closes the form without submitting. Ignored while a submission is
    /// running; an in-flight workflow cannot be aborted.
    pub async fn cancel(&self) {
        {
            let mut guard = self.inner.lock().await;
            if guard.phase != SubmissionPhase::FormOpen {
                return;
            }
            guard.phase = SubmissionPhase::Idle;
            guard.progress = 0;
            guard.progress_messages.clear();
        }
        let _ = self
            .events
            .send(ControllerEvent::PhaseChanged(SubmissionPhase::Idle));
    }

    /// Submits a pending request to the workflow endpoint and records the
    /// outcome. On success the cycle ends back at [`SubmissionPhase::Idle`];
    /// on failure the form stays open for another attempt and the stored
    /// request is left untouched.
    pub async fn submit(&self, request: &RequestRecord) -> Result<(), SubmissionError> {
        self.set_phase(SubmissionPhase::Submitting).await;
        info!(request_id = %request.id, "submission started");

        match self.run_submission(request).await {
            Ok(application_id) => {
                info!(
                    request_id = %request.id,
                    application_id = %application_id,
                    "submission completed"
                );
                self.notify(Severity::Success, NOTICE_COMPLETED);
                let _ = self.events.send(ControllerEvent::RequestListInvalidated);
                self.reset_progress().await;
                self.set_phase(SubmissionPhase::Idle).await;
                Ok(())
            }
            Err(err) => {
                warn!(request_id = %request.id, error = %err, "submission failed");
                self.notify(Severity::Error, format!("An Error has occurred: {err}"));
                self.reset_progress().await;
                self.set_phase(SubmissionPhase::FormOpen).await;
                Err(err)
            }
        }
    }

    async fn run_submission(
        &self,
        request: &RequestRecord,
    ) -> Result<ApplicationId, SubmissionError> {
        self.advance_progress(PROGRESS_SUBMITTED, MESSAGE_SUBMITTED)
            .await;
        self.notify(Severity::Success, NOTICE_SUBMITTED);

        let session = self
            .auth
            .fetch_session()
            .await
            .map_err(|err| SubmissionError::Auth(err.to_string()))?;
        let id_token = session
            .id_token
            .ok_or_else(|| SubmissionError::Auth("session has no identity token".into()))?;

        let payload = ProvisionPayload {
            id: request.id.clone(),
            customer_name: request.customer_name.clone(),
            email: request.email.clone(),
            website_url: request.website_url.clone(),
            description: request.description.clone(),
        };

        // Reported before the call; the endpoint has no timeout.
        self.advance_progress(PROGRESS_PROVISIONING, MESSAGE_PROVISIONING)
            .await;

        // The workflow endpoint expects the bare identity token, not
        // `Bearer <token>`.
        let response = self
            .http
            .post(format!("{}createBRApp", self.endpoint_url))
            .header(header::AUTHORIZATION, id_token)
            .json(&payload)
            .send()
            .await?;

        // Completion is judged by the response body, not the HTTP status.
        let body = response.text().await?;
        let provisioned: ProvisionResponse = serde_json::from_str(&body)
            .map_err(|err| SubmissionError::Response(err.to_string()))?;
        self.advance_progress(PROGRESS_PROVISIONED, MESSAGE_PROVISIONED)
            .await;

        let update = RequestUpdate {
            id: request.id.clone(),
            qchatform_status: RequestStatus::Completed,
            application_id_q: provisioned.application_id_q.clone(),
            token: provisioned.final_token().to_string(),
        };
        self.store
            .update_request(&update)
            .await
            .map_err(|err| SubmissionError::Store(err.to_string()))?;
        self.advance_progress(PROGRESS_COMPLETE, MESSAGE_COMPLETE)
            .await;

        Ok(provisioned.application_id_q)
    }

    /// Progress only moves forward within a cycle; a stale lower value never
    /// overwrites a higher one.
    async fn advance_progress(&self, value: u8, message: &str) {
        let value = {
            let mut guard = self.inner.lock().await;
            guard.progress = guard.progress.max(value);
            guard
                .progress_messages
                .insert(0, message.to_string());
            guard.progress
        };
        let _ = self.events.send(ControllerEvent::ProgressChanged {
            value,
            message: Some(message.to_string()),
        });
    }

    async fn reset_progress(&self) {
        {
            let mut guard = self.inner.lock().await;
            guard.progress = 0;
            guard.progress_messages.clear();
        }
        let _ = self.events.send(ControllerEvent::ProgressChanged {
            value: 0,
            message: None,
        });
    }

    async fn set_phase(&self, phase: SubmissionPhase) {
        let changed = {
            let mut guard = self.inner.lock().await;
            if guard.phase == phase {
                false
            } else {
                guard.phase = phase;
                true
            }
        };
        if changed {
            let _ = self.events.send(ControllerEvent::PhaseChanged(phase));
        }
    }

    fn notify(&self, severity: Severity, text: impl Into<String>) {
        let _ = self.events.send(ControllerEvent::Notification {
            severity,
            text: text.into(),
        });
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
