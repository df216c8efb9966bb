use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ApplicationId, RequestId, RequestStatus};

/// Form payload submitted to the workflow endpoint. Field names follow the
/// original Amplify wire format.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionPayload {
    pub id: RequestId,
    pub customer_name: String,
    pub email: String,
    pub website_url: String,
    pub description: String,
}

/// Response of `POST {endpoint}createBRApp`.
///
/// `publicURL` is kept as an untyped JSON value on purpose: the consumer only
/// uses it when it happens to be a string, and anything else silently falls
/// back to `token` (see [`ProvisionResponse::final_token`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvisionResponse {
    #[serde(rename = "applicationIdQ")]
    pub application_id_q: ApplicationId,
    pub token: String,
    #[serde(
        rename = "publicURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub public_url: Option<serde_json::Value>,
}

impl ProvisionResponse {
    /// Token value to persist: `publicURL` if it is a JSON string, else
    /// `token`. Inherited quirk, preserved verbatim; flagged for product
    /// clarification in DESIGN.md.
    pub fn final_token(&self) -> &str {
        match self.public_url.as_ref().and_then(|value| value.as_str()) {
            Some(url) => url,
            None => &self.token,
        }
    }
}

/// Mutation applied to a request when provisioning completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestUpdate {
    pub id: RequestId,
    pub qchatform_status: RequestStatus,
    #[serde(rename = "applicationIdQ")]
    pub application_id_q: ApplicationId,
    pub token: String,
}

/// A stored provisioning request as seen by admin surfaces.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub id: RequestId,
    pub customer_name: String,
    pub email: String,
    pub website_url: String,
    pub description: String,
    #[serde(rename = "qchatform_status")]
    pub qchatform_status: RequestStatus,
    #[serde(
        rename = "applicationIdQ",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub application_id_q: Option<ApplicationId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Credentials returned by the auth session provider. Either token may be
/// absent when the session has expired.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSession {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
}
