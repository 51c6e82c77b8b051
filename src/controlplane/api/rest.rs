//! REST API Handlers
//!
//! Implements the REST endpoints for provisioning and deprovisioning volumes
//! plus health and readiness checks.

use crate::controlplane::provisioner::Provisioner;
use crate::domain::volume::{
    AccessMode, ProvisioningRequest, VolumeDescriptor, ANNOTATION_ISCSI_NAME, ANNOTATION_VOLUME,
};
use crate::error::{Error, ErrorAction, Result};
use axum::{
    extract::{Json, Path, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

// =============================================================================
// Request/Response Types
// =============================================================================

/// Requested capacity, either raw bytes or a quantity such as `"5Gi"`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Capacity {
    Bytes(u64),
    Quantity(String),
}

impl Capacity {
    pub fn to_bytes(&self) -> Result<u64> {
        match self {
            Capacity::Bytes(bytes) => Ok(*bytes),
            Capacity::Quantity(quantity) => parse_capacity(quantity),
        }
    }
}

/// Volume provision request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionVolumeRequest {
    /// Storage class whose parameters apply
    pub storage_class: String,
    /// Controller-generated volume name
    pub name: String,
    pub namespace: String,
    pub claim_name: String,
    pub capacity: Capacity,
    #[serde(default)]
    pub access_modes: Vec<AccessMode>,
}

/// Volume deprovision request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeprovisionVolumeRequest {
    pub storage_class: String,
    /// Identity map persisted at provision time
    pub annotations: BTreeMap<String, String>,
}

/// API error response
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    /// Whether the same request may succeed later
    pub retryable: bool,
}

impl ApiErrorResponse {
    fn from_error(e: &Error) -> (StatusCode, Self) {
        let (status, code) = match e {
            Error::Configuration(_) | Error::CapacityParse(_) | Error::JsonParse(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request")
            }
            Error::Connectivity { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "appliance_unavailable")
            }
            Error::Resource { .. } => (StatusCode::BAD_GATEWAY, "appliance_rejected"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        let details = match e {
            Error::Connectivity { kind, .. } | Error::Resource { kind, .. } => {
                Some(kind.to_string())
            }
            _ => None,
        };
        (
            status,
            Self {
                error: code.into(),
                message: e.to_string(),
                details,
                retryable: e.is_retryable(),
            },
        )
    }
}

fn error_response(e: &Error) -> Response {
    let (status, body) = ApiErrorResponse::from_error(e);
    let mut response = (status, Json(body)).into_response();
    if let ErrorAction::RequeueAfter(delay) = e.action() {
        response
            .headers_mut()
            .insert(header::RETRY_AFTER, HeaderValue::from(delay.as_secs()));
    }
    response
}

/// The path names a volume by its base name or its iSCSI name; either has
/// to agree with the identity annotations being deleted
fn check_path_name(name: &str, annotations: &BTreeMap<String, String>) -> Result<()> {
    let volume = match annotations.get(ANNOTATION_VOLUME) {
        Some(volume) => volume,
        // Missing identities are reported by the deprovisioner
        None => return Ok(()),
    };
    let base = volume.rsplit('/').next().unwrap_or(volume);
    let iscsi_name = annotations.get(ANNOTATION_ISCSI_NAME);
    if name == base || iscsi_name.map(String::as_str) == Some(name) {
        return Ok(());
    }
    Err(Error::Configuration(format!(
        "path names volume {} but annotations describe {}",
        name, volume
    )))
}

// =============================================================================
// REST Router
// =============================================================================

/// REST API router builder
pub struct RestRouter {
    provisioner: Arc<Provisioner>,
}

impl RestRouter {
    /// Create a new REST router
    pub fn new(provisioner: Arc<Provisioner>) -> Self {
        Self { provisioner }
    }

    /// Build the Axum router
    pub fn build(self) -> Router {
        let state = AppState {
            provisioner: self.provisioner,
        };

        Router::new()
            // Volume endpoints
            .route("/v1/volumes", post(provision_volume))
            .route("/v1/volumes/:name", delete(deprovision_volume))
            // Health endpoints
            .route("/health", get(health_check))
            .route("/ready", get(readiness_check))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    provisioner: Arc<Provisioner>,
}

// =============================================================================
// Handlers
// =============================================================================

/// Provision a volume
async fn provision_volume(
    State(state): State<AppState>,
    Json(request): Json<ProvisionVolumeRequest>,
) -> Response {
    info!(
        "Provisioning volume {} for {}/{}",
        request.name, request.namespace, request.claim_name
    );

    let capacity_bytes = match request.capacity.to_bytes() {
        Ok(bytes) => bytes,
        Err(e) => return error_response(&e),
    };

    let provisioning = ProvisioningRequest {
        name: request.name,
        namespace: request.namespace,
        claim_name: request.claim_name,
        capacity_bytes,
        access_modes: request.access_modes,
    };

    match state
        .provisioner
        .provision(&request.storage_class, &provisioning)
        .await
    {
        Ok(descriptor) => {
            (StatusCode::CREATED, Json::<VolumeDescriptor>(descriptor)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

/// Deprovision a volume
async fn deprovision_volume(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(request): Json<DeprovisionVolumeRequest>,
) -> Response {
    info!("Deprovisioning volume {}", name);

    if let Err(e) = check_path_name(&name, &request.annotations) {
        return error_response(&e);
    }

    match state
        .provisioner
        .deprovision(&request.storage_class, &request.annotations)
        .await
    {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => error_response(&e),
    }
}

/// Health check
async fn health_check() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Readiness check
async fn readiness_check() -> impl IntoResponse {
    (StatusCode::OK, "ready")
}

// =============================================================================
// Utility Functions
// =============================================================================

/// Parse capacity string (e.g., "100Gi", "1Ti") to bytes
pub fn parse_capacity(s: &str) -> Result<u64> {
    let s = s.trim();
    if s.is_empty() {
        return Err(Error::CapacityParse("empty capacity string".into()));
    }

    // Find where the number ends and unit begins
    let num_end = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit() && *c != '.')
        .map(|(i, _)| i)
        .unwrap_or(s.len());

    let num_str = &s[..num_end];
    let unit_str = s[num_end..].trim();

    let num: f64 = num_str
        .parse()
        .map_err(|_| Error::CapacityParse(format!("invalid number: {}", num_str)))?;

    let multiplier: u64 = match unit_str {
        "" | "B" => 1,
        "k" | "K" => 1000,
        "M" => 1000u64.pow(2),
        "G" => 1000u64.pow(3),
        "T" => 1000u64.pow(4),
        "P" => 1000u64.pow(5),
        "Ki" | "KiB" => 1 << 10,
        "Mi" | "MiB" => 1 << 20,
        "Gi" | "GiB" => 1 << 30,
        "Ti" | "TiB" => 1 << 40,
        "Pi" | "PiB" => 1 << 50,
        _ => {
            return Err(Error::CapacityParse(format!(
                "unknown unit: {}",
                unit_str
            )))
        }
    };

    Ok((num * multiplier as f64) as u64)
}
