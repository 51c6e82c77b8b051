//! FreeNAS HTTP Client
//!
//! [`ResourceClient`] over the appliance's v1.0 REST API. Status codes and
//! error bodies are classified here into the closed outcome enums; nothing
//! above this module sees an HTTP status.

use crate::config::ServerConfig;
use crate::domain::ports::{ClientFactory, ResourceClient, ResourceClientRef};
use crate::domain::resources::{
    CreateOutcome, Dataset, DeleteOutcome, Extent, IscsiGlobalConfig, LunMapping, Resource,
    ResourceId, ResourceKey, ResourceKind, Target, TargetGroup, Volume,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const API_PREFIX: &str = "/api/v1.0";
const LIST_LIMIT: u32 = 1000;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

// =============================================================================
// Status Classification
// =============================================================================

/// Operation a response belongs to; the same status means different things
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Get,
    Create,
    Delete,
}

impl Operation {
    fn as_str(&self) -> &'static str {
        match self {
            Operation::Get => "get",
            Operation::Create => "create",
            Operation::Delete => "delete",
        }
    }
}

/// Meaning of an appliance response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    Success,
    Accepted,
    Conflict,
    Missing,
    Unavailable,
    Rejected,
}

/// Classify an appliance response.
///
/// The appliance reports duplicate zvols as a 400 with "already exists" and
/// references to not-yet-visible zvols as a 400 with "does not exist". Delete
/// bodies are left as rejections so the caller keeps the message.
pub fn classify(operation: Operation, status: StatusCode, body: &str) -> StatusClass {
    match status.as_u16() {
        200 | 201 | 204 => StatusClass::Success,
        202 => StatusClass::Accepted,
        409 => StatusClass::Conflict,
        404 => StatusClass::Missing,
        400 if operation == Operation::Create && body.contains("already exists") => {
            StatusClass::Conflict
        }
        400 if operation == Operation::Create && body.contains("does not exist") => {
            StatusClass::Missing
        }
        502 | 503 | 504 => StatusClass::Unavailable,
        _ => StatusClass::Rejected,
    }
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct WireGlobalConfig {
    iscsi_basename: String,
    #[serde(default)]
    iscsi_isns_servers: Option<String>,
    #[serde(default)]
    iscsi_pool_avail_threshold: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct WireDataset {
    name: String,
    #[serde(default)]
    pool: Option<String>,
    #[serde(default)]
    comments: Option<String>,
}

#[derive(Debug, Serialize)]
struct WireDatasetCreate<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    comments: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct WireVolumeCreate<'a> {
    name: &'a str,
    volsize: &'a str,
    comments: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    compression: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    dedup: Option<&'a str>,
    sparse: bool,
    force: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    blocksize: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct WireVolume {
    #[serde(default)]
    comments: Option<String>,
    #[serde(default)]
    compression: Option<String>,
    #[serde(default)]
    dedup: Option<String>,
    #[serde(default)]
    volsize: Option<serde_json::Value>,
    #[serde(default)]
    blocksize: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct WireVolumeDelete {
    cascade: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    iscsi_target_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_alias: Option<String>,
    #[serde(default)]
    iscsi_target_mode: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireTargetGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    iscsi_target: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_authgroup: Option<u32>,
    #[serde(default)]
    iscsi_target_authtype: String,
    #[serde(default)]
    iscsi_target_initialdigest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_initiatorgroup: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_portalgroup: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireExtent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    iscsi_target_extent_name: String,
    #[serde(default)]
    iscsi_target_extent_type: String,
    #[serde(default)]
    iscsi_target_extent_disk: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_extent_blocksize: Option<u32>,
    #[serde(default)]
    iscsi_target_extent_pblocksize: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_extent_avail_threshold: Option<u32>,
    #[serde(default)]
    iscsi_target_extent_comment: Option<String>,
    #[serde(default)]
    iscsi_target_extent_insecure_tpc: bool,
    #[serde(default)]
    iscsi_target_extent_xen: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    iscsi_target_extent_rpm: Option<String>,
    #[serde(default)]
    iscsi_target_extent_ro: bool,
}

#[derive(Debug, Serialize, Deserialize)]
struct WireLunMapping {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    iscsi_target: u64,
    iscsi_extent: u64,
    iscsi_lunid: u32,
}

impl From<&Target> for WireTarget {
    fn from(t: &Target) -> Self {
        Self {
            id: None,
            iscsi_target_name: t.name.clone(),
            iscsi_target_alias: t.alias.clone(),
            iscsi_target_mode: t.mode.clone(),
        }
    }
}

impl From<WireTarget> for Target {
    fn from(w: WireTarget) -> Self {
        Self {
            id: w.id,
            name: w.iscsi_target_name,
            alias: w.iscsi_target_alias.filter(|a| !a.is_empty()),
            mode: w.iscsi_target_mode,
        }
    }
}

impl From<&TargetGroup> for WireTargetGroup {
    fn from(g: &TargetGroup) -> Self {
        Self {
            id: None,
            iscsi_target: g.target,
            iscsi_target_authgroup: g.auth_group,
            iscsi_target_authtype: g.auth_type.clone(),
            iscsi_target_initialdigest: g.initial_digest.clone(),
            iscsi_target_initiatorgroup: g.initiator_group,
            iscsi_target_portalgroup: g.portal_group,
        }
    }
}

impl From<WireTargetGroup> for TargetGroup {
    fn from(w: WireTargetGroup) -> Self {
        Self {
            id: w.id,
            target: w.iscsi_target,
            auth_group: w.iscsi_target_authgroup,
            auth_type: w.iscsi_target_authtype,
            initial_digest: w.iscsi_target_initialdigest,
            initiator_group: w.iscsi_target_initiatorgroup,
            portal_group: w.iscsi_target_portalgroup,
        }
    }
}

impl From<&Extent> for WireExtent {
    fn from(e: &Extent) -> Self {
        Self {
            id: None,
            iscsi_target_extent_name: e.name.clone(),
            iscsi_target_extent_type: e.extent_type.clone(),
            iscsi_target_extent_disk: Some(e.disk.clone()),
            iscsi_target_extent_blocksize: e.blocksize,
            iscsi_target_extent_pblocksize: e.disable_physical_blocksize,
            iscsi_target_extent_avail_threshold: e.avail_threshold,
            iscsi_target_extent_comment: Some(e.comment.clone()),
            iscsi_target_extent_insecure_tpc: e.insecure_tpc,
            iscsi_target_extent_xen: e.xen,
            iscsi_target_extent_rpm: e.rpm.clone(),
            iscsi_target_extent_ro: e.read_only,
        }
    }
}

impl From<WireExtent> for Extent {
    fn from(w: WireExtent) -> Self {
        Self {
            id: w.id,
            name: w.iscsi_target_extent_name,
            extent_type: w.iscsi_target_extent_type,
            disk: w.iscsi_target_extent_disk.unwrap_or_default(),
            blocksize: w.iscsi_target_extent_blocksize,
            disable_physical_blocksize: w.iscsi_target_extent_pblocksize,
            avail_threshold: w.iscsi_target_extent_avail_threshold,
            comment: w.iscsi_target_extent_comment.unwrap_or_default(),
            insecure_tpc: w.iscsi_target_extent_insecure_tpc,
            xen: w.iscsi_target_extent_xen,
            rpm: w.iscsi_target_extent_rpm,
            read_only: w.iscsi_target_extent_ro,
        }
    }
}

impl From<&LunMapping> for WireLunMapping {
    fn from(m: &LunMapping) -> Self {
        Self {
            id: None,
            iscsi_target: m.target,
            iscsi_extent: m.extent,
            iscsi_lunid: m.lun,
        }
    }
}

impl From<WireLunMapping> for LunMapping {
    fn from(w: WireLunMapping) -> Self {
        Self {
            id: w.id,
            target: w.iscsi_target,
            extent: w.iscsi_extent,
            lun: w.iscsi_lunid,
        }
    }
}

fn dataset_from_wire(w: WireDataset) -> Dataset {
    let pool = w
        .pool
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| w.name.split('/').next().unwrap_or_default().to_string());
    Dataset {
        path: w.name,
        pool,
        comments: w.comments.filter(|c| !c.is_empty()),
    }
}

fn json_to_string(value: Option<serde_json::Value>) -> Option<String> {
    match value? {
        serde_json::Value::Null => None,
        serde_json::Value::String(s) => Some(s),
        other => Some(other.to_string()),
    }
}

/// Encode each path segment, keeping the separators
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

// =============================================================================
// Response
// =============================================================================

#[derive(Debug)]
struct ApiResponse {
    status: StatusCode,
    body: String,
}

impl ApiResponse {
    fn class(&self, operation: Operation) -> StatusClass {
        classify(operation, self.status, &self.body)
    }

    fn describe(&self) -> String {
        let body = self.body.trim();
        if body.is_empty() {
            format!("status {}", self.status.as_u16())
        } else {
            format!("status {}: {}", self.status.as_u16(), body)
        }
    }

    fn json<T: DeserializeOwned>(&self, kind: ResourceKind, operation: Operation) -> Result<T> {
        serde_json::from_str(&self.body).map_err(|e| {
            Error::resource(
                kind,
                operation.as_str(),
                format!("unexpected response body: {}", e),
            )
        })
    }

    /// Turn a response the caller has no specific use for into an error
    fn into_error(self, kind: ResourceKind, operation: Operation) -> Error {
        match self.class(operation) {
            StatusClass::Unavailable => {
                Error::connectivity(kind, operation.as_str(), self.describe())
            }
            _ => Error::resource(kind, operation.as_str(), self.describe()),
        }
    }
}

// =============================================================================
// FreeNAS Client
// =============================================================================

/// HTTP client for one appliance
pub struct FreenasClient {
    http: reqwest::Client,
    base_url: String,
    username: String,
    password: String,
}

impl FreenasClient {
    /// Create a client for the given server
    pub fn new(server: &ServerConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(server.allow_insecure)
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| Error::Configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: server.base_url(),
            username: server.username.clone(),
            password: server.password.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}{}", self.base_url, API_PREFIX, path)
    }

    async fn send<B: Serialize + ?Sized>(
        &self,
        kind: ResourceKind,
        operation: Operation,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<ApiResponse> {
        let url = self.url(path);
        debug!("{} {}", method, url);

        let mut request = self
            .http
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password));
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_connect() || e.is_timeout() || e.is_request() {
                Error::connectivity(kind, operation.as_str(), e.to_string())
            } else {
                Error::resource(kind, operation.as_str(), e.to_string())
            }
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            Error::connectivity(kind, operation.as_str(), format!("reading body: {}", e))
        })?;

        Ok(ApiResponse { status, body })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        kind: ResourceKind,
        path: &str,
    ) -> Result<Option<T>> {
        let response = self
            .send::<()>(kind, Operation::Get, Method::GET, path, None)
            .await?;
        match response.class(Operation::Get) {
            StatusClass::Success => Ok(Some(response.json(kind, Operation::Get)?)),
            StatusClass::Missing => Ok(None),
            _ => Err(response.into_error(kind, Operation::Get)),
        }
    }

    /// List every object of a kind and keep the ones `key` matches
    async fn find_in_list<W, F>(
        &self,
        kind: ResourceKind,
        collection: &str,
        key: &ResourceKey,
        wrap: F,
    ) -> Result<Option<Resource>>
    where
        W: DeserializeOwned,
        F: Fn(W) -> Resource,
    {
        let path = format!("{}?limit={}", collection, LIST_LIMIT);
        let items: Vec<W> = self.get_json(kind, &path).await?.unwrap_or_default();
        let found = items.into_iter().map(wrap).find(|r| r.matches(key));
        if let Some(resource) = &found {
            debug!("Found {} for {}: {:?}", kind, key, resource.id());
        }
        Ok(found)
    }

    async fn post<B: Serialize>(
        &self,
        kind: ResourceKind,
        path: &str,
        body: &B,
    ) -> Result<ApiResponse> {
        self.send(kind, Operation::Create, Method::POST, path, Some(body))
            .await
    }

    /// Classify a create response, decoding the created object on success
    fn create_outcome<W, F>(
        &self,
        kind: ResourceKind,
        response: ApiResponse,
        wrap: F,
    ) -> Result<CreateOutcome>
    where
        W: DeserializeOwned,
        F: Fn(W) -> Resource,
    {
        match response.class(Operation::Create) {
            StatusClass::Success => {
                let wire: W = response.json(kind, Operation::Create)?;
                Ok(CreateOutcome::Created(wrap(wire)))
            }
            StatusClass::Accepted => {
                let wire: W = response.json(kind, Operation::Create)?;
                Ok(CreateOutcome::Accepted(wrap(wire)))
            }
            StatusClass::Conflict => Ok(CreateOutcome::AlreadyExists),
            StatusClass::Missing => Ok(CreateOutcome::NotFound),
            _ => Err(response.into_error(kind, Operation::Create)),
        }
    }
}

fn collection(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Target => "/services/iscsi/target/",
        ResourceKind::TargetGroup => "/services/iscsi/targetgroup/",
        ResourceKind::Extent => "/services/iscsi/extent/",
        ResourceKind::LunMapping => "/services/iscsi/targettoextent/",
        ResourceKind::IscsiGlobalConfig => "/services/iscsi/globalconfiguration/",
        ResourceKind::Dataset => "/storage/dataset/",
        ResourceKind::Volume => "/storage/volume/",
    }
}

fn volume_path(pool: &str, name: &str) -> String {
    format!(
        "/storage/volume/{}/zvols/{}/",
        encode_path(pool),
        urlencoding::encode(name)
    )
}

#[async_trait]
impl ResourceClient for FreenasClient {
    async fn global_config(&self) -> Result<IscsiGlobalConfig> {
        let kind = ResourceKind::IscsiGlobalConfig;
        let wire: WireGlobalConfig = self
            .get_json(kind, collection(kind))
            .await?
            .ok_or_else(|| Error::resource(kind, "get", "global configuration not found"))?;

        Ok(IscsiGlobalConfig {
            basename: wire.iscsi_basename,
            isns_servers: wire.iscsi_isns_servers.filter(|s| !s.is_empty()),
            pool_avail_threshold: wire.iscsi_pool_avail_threshold,
        })
    }

    async fn get(&self, key: &ResourceKey) -> Result<Option<Resource>> {
        let kind = key.kind();
        match key {
            ResourceKey::Id(ResourceId::Dataset { path }) => {
                let path = format!("/storage/dataset/{}/", encode_path(path));
                let wire: Option<WireDataset> = self.get_json(kind, &path).await?;
                Ok(wire.map(|w| Resource::Dataset(dataset_from_wire(w))))
            }
            ResourceKey::Id(ResourceId::Volume { pool, name }) => {
                let wire: Option<WireVolume> =
                    self.get_json(kind, &volume_path(pool, name)).await?;
                Ok(wire.map(|w| {
                    Resource::Volume(Volume {
                        pool: pool.clone(),
                        name: name.clone(),
                        volsize: json_to_string(w.volsize).unwrap_or_default(),
                        comments: w.comments.unwrap_or_default(),
                        compression: w.compression,
                        dedup: w.dedup,
                        sparse: false,
                        force: false,
                        blocksize: json_to_string(w.blocksize),
                    })
                }))
            }
            ResourceKey::Id(id) => {
                let numeric = id.numeric().ok_or_else(|| {
                    Error::Internal(format!("{} has no numeric identity", id))
                })?;
                let path = format!("{}{}/", collection(kind), numeric);
                let resource = match kind {
                    ResourceKind::Target => self
                        .get_json::<WireTarget>(kind, &path)
                        .await?
                        .map(|w| Resource::Target(w.into())),
                    ResourceKind::TargetGroup => self
                        .get_json::<WireTargetGroup>(kind, &path)
                        .await?
                        .map(|w| Resource::TargetGroup(w.into())),
                    ResourceKind::Extent => self
                        .get_json::<WireExtent>(kind, &path)
                        .await?
                        .map(|w| Resource::Extent(w.into())),
                    _ => self
                        .get_json::<WireLunMapping>(kind, &path)
                        .await?
                        .map(|w| Resource::LunMapping(w.into())),
                };
                Ok(resource)
            }
            ResourceKey::TargetName(_) => {
                self.find_in_list(kind, collection(kind), key, |w: WireTarget| {
                    Resource::Target(w.into())
                })
                .await
            }
            ResourceKey::TargetGroupOf { .. } => {
                self.find_in_list(kind, collection(kind), key, |w: WireTargetGroup| {
                    Resource::TargetGroup(w.into())
                })
                .await
            }
            ResourceKey::ExtentName(_) => {
                self.find_in_list(kind, collection(kind), key, |w: WireExtent| {
                    Resource::Extent(w.into())
                })
                .await
            }
            ResourceKey::LunMappingOf { .. } => {
                self.find_in_list(kind, collection(kind), key, |w: WireLunMapping| {
                    Resource::LunMapping(w.into())
                })
                .await
            }
        }
    }

    async fn create(&self, resource: &Resource) -> Result<CreateOutcome> {
        let kind = resource.kind();
        match resource {
            Resource::Dataset(d) => {
                let (parent, child) = d.path.rsplit_once('/').ok_or_else(|| {
                    Error::Configuration(format!("dataset {} has no parent", d.path))
                })?;
                let path = format!("/storage/dataset/{}/", encode_path(parent));
                let body = WireDatasetCreate {
                    name: child,
                    comments: d.comments.as_deref(),
                };
                let response = self.post(kind, &path, &body).await?;
                self.create_outcome(kind, response, |w: WireDataset| {
                    Resource::Dataset(dataset_from_wire(w))
                })
            }
            Resource::Volume(v) => {
                let path = format!("/storage/volume/{}/zvols/", encode_path(&v.pool));
                let body = WireVolumeCreate {
                    name: &v.name,
                    volsize: &v.volsize,
                    comments: &v.comments,
                    compression: v.compression.as_deref(),
                    dedup: v.dedup.as_deref(),
                    sparse: v.sparse,
                    force: v.force,
                    blocksize: v.blocksize.as_deref(),
                };
                let response = self.post(kind, &path, &body).await?;
                // Zvol creation answers without a usable body; the identity is the path
                match response.class(Operation::Create) {
                    StatusClass::Success => Ok(CreateOutcome::Created(resource.clone())),
                    StatusClass::Accepted => Ok(CreateOutcome::Accepted(resource.clone())),
                    StatusClass::Conflict => Ok(CreateOutcome::AlreadyExists),
                    StatusClass::Missing => Ok(CreateOutcome::NotFound),
                    _ => Err(response.into_error(kind, Operation::Create)),
                }
            }
            Resource::Target(t) => {
                let response = self
                    .post(kind, collection(kind), &WireTarget::from(t))
                    .await?;
                self.create_outcome(kind, response, |w: WireTarget| Resource::Target(w.into()))
            }
            Resource::TargetGroup(g) => {
                let response = self
                    .post(kind, collection(kind), &WireTargetGroup::from(g))
                    .await?;
                self.create_outcome(kind, response, |w: WireTargetGroup| {
                    Resource::TargetGroup(w.into())
                })
            }
            Resource::Extent(e) => {
                let response = self
                    .post(kind, collection(kind), &WireExtent::from(e))
                    .await?;
                self.create_outcome(kind, response, |w: WireExtent| Resource::Extent(w.into()))
            }
            Resource::LunMapping(m) => {
                let response = self
                    .post(kind, collection(kind), &WireLunMapping::from(m))
                    .await?;
                self.create_outcome(kind, response, |w: WireLunMapping| {
                    Resource::LunMapping(w.into())
                })
            }
        }
    }

    async fn delete(&self, id: &ResourceId) -> Result<DeleteOutcome> {
        let kind = id.kind();
        let response = match id {
            ResourceId::Dataset { path } => {
                let path = format!("/storage/dataset/{}/", encode_path(path));
                self.send::<()>(kind, Operation::Delete, Method::DELETE, &path, None)
                    .await?
            }
            ResourceId::Volume { pool, name } => {
                let body = WireVolumeDelete { cascade: true };
                self.send(
                    kind,
                    Operation::Delete,
                    Method::DELETE,
                    &volume_path(pool, name),
                    Some(&body),
                )
                .await?
            }
            other => {
                let numeric = other.numeric().ok_or_else(|| {
                    Error::Internal(format!("{} has no numeric identity", other))
                })?;
                let path = format!("{}{}/", collection(kind), numeric);
                self.send::<()>(kind, Operation::Delete, Method::DELETE, &path, None)
                    .await?
            }
        };

        match response.class(Operation::Delete) {
            StatusClass::Success => Ok(DeleteOutcome::Deleted),
            StatusClass::Missing => Ok(DeleteOutcome::NotFound),
            _ => {
                warn!("Failed to delete {}: {}", id, response.describe());
                Err(response.into_error(kind, Operation::Delete))
            }
        }
    }
}

// =============================================================================
// Client Factory
// =============================================================================

/// Builds a [`FreenasClient`] per resolved server
#[derive(Debug, Default, Clone)]
pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn connect(&self, server: &ServerConfig) -> Result<ResourceClientRef> {
        Ok(Arc::new(FreenasClient::new(server)?))
    }
}
