//! HTTP client for the e-SAN array management API.
//!
//! The array exposes a small JSON API under `/api/v1`:
//!
//! ```text
//! POST   /volumes                      create (idempotent by name)
//! GET    /volumes?name=<name>          lookup by name
//! DELETE /volumes/<id>                 delete
//! POST   /volumes/<id>/mappings        map to host, returns target descriptor
//! DELETE /volumes/<id>/mappings/<host> unmap
//! POST   /volumes/<id>/expand          grow
//! POST   /snapshots                    snapshot
//! DELETE /snapshots/<id>               delete snapshot
//! GET    /pools/<pool>/capacity        free bytes
//! GET    /system/health                liveness
//! GET    /system/capabilities          optional feature flags
//! ```
//!
//! HTTP statuses are mapped onto [`BackendError`] so the controller can tell
//! transient failures (timeouts, 429, 502–504) from authoritative ones.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use super::{
    BackendCapabilities, BackendClient, BackendCreateRequest, BackendError, BackendSnapshot,
    BackendVolume, TargetDescriptor,
};
use crate::config::BackendConfig;
use crate::types::{NodeId, SnapshotId, VolumeContentSource, VolumeId};

const API_PREFIX: [&str; 2] = ["api", "v1"];
const DEFAULT_POOL: &str = "default";
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateVolumeBody<'a> {
    name: &'a str,
    size_bytes: u64,
    parameters: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_snapshot_id: Option<&'a SnapshotId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source_volume_id: Option<&'a VolumeId>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeDto {
    id: VolumeId,
    name: String,
    size_bytes: u64,
    #[serde(default)]
    wwn: Option<String>,
}

impl From<VolumeDto> for BackendVolume {
    fn from(dto: VolumeDto) -> Self {
        let mut context = std::collections::HashMap::new();
        if let Some(wwn) = dto.wwn {
            context.insert("wwn".to_owned(), wwn);
        }
        Self {
            id: dto.id,
            name: dto.name,
            size_bytes: dto.size_bytes,
            context,
        }
    }
}

#[derive(Debug, Deserialize)]
struct VolumeList {
    #[serde(default)]
    items: Vec<VolumeDto>,
}

#[derive(Debug, Serialize)]
struct MappingBody<'a> {
    host: &'a NodeId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExpandBody {
    size_bytes: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody<'a> {
    name: &'a str,
    source_volume_id: &'a VolumeId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDto {
    id: SnapshotId,
    name: String,
    source_volume_id: VolumeId,
    size_bytes: u64,
    created_at: String,
    #[serde(default)]
    ready_to_use: bool,
}

impl From<SnapshotDto> for BackendSnapshot {
    fn from(dto: SnapshotDto) -> Self {
        Self {
            id: dto.id,
            name: dto.name,
            source_volume_id: dto.source_volume_id,
            size_bytes: dto.size_bytes,
            created_at: dto.created_at,
            ready_to_use: dto.ready_to_use,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapacityDto {
    free_bytes: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapabilitiesDto {
    #[serde(default)]
    snapshots: bool,
    #[serde(default)]
    clones: bool,
    #[serde(default)]
    expansion: bool,
    #[serde(default)]
    online_expansion: bool,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

/// Production [`BackendClient`] speaking to the array over HTTP.
#[derive(Debug, Clone)]
pub struct EsanClient {
    http: Client,
    base: Url,
    token: Option<String>,
    read_retries: u32,
    capabilities: BackendCapabilities,
}

impl EsanClient {
    /// Build a client and fetch the array's capability flags.
    pub async fn connect(config: &BackendConfig) -> Result<Self, BackendError> {
        let mut client = Self::new(config)?;
        let caps: CapabilitiesDto = client
            .get_json(client.url(&["system", "capabilities"])?)
            .await?;
        client.capabilities = BackendCapabilities {
            snapshots: caps.snapshots,
            clones: caps.clones,
            expansion: caps.expansion,
            online_expansion: caps.online_expansion,
        };
        debug!(url = %client.base, capabilities = ?client.capabilities, "connected to e-SAN array");
        Ok(client)
    }

    /// Build a client without contacting the array; every optional
    /// capability starts disabled.
    pub fn new(config: &BackendConfig) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| BackendError::Internal(format!("build http client: {e}")))?;
        let base = Url::parse(&config.url)
            .map_err(|e| BackendError::Rejected(format!("backend url {}: {e}", config.url)))?;
        if base.cannot_be_a_base() {
            return Err(BackendError::Rejected(format!(
                "backend url {} cannot be a base",
                config.url
            )));
        }
        Ok(Self {
            http,
            base,
            token: config.token.clone(),
            read_retries: config.read_retries.max(1),
            capabilities: BackendCapabilities::default(),
        })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| BackendError::Internal("backend url cannot be a base".into()))?
            .pop_if_empty()
            .extend(API_PREFIX)
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let req = self.http.request(method, url);
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn send(&self, req: RequestBuilder) -> Result<reqwest::Response, BackendError> {
        let response = req.send().await.map_err(classify_transport)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(classify_status(status, &text))
    }

    async fn send_json<T: DeserializeOwned>(&self, req: RequestBuilder) -> Result<T, BackendError> {
        self.send(req)
            .await?
            .json::<T>()
            .await
            .map_err(|e| BackendError::Internal(format!("decode array response: {e}")))
    }

    /// GET with bounded retry on transient failures; reads are safe to repeat.
    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> Result<T, BackendError> {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 1;
        loop {
            match self
                .send_json(self.request(Method::GET, url.clone()))
                .await
            {
                Err(err) if err.is_transient() && attempt < self.read_retries => {
                    warn!(%url, attempt, %err, "transient array error, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

/// Map a non-success HTTP status and body onto [`BackendError`].
fn classify_status(status: StatusCode, body: &str) -> BackendError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .map(|b| b.error)
        .ok()
        .filter(|m| !m.is_empty())
        .or_else(|| (!body.is_empty()).then(|| body.to_owned()))
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_owned()
        });
    let message = format!("{status}: {message}");
    match status {
        StatusCode::CONFLICT => BackendError::AlreadyExists(message),
        StatusCode::NOT_FOUND | StatusCode::GONE => BackendError::NotFound(message),
        StatusCode::INSUFFICIENT_STORAGE | StatusCode::PAYLOAD_TOO_LARGE => {
            BackendError::CapacityExhausted(message)
        }
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::FORBIDDEN => {
            BackendError::Rejected(message)
        }
        StatusCode::NOT_IMPLEMENTED => BackendError::Unsupported(message),
        StatusCode::TOO_MANY_REQUESTS
        | StatusCode::BAD_GATEWAY
        | StatusCode::SERVICE_UNAVAILABLE
        | StatusCode::GATEWAY_TIMEOUT
        | StatusCode::REQUEST_TIMEOUT => BackendError::Unavailable(message),
        _ => BackendError::Internal(message),
    }
}

fn classify_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        BackendError::Unavailable(err.to_string())
    } else {
        BackendError::Internal(err.to_string())
    }
}

#[async_trait]
impl BackendClient for EsanClient {
    fn capabilities(&self) -> BackendCapabilities {
        self.capabilities
    }

    #[instrument(skip(self, req), fields(name = %req.name, size = req.size_bytes))]
    async fn create_volume(
        &self,
        req: &BackendCreateRequest,
    ) -> Result<BackendVolume, BackendError> {
        let (source_snapshot_id, source_volume_id) = match &req.content_source {
            Some(VolumeContentSource::Snapshot(id)) => (Some(id), None),
            Some(VolumeContentSource::Volume(id)) => (None, Some(id)),
            None => (None, None),
        };
        let body = CreateVolumeBody {
            name: &req.name,
            size_bytes: req.size_bytes,
            parameters: &req.parameters,
            source_snapshot_id,
            source_volume_id,
        };
        let dto: VolumeDto = self
            .send_json(self.request(Method::POST, self.url(&["volumes"])?).json(&body))
            .await?;
        Ok(dto.into())
    }

    async fn lookup_volume(&self, name: &str) -> Result<Option<BackendVolume>, BackendError> {
        let mut url = self.url(&["volumes"])?;
        url.query_pairs_mut().append_pair("name", name);
        let list: VolumeList = self.get_json(url).await?;
        Ok(list
            .items
            .into_iter()
            .find(|v| v.name == name)
            .map(Into::into))
    }

    #[instrument(skip(self))]
    async fn delete_volume(&self, id: &VolumeId) -> Result<(), BackendError> {
        let url = self.url(&["volumes", id.as_str()])?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn attach_volume(
        &self,
        id: &VolumeId,
        host: &NodeId,
    ) -> Result<TargetDescriptor, BackendError> {
        let url = self.url(&["volumes", id.as_str(), "mappings"])?;
        self.send_json(
            self.request(Method::POST, url)
                .json(&MappingBody { host }),
        )
        .await
    }

    #[instrument(skip(self))]
    async fn detach_volume(&self, id: &VolumeId, host: &NodeId) -> Result<(), BackendError> {
        let url = self.url(&["volumes", id.as_str(), "mappings", host.as_str()])?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn expand_volume(&self, id: &VolumeId, size_bytes: u64) -> Result<u64, BackendError> {
        let url = self.url(&["volumes", id.as_str(), "expand"])?;
        let dto: VolumeDto = self
            .send_json(
                self.request(Method::POST, url)
                    .json(&ExpandBody { size_bytes }),
            )
            .await?;
        Ok(dto.size_bytes)
    }

    #[instrument(skip(self))]
    async fn create_snapshot(
        &self,
        source: &VolumeId,
        name: &str,
    ) -> Result<BackendSnapshot, BackendError> {
        let body = SnapshotBody {
            name,
            source_volume_id: source,
        };
        let dto: SnapshotDto = self
            .send_json(self.request(Method::POST, self.url(&["snapshots"])?).json(&body))
            .await?;
        Ok(dto.into())
    }

    #[instrument(skip(self))]
    async fn delete_snapshot(&self, id: &SnapshotId) -> Result<(), BackendError> {
        let url = self.url(&["snapshots", id.as_str()])?;
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn capacity(&self, parameters: &BTreeMap<String, String>) -> Result<u64, BackendError> {
        let pool = parameters
            .get("pool")
            .map(String::as_str)
            .unwrap_or(DEFAULT_POOL);
        let dto: CapacityDto = self.get_json(self.url(&["pools", pool, "capacity"])?).await?;
        Ok(dto.free_bytes)
    }

    async fn probe(&self) -> Result<(), BackendError> {
        let url = self.url(&["system", "health"])?;
        self.send(self.request(Method::GET, url)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> EsanClient {
        EsanClient::new(&BackendConfig {
            url: url.to_owned(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn url_joins_api_prefix() {
        let c = client("https://array.example:8443/");
        let url = c.url(&["volumes", "vol 1", "mappings"]).unwrap();
        assert_eq!(
            url.as_str(),
            "https://array.example:8443/api/v1/volumes/vol%201/mappings"
        );

        let c = client("https://array.example/mgmt");
        let url = c.url(&["system", "health"]).unwrap();
        assert_eq!(url.as_str(), "https://array.example/mgmt/api/v1/system/health");
    }

    #[test]
    fn rejects_non_base_url() {
        let err = EsanClient::new(&BackendConfig {
            url: "mailto:ops@example.com".into(),
            ..Default::default()
        })
        .unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[test]
    fn status_classification() {
        let err = classify_status(StatusCode::CONFLICT, r#"{"error":"name taken"}"#);
        assert_eq!(
            err,
            BackendError::AlreadyExists("409 Conflict: name taken".into())
        );
        assert!(matches!(
            classify_status(StatusCode::SERVICE_UNAVAILABLE, ""),
            BackendError::Unavailable(_)
        ));
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down").is_transient());
        assert!(matches!(
            classify_status(StatusCode::INSUFFICIENT_STORAGE, "pool full"),
            BackendError::CapacityExhausted(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            BackendError::Internal(_)
        ));
        assert!(!classify_status(StatusCode::NOT_FOUND, "").is_transient());
    }

    #[test]
    fn target_descriptor_wire_format() {
        let target: TargetDescriptor = serde_json::from_str(
            r#"{"protocol":"iscsi","portals":["10.0.0.1:3260"],"iqn":"iqn.x:1","lun":0}"#,
        )
        .unwrap();
        assert!(matches!(target, TargetDescriptor::Iscsi { lun: 0, .. }));
    }
}
