//! JSON wire types exchanged over the WebSocket.
//!
//! Every frame is one JSON object. Clients send [`Request`]s; the daemon
//! answers each with an [`Envelope`] carrying the same `requestId`, and pushes
//! unsolicited `downloading` envelopes for subscribed downloads.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;
use crate::catalog::Item;

/// Update type of server-pushed download events.
pub const DOWNLOADING_UPDATE: &str = "downloading";

/// Commands understood by the daemon.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Method {
    Download,
    Resume,
    Attach,
    Stop,
    Flush,
    List,
    LoadExtension,
    GetExtension,
}

/// Inbound request frame.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub method: String,
    #[serde(default)]
    pub message: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

/// Error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// The client may retry or continue.
    Recoverable,
    /// The download is over.
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Update {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_id: Option<String>,
}

/// Outbound frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<Update>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Envelope {
    pub fn update(kind: impl Into<String>, message: Value) -> Self {
        Self {
            ok: true,
            request_id: None,
            update: Some(Update {
                kind: kind.into(),
                message,
            }),
            error: None,
        }
    }

    pub fn error(body: ErrorBody) -> Self {
        Self {
            ok: false,
            request_id: None,
            update: None,
            error: Some(body),
        }
    }

    /// Response to a failed request.
    pub fn request_error(error: &Error) -> Self {
        Self::error(ErrorBody {
            severity: Severity::Recoverable,
            code: error.code().to_string(),
            message: error.to_string(),
            download_id: None,
        })
    }

    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }
}

/// Lifecycle actions carried by `downloading` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Action {
    DownloadProgress,
    DownloadComplete,
    DownloadStopped,
    CompileStart,
    CompileProgress,
    CompileComplete,
}

/// Payload of a `downloading` update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadingEvent {
    /// Identifier the subscribers attached to.
    pub download_id: String,
    pub action: Action,
    /// Identifier of the stream that produced the event.
    pub hash: String,
    pub value: u64,
    /// Combined percentage across a stream pair.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
}

impl DownloadingEvent {
    pub fn new(download_id: impl Into<String>, action: Action, value: u64) -> Self {
        let download_id = download_id.into();
        Self {
            hash: download_id.clone(),
            download_id,
            action,
            value,
            percentage: None,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.hash = hash.into();
        self
    }

    pub fn with_percentage(mut self, percentage: u8) -> Self {
        self.percentage = Some(percentage);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DownloadParams {
    pub url: String,
    #[serde(alias = "downloadDirectory")]
    pub directory: String,
    pub file_name: String,
    pub headers: Vec<Header>,
    pub force_parts: bool,
    pub max_connections: u32,
    pub max_segments: u32,
    pub child_hash: String,
    pub is_hidden: bool,
    pub is_children: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadResponse {
    pub download_id: String,
    pub file_name: String,
    pub save_path: String,
    pub directory: String,
    pub content_length: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeParams {
    pub download_id: String,
    #[serde(default)]
    pub force_parts: bool,
    #[serde(default)]
    pub max_connections: u32,
    #[serde(default)]
    pub max_segments: u32,
}

/// Metadata of a known item, returned by resume and attach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResponse {
    pub download_id: String,
    pub file_name: String,
    pub save_path: String,
    pub directory: String,
    pub content_length: u64,
    pub downloaded: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_hash: Option<String>,
}

impl From<&Item> for ItemResponse {
    fn from(item: &Item) -> Self {
        Self {
            download_id: item.hash.clone(),
            file_name: item.name.clone(),
            save_path: item.save_path().to_string_lossy().into_owned(),
            directory: item.absolute_location.to_string_lossy().into_owned(),
            content_length: item.total_size,
            downloaded: item.downloaded,
            child_hash: item.child().map(str::to_string),
        }
    }
}

/// Payload naming a single download.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadIdParams {
    pub download_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopResponse {
    pub download_id: String,
    /// Whether a running transfer was halted.
    pub stopped: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FlushParams {
    /// Flush every inactive completed item when absent.
    pub download_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlushResponse {
    pub flushed: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ListParams {
    pub show_completed: bool,
    pub show_pending: bool,
    pub show_hidden: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListItem {
    pub hash: String,
    pub name: String,
    pub url: String,
    pub total_size: u64,
    pub downloaded: u64,
    pub percentage: u8,
    pub completed: bool,
    pub hidden: bool,
    pub children: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_hash: Option<String>,
    pub save_path: String,
    pub date_added: String,
}

impl From<&Item> for ListItem {
    fn from(item: &Item) -> Self {
        Self {
            hash: item.hash.clone(),
            name: item.name.clone(),
            url: item.url.clone(),
            total_size: item.total_size,
            downloaded: item.downloaded,
            percentage: item.percentage(),
            completed: item.is_complete(),
            hidden: item.hidden,
            children: item.children,
            child_hash: item.child().map(str::to_string),
            save_path: item.save_path().to_string_lossy().into_owned(),
            date_added: item.date_added.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListResponse {
    pub items: Vec<ListItem>,
    /// Human-readable note when nothing matched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoadExtensionParams {
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetExtensionParams {
    pub extension_id: String,
}
