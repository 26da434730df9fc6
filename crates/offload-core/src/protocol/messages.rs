//! Typed message bodies carried in an envelope payload.
//!
//! `Payload` is the closed set of every request, response and event kind the
//! provider understands. Adding a kind means adding a variant here, and every
//! `match` on it stops compiling until the new kind is handled.

use serde::{Deserialize, Serialize};

/// Identity of a task as assigned by the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetadata {
    pub id: String,
    pub client: String,
    pub index: u64,
}

/// A file given either by stored reference or inline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FileRef {
    Reference(String),
    Raw(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteTaskRequest {
    pub task: TaskMetadata,
    pub executable: FileRef,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub envs: Vec<String>,
    #[serde(default)]
    pub stdin: Vec<u8>,
    #[serde(default)]
    pub rootfs: Option<FileRef>,
    /// Paths inside the sandbox to collect into a zip archive after the run.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

/// Captured outcome of a task that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutput {
    pub exit_status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub artifacts: Option<Vec<u8>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExecuteTaskResponse {
    Ok(TaskOutput),
    Error(String),
}

/// Cancel request; echoed back as the response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelTask {
    pub id: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListingRequest {}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileListingResponse {
    pub filenames: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProbeRequest {
    pub filename: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileProbeResponse {
    pub found: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUploadRequest {
    /// Requested name; replaced by the content hash unless already shaped like one.
    pub filename: String,
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileUploadResponse {
    pub ok: bool,
    /// Name the file was stored under.
    pub filename: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingDirection {
    #[default]
    Ping,
    Pong,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub direction: PingDirection,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderHello {
    pub name: String,
    pub platform: String,
    pub useragent: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderResources {
    /// Number of executors in the pool.
    pub concurrency: u32,
    /// Number of executors currently running a task.
    pub tasks: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSystemUpdate {
    pub added: Vec<String>,
    pub removed: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericEvent {
    pub message: String,
}

/// Self-describing payload of an envelope.
///
/// The variant name is the type discriminator on the wire in both encodings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    // requests
    ExecuteTask(ExecuteTaskRequest),
    CancelTask(CancelTask),
    FileListing(FileListingRequest),
    FileProbe(FileProbeRequest),
    FileUpload(FileUploadRequest),
    Ping(Ping),

    // responses
    ExecuteTaskResult(ExecuteTaskResponse),
    FileListingResult(FileListingResponse),
    FileProbeResult(FileProbeResponse),
    FileUploadResult(FileUploadResponse),

    // events
    ProviderHello(ProviderHello),
    ProviderResources(ProviderResources),
    FileSystemUpdate(FileSystemUpdate),
    GenericEvent(GenericEvent),
}

impl Payload {
    /// Name of the variant, used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::ExecuteTask(_) => "ExecuteTask",
            Payload::CancelTask(_) => "CancelTask",
            Payload::FileListing(_) => "FileListing",
            Payload::FileProbe(_) => "FileProbe",
            Payload::FileUpload(_) => "FileUpload",
            Payload::Ping(_) => "Ping",
            Payload::ExecuteTaskResult(_) => "ExecuteTaskResult",
            Payload::FileListingResult(_) => "FileListingResult",
            Payload::FileProbeResult(_) => "FileProbeResult",
            Payload::FileUploadResult(_) => "FileUploadResult",
            Payload::ProviderHello(_) => "ProviderHello",
            Payload::ProviderResources(_) => "ProviderResources",
            Payload::FileSystemUpdate(_) => "FileSystemUpdate",
            Payload::GenericEvent(_) => "GenericEvent",
        }
    }
}

/// Conversions between a message body and its `Payload` variant.
macro_rules! payload_variant {
    ($variant:ident, $ty:ty) => {
        impl From<$ty> for Payload {
            fn from(value: $ty) -> Self {
                Payload::$variant(value)
            }
        }

        impl TryFrom<Payload> for $ty {
            type Error = crate::error::ProviderError;

            fn try_from(
                payload: Payload,
            ) -> std::result::Result<Self, crate::error::ProviderError> {
                match payload {
                    Payload::$variant(value) => Ok(value),
                    other => Err(crate::error::ProviderError::UnexpectedPayload {
                        expected: stringify!($variant),
                        actual: other.kind(),
                    }),
                }
            }
        }
    };
}

payload_variant!(ExecuteTask, ExecuteTaskRequest);
payload_variant!(CancelTask, CancelTask);
payload_variant!(FileListing, FileListingRequest);
payload_variant!(FileProbe, FileProbeRequest);
payload_variant!(FileUpload, FileUploadRequest);
payload_variant!(Ping, Ping);
payload_variant!(ExecuteTaskResult, ExecuteTaskResponse);
payload_variant!(FileListingResult, FileListingResponse);
payload_variant!(FileProbeResult, FileProbeResponse);
payload_variant!(FileUploadResult, FileUploadResponse);
payload_variant!(ProviderHello, ProviderHello);
payload_variant!(ProviderResources, ProviderResources);
payload_variant!(FileSystemUpdate, FileSystemUpdate);
payload_variant!(GenericEvent, GenericEvent);
