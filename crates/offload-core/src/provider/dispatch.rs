//! RPC dispatch: maps an inbound request to the store and the pool.

use super::Provider;
use crate::pool::TaskParams;
use crate::protocol::{
    CancelTask, ExecuteTaskRequest, ExecuteTaskResponse, FileListingResponse, FileProbeResponse,
    FileRef, FileUploadRequest, FileUploadResponse, Payload, Ping, PingDirection,
};
use crate::store::CompiledModule;
use crate::{ProviderError, Result};
use bytes::Bytes;
use std::sync::Arc;
use tracing::{debug, warn};

impl Provider {
    /// Answer one request payload.
    ///
    /// Failures come back as `Err` and are sent as the response's error
    /// message. A task that fails once it is running is a successful
    /// response carrying [`ExecuteTaskResponse::Error`].
    pub async fn dispatch(&self, request: Payload) -> Result<Payload> {
        match request {
            Payload::ExecuteTask(request) => {
                self.execute(request).await.map(Payload::ExecuteTaskResult)
            }
            Payload::CancelTask(request) => self.cancel(request).await.map(Payload::CancelTask),
            Payload::FileListing(_) => {
                let filenames = self.store().list().await?;
                Ok(Payload::FileListingResult(FileListingResponse { filenames }))
            }
            Payload::FileProbe(request) => {
                let found = self.store().has(&request.filename).await?;
                Ok(Payload::FileProbeResult(FileProbeResponse { found }))
            }
            Payload::FileUpload(request) => self.upload(request).await.map(Payload::FileUploadResult),
            Payload::Ping(_) => Ok(Payload::Ping(Ping {
                direction: PingDirection::Pong,
            })),
            other @ (Payload::ExecuteTaskResult(_)
            | Payload::FileListingResult(_)
            | Payload::FileProbeResult(_)
            | Payload::FileUploadResult(_)
            | Payload::ProviderHello(_)
            | Payload::ProviderResources(_)
            | Payload::FileSystemUpdate(_)
            | Payload::GenericEvent(_)) => Err(ProviderError::InvalidRequest {
                message: format!("{} is not a request", other.kind()),
            }),
        }
    }

    async fn execute(&self, request: ExecuteTaskRequest) -> Result<ExecuteTaskResponse> {
        let task_id = request.task.id.clone();
        if task_id.is_empty() {
            return Err(ProviderError::InvalidRequest {
                message: "task id cannot be empty".to_string(),
            });
        }

        let module = match request.executable {
            FileRef::Raw(bytes) => Arc::new(CompiledModule::compile(&task_id, Bytes::from(bytes))?),
            FileRef::Reference(name) if name.is_empty() => {
                return Err(ProviderError::InvalidRequest {
                    message: "executable: neither bytes nor reference were given".to_string(),
                })
            }
            FileRef::Reference(name) => self.store().get_module(&name).await?,
        };
        debug!(
            "Task {} from {} (#{}) runs {}",
            task_id, request.task.client, request.task.index, module.name
        );

        let rootfs = request.rootfs;
        let outcome = async {
            let rootfs = match rootfs {
                None => None,
                Some(FileRef::Raw(bytes)) => Some(Bytes::from(bytes)),
                Some(FileRef::Reference(name)) => Some(self.store().get_archive(&name).await?),
            };
            let params = TaskParams {
                module,
                args: request.args,
                envs: request.envs,
                stdin: Bytes::from(request.stdin),
                rootfs,
                artifacts: request.artifacts,
            };
            self.pool().run_task(&task_id, params).await
        }
        .await;

        Ok(match outcome {
            Ok(output) => ExecuteTaskResponse::Ok(output),
            Err(e) => {
                debug!("Task {} failed: {}", task_id, e);
                ExecuteTaskResponse::Error(e.to_string())
            }
        })
    }

    async fn cancel(&self, request: CancelTask) -> Result<CancelTask> {
        if request.id.is_empty() {
            return Err(ProviderError::InvalidRequest {
                message: "missing the task id to cancel".to_string(),
            });
        }
        warn!("Cancelling task {}: {}", request.id, request.reason);
        if !self.pool().cancel(&request.id).await {
            debug!("Task {} is not running here", request.id);
        }
        Ok(request)
    }

    async fn upload(&self, request: FileUploadRequest) -> Result<FileUploadResponse> {
        if request.bytes.is_empty() {
            return Err(ProviderError::InvalidRequest {
                message: "empty upload".to_string(),
            });
        }
        let name = (!request.filename.is_empty()).then_some(request.filename.as_str());
        let filename = self
            .store()
            .upload(name, Bytes::from(request.bytes), &request.content_type)
            .await?;
        Ok(FileUploadResponse { ok: true, filename })
    }
}
