//! Publication of resources to a remote resource directory.

use crate::dispatch::{Abandon, CallbackDispatch, Completion};
use crate::error::{PresenceError, Result};
use crate::lifecycle::LifecycleGuard;
use crate::types::{AsyncToken, DeviceId, ResourceHandle, RpcStatus, MAX_RESOURCES_PER_DIRECTORY_REQUEST};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

/// TTL requested for directory entries when the caller has no preference
/// (one day).
pub const DEFAULT_DIRECTORY_TTL_SECS: u32 = 60 * 60 * 24;

/// Directory operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectoryOperation {
    Publish,
    Delete,
}

/// A directory RPC as handed to the engine.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryRequest {
    pub operation: DirectoryOperation,
    /// Address of the directory service.
    pub host: String,
    /// Resources to publish or delete. Empty on delete means "all of this
    /// device's entries".
    pub resources: Vec<ResourceHandle>,
    pub ttl_secs: u32,
}

/// The directory's record for the publishing device.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryRoot {
    pub href: String,
    pub device_id: DeviceId,
    pub ttl_secs: u32,
}

/// One published resource as the directory stored it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryLink {
    pub href: String,
    pub resource_types: Vec<String>,
    pub interfaces: Vec<String>,
    /// Instance number assigned by the directory.
    pub instance: u64,
}

/// Body of a successful publish: the root entry followed by one link per
/// resource.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryLinks {
    pub root: DirectoryRoot,
    pub links: Vec<DirectoryLink>,
}

/// Terminal result of a directory RPC.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DirectoryResponse {
    pub status: RpcStatus,
    /// Present on successful publish only.
    pub links: Option<DirectoryLinks>,
}

impl DirectoryResponse {
    pub fn status(status: RpcStatus) -> Self {
        Self {
            status,
            links: None,
        }
    }

    pub fn published(links: DirectoryLinks) -> Self {
        Self {
            status: RpcStatus::Changed,
            links: Some(links),
        }
    }
}

impl Abandon for DirectoryResponse {
    fn abandoned() -> Self {
        DirectoryResponse::status(RpcStatus::Cancelled)
    }
}

/// Publishes and deletes resource-directory entries.
///
/// Calls return as soon as the engine has accepted the request. The result
/// reaches the callback later, on a dispatch worker. A call that returns an
/// error never invokes its callback; a call that returns `Ok` always invokes
/// it exactly once.
pub struct DirectoryPublisher {
    lifecycle: Arc<LifecycleGuard>,
    dispatch: CallbackDispatch,
}

impl DirectoryPublisher {
    pub fn new(lifecycle: Arc<LifecycleGuard>, dispatch: CallbackDispatch) -> Self {
        Self {
            lifecycle,
            dispatch,
        }
    }

    /// Publish `resources` to the directory at `host`.
    pub fn publish<F>(
        &self,
        host: &str,
        resources: &[ResourceHandle],
        ttl_secs: u32,
        callback: F,
    ) -> Result<AsyncToken>
    where
        F: FnOnce(DirectoryResponse) + Send + 'static,
    {
        let request = build_request(DirectoryOperation::Publish, host, resources, ttl_secs)?;
        self.issue(request, callback)
    }

    /// Remove `resources` (or, if empty, every entry of this device) from the
    /// directory at `host`.
    pub fn delete_resource<F>(
        &self,
        host: &str,
        resources: &[ResourceHandle],
        callback: F,
    ) -> Result<AsyncToken>
    where
        F: FnOnce(RpcStatus) + Send + 'static,
    {
        let request = build_request(DirectoryOperation::Delete, host, resources, 0)?;
        self.issue(request, move |response: DirectoryResponse| callback(response.status))
    }

    fn issue<F>(&self, request: DirectoryRequest, callback: F) -> Result<AsyncToken>
    where
        F: FnOnce(DirectoryResponse) + Send + 'static,
    {
        let mode = self.lifecycle.mode();
        if !mode.has_client() {
            return Err(PresenceError::WrongMode {
                mode,
                needs: "client",
            });
        }
        let operation = request.operation;
        let count = request.resources.len();
        let (completion, pending) = Completion::new(&self.dispatch, callback);

        let token = self.lifecycle.borrow_lock();
        let issued = match token.resolve() {
            Ok(engine) => engine.issue_directory_rpc(request, completion),
            Err(e) => {
                pending.reject();
                return Err(e);
            }
        };

        match issued {
            Ok(async_token) => {
                pending.accept();
                debug!(?operation, resources = count, token = ?async_token, "directory request issued");
                Ok(async_token)
            }
            Err(e) => {
                pending.reject();
                warn!(?operation, error = %e, "directory request rejected by engine");
                Err(PresenceError::SendFailed(e.to_string()))
            }
        }
    }
}

fn build_request(
    operation: DirectoryOperation,
    host: &str,
    resources: &[ResourceHandle],
    ttl_secs: u32,
) -> Result<DirectoryRequest> {
    if host.is_empty() {
        return Err(PresenceError::InvalidParam("directory host is empty".to_string()));
    }
    if resources.len() > MAX_RESOURCES_PER_DIRECTORY_REQUEST {
        return Err(PresenceError::TooManyResources {
            count: resources.len(),
            max: MAX_RESOURCES_PER_DIRECTORY_REQUEST,
        });
    }
    Ok(DirectoryRequest {
        operation,
        host: host.to_string(),
        resources: resources.to_vec(),
        ttl_secs,
    })
}
