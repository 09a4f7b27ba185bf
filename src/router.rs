//! Entity-request routing with piggybacked observe registration.

use crate::dispatch::CallbackDispatch;
use crate::error::{PresenceError, Result};
use crate::lifecycle::{LifecycleGuard, LockToken};
use crate::notify::NotificationDispatcher;
use crate::types::{ObserveAction, ObserverEntry, Representation, ResourceHandle};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

/// Engine-assigned identity of one inbound request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    Get,
    Put,
    Post,
    Delete,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    Content,
    Created,
    Changed,
    Deleted,
    BadRequest,
    NotFound,
    MethodNotAllowed,
    InternalError,
}

impl ResponseCode {
    /// Success code for a completed `method`.
    pub fn success_for(method: Method) -> Self {
        match method {
            Method::Get => ResponseCode::Content,
            Method::Put | Method::Post => ResponseCode::Changed,
            Method::Delete => ResponseCode::Deleted,
        }
    }

    pub fn is_success(self) -> bool {
        matches!(
            self,
            ResponseCode::Content
                | ResponseCode::Created
                | ResponseCode::Changed
                | ResponseCode::Deleted
        )
    }
}

/// A request addressed to one of this server's resources.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityRequest {
    pub id: RequestId,
    pub resource: ResourceHandle,
    pub method: Method,
    /// Observe option carried by a GET.
    pub observe: Option<(ObserveAction, ObserverEntry)>,
    pub payload: Option<Representation>,
}

/// The reply the engine sends for an [`EntityRequest`].
#[derive(Clone, Debug, PartialEq)]
pub struct EntityResponse {
    pub request_id: RequestId,
    pub resource: ResourceHandle,
    pub code: ResponseCode,
    pub payload: Option<Representation>,
}

/// What a handler did with a request.
#[derive(Clone, Debug, PartialEq)]
pub enum EntityHandlerResult {
    /// Handled; the router replies with the method's success code.
    Ok(Option<Representation>),
    /// The reply will be sent later, typically through
    /// [`HandlerContext::defer`].
    Pending,
    /// Rejected with `code`.
    Error(ResponseCode),
}

/// Handles requests for one resource.
pub trait EntityHandler: Send + Sync {
    fn handle(&self, request: &EntityRequest, context: &HandlerContext) -> EntityHandlerResult;
}

impl<F> EntityHandler for F
where
    F: Fn(&EntityRequest, &HandlerContext) -> EntityHandlerResult + Send + Sync,
{
    fn handle(&self, request: &EntityRequest, context: &HandlerContext) -> EntityHandlerResult {
        self(request, context)
    }
}

/// Handed to a handler alongside its request.
pub struct HandlerContext {
    request_id: RequestId,
    resource: ResourceHandle,
    method: Method,
    lifecycle: Arc<LifecycleGuard>,
    dispatch: CallbackDispatch,
}

impl HandlerContext {
    /// Finish the request on a dispatch worker.
    ///
    /// `work` runs off the engine's context; its result is sent as the reply.
    /// The handler should return [`EntityHandlerResult::Pending`]. If the
    /// engine is torn down before `work` finishes the reply is dropped.
    pub fn defer<W>(&self, work: W)
    where
        W: FnOnce() -> std::result::Result<Option<Representation>, ResponseCode> + Send + 'static,
    {
        let token = self.lifecycle.borrow_lock();
        let (request_id, resource, method) = (self.request_id, self.resource, self.method);
        self.dispatch.submit(move || {
            let response = match work() {
                Ok(payload) => EntityResponse {
                    request_id,
                    resource,
                    code: ResponseCode::success_for(method),
                    payload,
                },
                Err(code) => EntityResponse {
                    request_id,
                    resource,
                    code,
                    payload: None,
                },
            };
            if let Err(e) = send_response(&token, response) {
                warn!(?request_id, error = %e, "deferred response not sent");
            }
        });
    }

    pub fn request_id(&self) -> RequestId {
        self.request_id
    }
}

/// Routes entity requests to per-resource handlers.
pub struct RequestRouter {
    notifier: NotificationDispatcher,
    lifecycle: Arc<LifecycleGuard>,
    dispatch: CallbackDispatch,
    handlers: RwLock<HashMap<ResourceHandle, Arc<dyn EntityHandler>>>,
}

impl RequestRouter {
    pub fn new(
        notifier: NotificationDispatcher,
        lifecycle: Arc<LifecycleGuard>,
        dispatch: CallbackDispatch,
    ) -> Self {
        Self {
            notifier,
            lifecycle,
            dispatch,
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Install `handler` for `resource`, replacing any previous one.
    pub fn register_handler<H>(&self, resource: ResourceHandle, handler: H)
    where
        H: EntityHandler + 'static,
    {
        self.handlers.write().insert(resource, Arc::new(handler));
        debug!(%resource, "handler registered");
    }

    /// Remove `resource`'s handler and end its observations.
    ///
    /// Returns how many observers were told the resource is gone.
    pub fn unregister_handler(&self, resource: ResourceHandle) -> Result<usize> {
        if self.handlers.write().remove(&resource).is_none() {
            return Err(PresenceError::UnknownResource(resource));
        }
        debug!(%resource, "handler unregistered");
        self.notifier.notify_deleted(resource)
    }

    pub fn has_handler(&self, resource: ResourceHandle) -> bool {
        self.handlers.read().contains_key(&resource)
    }

    /// Handle one inbound request and send its reply.
    ///
    /// A request for a resource without a handler is answered `NotFound` and
    /// reported as `UnknownResource`.
    pub fn dispatch(&self, request: EntityRequest) -> Result<EntityHandlerResult> {
        let handler = self.handlers.read().get(&request.resource).cloned();
        let Some(handler) = handler else {
            self.reply(&request, ResponseCode::NotFound, None)?;
            return Err(PresenceError::UnknownResource(request.resource));
        };

        let observe = match (&request.observe, request.method) {
            (Some(observe), Method::Get) => Some(observe.clone()),
            (Some(_), method) => {
                debug!(?method, "observe option ignored on non-GET");
                None
            }
            (None, _) => None,
        };
        if let Some((ObserveAction::Unregister, observer)) = &observe {
            self.notifier.registry().unregister(request.resource, observer.id);
        }

        let context = HandlerContext {
            request_id: request.id,
            resource: request.resource,
            method: request.method,
            lifecycle: Arc::clone(&self.lifecycle),
            dispatch: self.dispatch.clone(),
        };
        let result = handler.handle(&request, &context);

        if let Some((ObserveAction::Register, observer)) = observe {
            if !matches!(result, EntityHandlerResult::Error(_)) {
                self.notifier.registry().register(request.resource, observer);
            }
        }

        match &result {
            EntityHandlerResult::Ok(payload) => {
                let code = ResponseCode::success_for(request.method);
                self.reply(&request, code, payload.clone())?;
            }
            EntityHandlerResult::Error(code) => self.reply(&request, *code, None)?,
            EntityHandlerResult::Pending => {
                debug!(request = ?request.id, "response deferred");
            }
        }
        Ok(result)
    }

    fn reply(
        &self,
        request: &EntityRequest,
        code: ResponseCode,
        payload: Option<Representation>,
    ) -> Result<()> {
        let response = EntityResponse {
            request_id: request.id,
            resource: request.resource,
            code,
            payload,
        };
        send_response(&self.lifecycle.borrow_lock(), response)
    }
}

fn send_response(token: &LockToken, response: EntityResponse) -> Result<()> {
    let engine = token.resolve()?;
    engine
        .send_response(response)
        .map_err(|e| PresenceError::SendFailed(e.to_string()))
}
