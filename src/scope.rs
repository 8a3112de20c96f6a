//! Per-module request scopes.
//!
//! Each feature module (feed, livestock, land) owns one `RequestScope`: a
//! registry of abort handles for its in-flight requests, with module-wide
//! cancel-all for teardown and an advisory visibility flag for tab focus.
//!
//! Scopes are isolated by construction; cancelling one module's requests
//! can never touch another module's registry. The scope is passed explicitly
//! (behind `Arc`) to whoever issues requests for the module.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{AbortHandle, AbortRegistration};
use tracing::debug;

/// Identifier for one in-flight request within a module scope.
pub type RequestId = String;

/// Cancellation boundary for one UI module.
pub struct RequestScope {
    module_id: String,
    active: AtomicBool,
    next_request: AtomicU64,
    registry: Mutex<HashMap<RequestId, AbortHandle>>,
}

impl RequestScope {
    pub fn new(module_id: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            module_id: module_id.into(),
            active: AtomicBool::new(true),
            next_request: AtomicU64::new(0),
            registry: Mutex::new(HashMap::new()),
        })
    }

    /// Inert scope for components constructed outside any module. It hands
    /// out fully usable handles instead of failing; nothing ever cancels
    /// them module-wide.
    pub fn detached() -> Arc<Self> {
        Self::new("detached")
    }

    pub fn module_id(&self) -> &str {
        &self.module_id
    }

    /// Advisory visibility flag. Not enforced by the scope: an inactive
    /// module can still register and run requests.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::SeqCst);
        debug!(module = %self.module_id, active, "module visibility changed");
    }

    /// Cheap cloneable reader over this scope's visibility flag.
    pub fn activity(self: &Arc<Self>) -> ModuleActivity {
        ModuleActivity {
            scope: Arc::clone(self),
        }
    }

    /// Insert a controller under the given id. Idempotent: an existing
    /// registration under the same id is kept and the new handle dropped.
    /// The returned token unregisters the id.
    pub fn register_abort_controller(
        self: &Arc<Self>,
        request_id: &RequestId,
        handle: AbortHandle,
    ) -> ScopeRegistration {
        self.lock_registry()
            .entry(request_id.clone())
            .or_insert(handle);
        ScopeRegistration {
            scope: Arc::clone(self),
            request_id: request_id.clone(),
        }
    }

    /// Allocate a fresh request id and abort controller, register it, and
    /// hand it to the caller.
    ///
    /// Always succeeds, whatever `is_active` says: requests already started
    /// must be allowed to run to completion while the module tab is not
    /// focused.
    pub fn get_abort_controller(self: &Arc<Self>) -> RequestHandle {
        let seq = self.next_request.fetch_add(1, Ordering::Relaxed) + 1;
        let request_id = format!("req_{}_{}", self.module_id, seq);
        let (handle, registration) = AbortHandle::new_pair();
        let scope_entry = self.register_abort_controller(&request_id, handle.clone());
        debug!(module = %self.module_id, request = %request_id, "request registered");
        RequestHandle {
            request_id,
            handle,
            registration,
            scope_entry,
        }
    }

    /// Abort every registered request and clear the registry.
    ///
    /// Invoked only when the module is fully torn down, never because it
    /// merely became inactive: switching tabs must not orphan in-flight
    /// reads or writes. Aborting is idempotent, so a handle the component
    /// already aborted is a no-op here.
    pub fn cancel_module_requests(&self) {
        let drained: Vec<(RequestId, AbortHandle)> = {
            let mut registry = self.lock_registry();
            registry.drain().collect()
        };
        if drained.is_empty() {
            return;
        }
        debug!(module = %self.module_id, count = drained.len(), "cancelling module requests");
        for (request_id, handle) in drained {
            handle.abort();
            debug!(request = %request_id, "request aborted");
        }
    }

    /// Number of requests currently registered.
    pub fn pending_requests(&self) -> usize {
        self.lock_registry().len()
    }

    pub(crate) fn unregister(&self, request_id: &RequestId) {
        let removed = self.lock_registry().remove(request_id);
        if removed.is_some() {
            debug!(module = %self.module_id, request = %request_id, "request unregistered");
        }
    }

    fn lock_registry(&self) -> MutexGuard<'_, HashMap<RequestId, AbortHandle>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Controller for one registered request, exclusively owned by the component
/// that requested it until it is cleaned up or the scope aborts it.
pub struct RequestHandle {
    request_id: RequestId,
    handle: AbortHandle,
    registration: AbortRegistration,
    scope_entry: ScopeRegistration,
}

impl RequestHandle {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    /// The abort signal for this request; clones observe the same signal.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Split into the registration to attach to a future (via
    /// `futures::future::Abortable`) and the token that removes the request
    /// from its scope once it has settled.
    pub fn into_parts(self) -> (AbortRegistration, ScopeRegistration) {
        (self.registration, self.scope_entry)
    }

    /// Release the registry slot for a request that was never issued.
    pub fn cleanup(self) {
        self.scope_entry.unregister();
    }
}

/// Token that removes one request from its scope's registry. Safe to invoke
/// after the scope has already cancelled (and thereby removed) the request.
pub struct ScopeRegistration {
    scope: Arc<RequestScope>,
    request_id: RequestId,
}

impl ScopeRegistration {
    pub fn request_id(&self) -> &RequestId {
        &self.request_id
    }

    pub fn unregister(&self) {
        self.scope.unregister(&self.request_id);
    }
}

/// Read accessor for a module's visibility flag, handed to components that
/// only need to know whether their module is focused.
#[derive(Clone)]
pub struct ModuleActivity {
    scope: Arc<RequestScope>,
}

impl ModuleActivity {
    pub fn is_active(&self) -> bool {
        self.scope.is_active()
    }

    pub fn module_id(&self) -> &str {
        self.scope.module_id()
    }
}

// ============================================================================
// Tests
// ============================================================================
