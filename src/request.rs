//! Per-component request helper.
//!
//! A component creates one `RequestHelper` against its module's
//! `RequestScope` and issues every backend call through it. The helper ties
//! each call to an abort controller registered in the scope, guarantees the
//! registry slot is released when the call settles, and keeps its own
//! tracking set so that dropping the component aborts whatever it still has
//! in flight even when the enclosing scope lives on.
//!
//! Cancellation - whether through the scope's abort signal or reported by
//! the transport itself - resolves to `Ok(None)`. Callers must treat `None`
//! as "discard, do not update state"; only genuine failures surface as
//! errors.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::future::{AbortHandle, Abortable};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::scope::{RequestId, RequestScope};
use crate::transport::{RequestOptions, Transport, TransportError};

pub struct RequestHelper {
    scope: Arc<RequestScope>,
    transport: Arc<dyn Transport>,
    tracked: Mutex<HashMap<RequestId, AbortHandle>>,
}

impl RequestHelper {
    pub fn new(scope: Arc<RequestScope>, transport: Arc<dyn Transport>) -> Self {
        Self {
            scope,
            transport,
            tracked: Mutex::new(HashMap::new()),
        }
    }

    /// Helper for components constructed outside any module scope. Requests
    /// still work; there is just no module-wide cancel-all covering them.
    pub fn detached(transport: Arc<dyn Transport>) -> Self {
        Self::new(RequestScope::detached(), transport)
    }

    pub fn scope(&self) -> &Arc<RequestScope> {
        &self.scope
    }

    /// Issue one cancellable backend call.
    ///
    /// Returns `Ok(None)` when the request was abandoned (scope teardown,
    /// component teardown, or transport-reported cancellation) and
    /// `Ok(Some(..))` with the decoded payload on success. The request is
    /// unregistered from the scope however it settles.
    pub async fn make_request<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        options: RequestOptions,
    ) -> Result<Option<T>, TransportError> {
        let handle = self.scope.get_abort_controller();
        let request_id = handle.request_id().clone();
        let abort = handle.abort_handle();
        let (registration, scope_entry) = handle.into_parts();

        self.lock_tracked().insert(request_id.clone(), abort);

        debug!(request = %request_id, endpoint, "issuing request");
        let outcome = Abortable::new(self.transport.request(endpoint, options), registration).await;

        // Settled or abandoned: stop tracking and release the scope slot.
        self.lock_tracked().remove(&request_id);
        scope_entry.unregister();

        match outcome {
            Err(_aborted) => {
                debug!(request = %request_id, "request aborted, discarding result");
                Ok(None)
            }
            Ok(Err(error)) if error.is_cancelled() => {
                debug!(request = %request_id, "transport reported cancellation, discarding result");
                Ok(None)
            }
            Ok(Err(error)) => {
                warn!(request = %request_id, %error, "request failed");
                Err(error)
            }
            Ok(Ok(value)) => {
                let decoded = serde_json::from_value(value).map_err(|e| {
                    TransportError::InvalidResponse(format!("response decode failed: {}", e))
                })?;
                Ok(Some(decoded))
            }
        }
    }

    fn lock_tracked(&self) -> MutexGuard<'_, HashMap<RequestId, AbortHandle>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RequestHelper {
    /// Component teardown: abort and unregister every request this
    /// component still has in flight. Covers the case where only the
    /// component goes away while its scope persists.
    fn drop(&mut self) {
        let drained: Vec<(RequestId, AbortHandle)> = self.lock_tracked().drain().collect();
        for (request_id, handle) in drained {
            handle.abort();
            self.scope.unregister(&request_id);
            debug!(request = %request_id, "component teardown aborted request");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
