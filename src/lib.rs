//! Core library for farmcache - a farm-management record system over a
//! remote REST backend.
//!
//! The feed, livestock and land modules are ordinary CRUD screens; what they
//! share is this crate: the prefetch cache and the request-lifecycle
//! coordinator that keep them from issuing redundant network calls and from
//! updating torn-down UI state.
//!
//! - [`cache::PrefetchCache`]: keyed single-flight cache. Concurrent callers
//!   for one key coalesce onto a single fetch; a failed refresh keeps the
//!   previous value available.
//! - [`scope::RequestScope`]: per-module registry of abort handles with
//!   module-wide cancel-all and an advisory visibility flag.
//! - [`request::RequestHelper`]: per-component wrapper that issues one
//!   transport call tied to its scope's abort signal and reports
//!   cancellation as a benign `None` instead of an error.
//! - [`transport`]: the backend boundary - a `Transport` trait plus the
//!   reqwest-backed `HttpTransport`.

pub mod cache;
pub mod config;
pub mod request;
pub mod scope;
pub mod transport;

pub use cache::{CacheKey, EntryStatus, PrefetchCache, PrefetchError, PrefetchOptions};
pub use config::Config;
pub use request::RequestHelper;
pub use scope::{ModuleActivity, RequestHandle, RequestId, RequestScope, ScopeRegistration};
pub use transport::{HttpTransport, RequestOptions, Transport, TransportError};
