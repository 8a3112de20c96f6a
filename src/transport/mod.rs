//! Transport boundary for the farm backend API.
//!
//! The request helper and the domain callers only see the `Transport`
//! trait; `HttpTransport` is the reqwest-backed implementation used in the
//! real application. Implementations must report caller abandonment as
//! `TransportError::Cancelled`, distinct from every other failure, so the
//! request helper can translate it into a benign no-op result.

pub mod client;
pub mod error;

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

pub use client::HttpTransport;
pub use error::TransportError;

/// Options for a single transport request.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            query: Vec::new(),
            body: None,
        }
    }
}

impl RequestOptions {
    pub fn get() -> Self {
        Self::default()
    }

    pub fn post(body: Value) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn put(body: Value) -> Self {
        Self {
            method: Method::PUT,
            body: Some(body),
            ..Self::default()
        }
    }

    pub fn delete() -> Self {
        Self {
            method: Method::DELETE,
            ..Self::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// One asynchronous backend operation.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue one request against the backend. Abandonment by the caller
    /// must surface as `TransportError::Cancelled`.
    async fn request(&self, endpoint: &str, options: RequestOptions)
        -> Result<Value, TransportError>;
}
