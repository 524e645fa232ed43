//! Caller identity middleware.
//!
//! Identity is verified by the auth collaborator in front of the relay and
//! arrives as plain headers. It is attached to the request for logging and
//! never re-validated here.

use axum::{extract::Request, http::HeaderMap, middleware::Next, response::Response};

pub const CALLER_ID_HEADER: &str = "x-caller-id";
pub const CALLER_SCOPES_HEADER: &str = "x-caller-scopes";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallerIdentity {
    pub id: Option<String>,
    pub scopes: Vec<String>,
}

impl CallerIdentity {
    pub fn from_headers(headers: &HeaderMap) -> Self {
        let header = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
        };

        Self {
            id: header(CALLER_ID_HEADER).map(str::to_string),
            scopes: header(CALLER_SCOPES_HEADER)
                .map(|raw| {
                    raw.split([',', ' '])
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    /// Value for the `caller` log field.
    pub fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("anonymous")
    }
}

pub async fn caller_identity(mut request: Request, next: Next) -> Response {
    let caller = CallerIdentity::from_headers(request.headers());
    tracing::debug!(
        caller = caller.label(),
        scopes = ?caller.scopes,
        method = %request.method(),
        path = %request.uri().path(),
        "Request received"
    );
    request.extensions_mut().insert(caller);
    next.run(request).await
}
