//! HTTP collaborators of the tracking core: the routing service and the
//! durable location write.

use std::{error, fmt, sync::Arc};

pub mod client;
pub mod upload;

pub use client::HttpRouteService;
pub use upload::LocationUploader;

#[derive(Debug, Clone)]
pub enum RoutingError {
    RequestError(Arc<reqwest::Error>),
    JsonError(Arc<serde_json::Error>),
    InvalidResponse {
        status_code: reqwest::StatusCode,
        url: String,
        response: Option<String>,
    },
    EmptyGeometry,
}

impl error::Error for RoutingError {}

impl fmt::Display for RoutingError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RoutingError::RequestError(e) => write!(f, "HTTP request error: {}", e),
            RoutingError::JsonError(e) => write!(f, "JSON parse error: {}", e),
            RoutingError::InvalidResponse {
                status_code,
                url,
                response,
            } => match response {
                Some(text) => {
                    write!(f, "Invalid Response ({}) {}: {}", status_code, text, url)
                }
                None => write!(f, "Invalid Response ({}) {}", status_code, url),
            },
            RoutingError::EmptyGeometry => write!(f, "route has no geometry"),
        }
    }
}

impl From<reqwest::Error> for RoutingError {
    fn from(e: reqwest::Error) -> Self {
        RoutingError::RequestError(Arc::new(e))
    }
}

impl From<serde_json::Error> for RoutingError {
    fn from(e: serde_json::Error) -> Self {
        RoutingError::JsonError(Arc::new(e))
    }
}

/// Turns a non-success response into `InvalidResponse`, keeping the body
/// when it can be read.
pub(crate) async fn check_status(
    response: reqwest::Response,
    url: String,
) -> Result<reqwest::Response, RoutingError> {
    let status_code = response.status();
    if status_code.is_success() {
        return Ok(response);
    }
    let response = response.text().await.ok();
    Err(RoutingError::InvalidResponse {
        status_code,
        url,
        response,
    })
}
