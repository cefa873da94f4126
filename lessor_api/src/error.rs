use http::StatusCode;
use thiserror::Error;

/// An error communicating with the upstream service
#[derive(Debug, Error)]
pub enum Error {
    /// The HTTP client could not be constructed
    #[error("error constructing upstream client")]
    Build(#[source] reqwest::Error),
    /// The request could not be sent
    #[error("error sending request to upstream")]
    Request(#[source] reqwest_middleware::Error),
    /// The response body could not be read
    #[error("error reading upstream response body")]
    BodyRead(#[source] reqwest::Error),
    /// The upstream responded with a non-success status
    #[error("upstream responded with {status}: {}", .errors.join("; "))]
    Response {
        /// The response status
        status: StatusCode,
        /// The error messages in the response body, if any
        errors: Vec<String>,
    },
    /// The response body was not the expected JSON
    #[error("error decoding upstream response")]
    Json(#[from] serde_json::Error),
    /// The upstream responded successfully but without a body
    #[error("upstream returned an empty response")]
    EmptyResponse,
    /// A request URL could not be constructed
    #[error("invalid upstream url")]
    Url(#[from] url::ParseError),
    /// A header value could not be constructed
    #[error("invalid header value")]
    Header(#[from] http::header::InvalidHeaderValue),
}

impl Error {
    /// The upstream status code, if the upstream responded at all
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::Response { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether retrying the same request may succeed
    ///
    /// Transport failures, 5xx responses and 429 are transient. Any other
    /// upstream response is treated as a permanent verdict on the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Request(_) | Self::BodyRead(_) => true,
            Self::Response { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            _ => false,
        }
    }

    /// Whether the upstream rejected the request's token
    pub fn is_permission_denied(&self) -> bool {
        self.status() == Some(StatusCode::FORBIDDEN)
    }

    pub(crate) fn from_response(status: StatusCode, body: &[u8]) -> Self {
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            #[serde(default)]
            errors: Vec<String>,
        }

        let errors = serde_json::from_slice::<ErrorBody>(body)
            .map(|b| b.errors)
            .unwrap_or_default();

        Self::Response { status, errors }
    }
}
