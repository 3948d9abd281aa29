use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde_json::json;

#[derive(Debug, PartialEq)]
pub enum Error {
    AppState {
        message: String,
    },
    BadRequest {
        message: String,
    },
    ClientBuild {
        message: String,
    },
    Config {
        message: String,
    },
    DownstreamClient {
        message: String,
        status_code: StatusCode,
    },
    DownstreamServer {
        message: String,
    },
    DuplicateRequest {
        key: String,
    },
    IdempotencyStore {
        message: String,
    },
    InstanceStore {
        message: String,
    },
    InvalidBaseUrl {
        message: String,
    },
    JsonRequest {
        message: String,
    },
    NoInstanceAvailable,
    Observability {
        message: String,
    },
    Serialization {
        message: String,
    },
    Settings {
        message: String,
    },
    Template {
        message: String,
    },
}

impl Error {
    /// Defines the error level for logging this error
    fn level(&self) -> tracing::Level {
        match self {
            Error::AppState { .. } => tracing::Level::ERROR,
            Error::BadRequest { .. } => tracing::Level::WARN,
            Error::ClientBuild { .. } => tracing::Level::ERROR,
            Error::Config { .. } => tracing::Level::ERROR,
            Error::DownstreamClient { .. } => tracing::Level::WARN,
            Error::DownstreamServer { .. } => tracing::Level::ERROR,
            Error::DuplicateRequest { .. } => tracing::Level::WARN,
            Error::IdempotencyStore { .. } => tracing::Level::WARN,
            Error::InstanceStore { .. } => tracing::Level::ERROR,
            Error::InvalidBaseUrl { .. } => tracing::Level::ERROR,
            Error::JsonRequest { .. } => tracing::Level::WARN,
            Error::NoInstanceAvailable => tracing::Level::WARN,
            Error::Observability { .. } => tracing::Level::ERROR,
            Error::Serialization { .. } => tracing::Level::ERROR,
            Error::Settings { .. } => tracing::Level::WARN,
            Error::Template { .. } => tracing::Level::ERROR,
        }
    }

    /// Defines the HTTP status code for responses involving this error
    fn status_code(&self) -> StatusCode {
        match self {
            Error::AppState { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BadRequest { .. } => StatusCode::BAD_REQUEST,
            Error::ClientBuild { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Config { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::DownstreamClient { status_code, .. } => *status_code,
            Error::DownstreamServer { .. } => StatusCode::BAD_GATEWAY,
            Error::DuplicateRequest { .. } => StatusCode::CONFLICT,
            Error::IdempotencyStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InstanceStore { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::InvalidBaseUrl { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::JsonRequest { .. } => StatusCode::BAD_REQUEST,
            Error::NoInstanceAvailable => StatusCode::SERVICE_UNAVAILABLE,
            Error::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Serialization { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Settings { .. } => StatusCode::BAD_REQUEST,
            Error::Template { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Categorical reason code attached to rejection metrics
    pub fn reason(&self) -> &'static str {
        match self {
            Error::BadRequest { .. } | Error::JsonRequest { .. } => "bad_request",
            Error::DuplicateRequest { .. } => "duplicate_request",
            Error::NoInstanceAvailable => "no_instance_or_rate_limit",
            Error::DownstreamClient { .. } | Error::DownstreamServer { .. } => "downstream_error",
            _ => "unexpected_error",
        }
    }

    /// Log the error using the `tracing` library
    pub fn log(&self) {
        match self.level() {
            tracing::Level::ERROR => tracing::error!("{self}"),
            tracing::Level::WARN => tracing::warn!("{self}"),
            tracing::Level::INFO => tracing::info!("{self}"),
            tracing::Level::DEBUG => tracing::debug!("{self}"),
            tracing::Level::TRACE => tracing::trace!("{self}"),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::AppState { message } => {
                write!(f, "Error initializing AppState: {}", message)
            }
            Error::BadRequest { message } => write!(f, "{}", message),
            Error::ClientBuild { message } => {
                write!(f, "Error building HTTP client: {}", message)
            }
            Error::Config { message } => {
                write!(f, "Error in gateway config: {}", message)
            }
            Error::DownstreamClient { message, .. } => {
                write!(f, "Error from downstream client: {}", message)
            }
            Error::DownstreamServer { message } => {
                write!(f, "Error from downstream servers: {}", message)
            }
            Error::DuplicateRequest { key } => {
                write!(f, "Request with idempotency key `{}` is already in flight", key)
            }
            Error::IdempotencyStore { message } => {
                write!(f, "Error from idempotency store: {}", message)
            }
            Error::InstanceStore { message } => {
                write!(f, "Error reading instance store: {}", message)
            }
            Error::InvalidBaseUrl { message } => write!(f, "{}", message),
            Error::JsonRequest { message } => write!(f, "{}", message),
            Error::NoInstanceAvailable => {
                write!(f, "No instance could be admitted for this request")
            }
            Error::Observability { message } => write!(f, "{}", message),
            Error::Serialization { message } => write!(f, "{}", message),
            Error::Settings { message } => {
                write!(f, "Error in gateway settings: {}", message)
            }
            Error::Template { message } => {
                write!(f, "Error rendering request template: {}", message)
            }
        }
    }
}

impl std::error::Error for Error {}

impl IntoResponse for Error {
    /// Log the error and convert it into an Axum response
    fn into_response(self) -> Response {
        self.log();
        let body = json!({"error": self.to_string()});
        (self.status_code(), Json(body)).into_response()
    }
}

pub trait ResultExt<T> {
    fn ok_or_log(self) -> Option<T>;
}

impl<T> ResultExt<T> for Result<T, Error> {
    fn ok_or_log(self) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(error) => {
                error.log();
                None
            }
        }
    }
}
