use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use log::warn;
use serde_json::json;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("malformed multipart body: {0}")]
    MalformedMultipart(String),
    #[error("failed to read request body: {0}")]
    ReadError(String),
    #[error("{0}")]
    Validation(String),
    #[error("payload too large: {0}")]
    PayloadTooLarge(String),
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("failed to forward upload: {0}")]
    Forwarding(String),
    #[error("io error: {0}")]
    IOError(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl Error {
    pub(crate) fn malformed(msg: impl Into<String>) -> Self {
        Error::MalformedMultipart(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Error::MalformedMultipart(_) | Error::ReadError(_) | Error::Validation(_) => {
                StatusCode::BAD_REQUEST
            }
            Error::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            Error::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            Error::Forwarding(_) | Error::IOError(_) | Error::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IOError(err.to_string())
    }
}

impl From<multer::Error> for Error {
    fn from(err: multer::Error) -> Self {
        match err {
            multer::Error::StreamReadFailed(_) => Error::ReadError(err.to_string()),
            multer::Error::FieldSizeExceeded { .. } | multer::Error::StreamSizeExceeded { .. } => {
                Error::PayloadTooLarge(err.to_string())
            }
            _ => Error::MalformedMultipart(err.to_string()),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        warn!("upload rejected with {}: {}", status, self);
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
