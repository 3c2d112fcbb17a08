use std::io;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, DispatchError>;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("{0} '{1}' not found")]
    NotFound(&'static str, String),
    #[error("filter plugin failure: {0}")]
    Plugin(String),
    #[error("dispatch to '{0}' failed: {1}")]
    Dispatch(String, String),
    #[error("access control denied caller '{0}'")]
    AclDenied(String),
    #[error("script error: {0}")]
    Script(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for DispatchError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::de::Error> for DispatchError {
    fn from(err: toml::de::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<toml::ser::Error> for DispatchError {
    fn from(err: toml::ser::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    message: &'a str,
}

impl IntoResponse for DispatchError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) | Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::AclDenied(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_, _) => StatusCode::NOT_FOUND,
            Self::Plugin(_)
            | Self::Dispatch(_, _)
            | Self::Script(_)
            | Self::Config(_)
            | Self::Storage(_)
            | Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = self.to_string();
        (status, Json(ErrorBody { message: &message })).into_response()
    }
}
