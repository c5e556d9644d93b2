use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use imagine_core::{api::ErrorBody, ServeError};

/// HTTP rendering of failures as `{"detail": ...}`.
#[derive(Debug)]
pub enum ApiError {
    Serve(ServeError),
    /// The request could not be decoded at all.
    Malformed(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::Serve(ServeError::InvalidArgument(_)) | Self::Malformed(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Serve(ServeError::NotFound(_)) => StatusCode::NOT_FOUND,
            Self::Serve(ServeError::ServiceUnavailable(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Serve(ServeError::Internal(_)) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(self) -> String {
        match self {
            Self::Serve(err) => err.to_string(),
            Self::Malformed(detail) => detail,
        }
    }
}

impl<E: Into<ServeError>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self::Serve(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = ErrorBody {
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}
