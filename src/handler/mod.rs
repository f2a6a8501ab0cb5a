use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use rbi_core::RbiError;

pub mod session;
pub mod stream;
pub mod system;

pub type ApiResult<T> = Result<T, ApiError>;
pub type ApiJsonResult<T> = ApiResult<Json<T>>;

pub struct ApiError(anyhow::Error);

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<RbiError>() {
            Some(RbiError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Some(RbiError::ResourceExhausted(_)) => StatusCode::SERVICE_UNAVAILABLE,
            Some(RbiError::InvalidArgument(_)) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            log::error!("ApiError: {:?}", self.0);
        } else {
            log::debug!("ApiError: {:#}", self.0);
        }
        (
            status,
            Json(serde_json::json!({ "error": format!("{:#}", self.0) })),
        )
            .into_response()
    }
}

impl<E> From<E> for ApiError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}
