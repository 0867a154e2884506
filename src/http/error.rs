use crate::engine::AuthError;
use crate::render::RenderError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// API error with HTTP status code
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    pub code: String,
}

impl ApiError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
            code: "BAD_REQUEST".to_string(),
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
            code: "UNAUTHORIZED".to_string(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::FORBIDDEN,
            message: message.into(),
            code: "FORBIDDEN".to_string(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
            code: "NOT_FOUND".to_string(),
        }
    }

    pub fn internal_error(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
            code: "INTERNAL_SERVER_ERROR".to_string(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": {
                "message": self.message,
                "code": self.code,
            }
        }));

        (self.status, body).into_response()
    }
}

/// Convert anyhow::Error to ApiError
impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(e) = err.downcast_ref::<RenderError>() {
            return ApiError::from_render_error(e);
        }
        ApiError::internal_error(err.to_string())
    }
}

impl ApiError {
    fn from_render_error(e: &RenderError) -> Self {
        let constructor = match e {
            RenderError::DashboardNotFound(_) => ApiError::not_found,
            RenderError::AccessDenied { .. } => ApiError::forbidden,
            RenderError::Store(_) => ApiError::internal_error,
        };
        constructor(e.to_string())
    }
}

/// Convert RenderError to ApiError
impl From<RenderError> for ApiError {
    fn from(e: RenderError) -> Self {
        ApiError::from_render_error(&e)
    }
}

/// Convert AuthError to ApiError
impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        let constructor = match &e {
            AuthError::TokenRevoked(_) | AuthError::UnknownUser(_) => ApiError::unauthorized,
            AuthError::Store(_) => ApiError::internal_error,
        };
        constructor(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_error_status() {
        let cases = [
            (RenderError::DashboardNotFound("d".into()), StatusCode::NOT_FOUND),
            (
                RenderError::AccessDenied {
                    dashboard_id: "d".into(),
                    user_id: "u".into(),
                },
                StatusCode::FORBIDDEN,
            ),
            (RenderError::Store("down".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status, status);
        }
    }

    #[test]
    fn test_auth_error_status() {
        assert_eq!(
            ApiError::from(AuthError::TokenRevoked("t".into())).status,
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ApiError::from(AuthError::Store(anyhow::anyhow!("db"))).status,
            StatusCode::INTERNAL_SERVER_ERROR
        );
        let wrapped = anyhow::Error::new(RenderError::DashboardNotFound("d".into()));
        assert_eq!(ApiError::from(wrapped).status, StatusCode::NOT_FOUND);
    }
}
