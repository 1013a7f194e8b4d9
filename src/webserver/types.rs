// Error taxonomy for the HTTP surface. Kinds map to status codes; the
// body is the matching error page from the branch's `errors/` directory
// when the client accepts HTML, empty otherwise.

use axum::http::StatusCode;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("not found")]
    NotFound,
    #[error("authentication required")]
    AuthRequired { realm: String },
    #[error("invalid credentials")]
    AuthFailed { realm: String },
    #[error("{0}")]
    BadRequest(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::AuthRequired { .. } | Self::AuthFailed { .. } => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn challenge(&self) -> Option<String> {
        match self {
            Self::AuthRequired { realm } | Self::AuthFailed { realm } => {
                Some(format!("Basic realm=\"{realm}\""))
            }
            _ => None,
        }
    }
}

impl From<crate::acm::AuthError> for ApiError {
    fn from(err: crate::acm::AuthError) -> Self {
        match err {
            crate::acm::AuthError::Required { realm } => Self::AuthRequired { realm },
            crate::acm::AuthError::Failed { realm } => Self::AuthFailed { realm },
            crate::acm::AuthError::UnknownMethod(m) => {
                Self::Internal(anyhow::anyhow!("unknown auth method `{m}`"))
            }
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
