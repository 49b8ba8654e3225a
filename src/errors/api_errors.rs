use actix_web::http::StatusCode;

use super::LockError;

// Translation of the error taxonomy to HTTP statuses. Lives at the edge;
// the domain type itself carries no web awareness.
impl LockError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            LockError::BadRequest(_) => StatusCode::BAD_REQUEST,
            LockError::Conflict(_) => StatusCode::CONFLICT,
            LockError::NotFound => StatusCode::NOT_FOUND,
            LockError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}
