use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use dog_core::errors::{DogError, ErrorKind};
use dog_tus::TusError;

#[derive(Debug)]
pub struct DogAxumError(pub anyhow::Error);

impl From<anyhow::Error> for DogAxumError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl From<TusError> for DogAxumError {
    fn from(e: TusError) -> Self {
        let dog = DogError::new(ErrorKind::from_status(e.status()), e.to_string()).with_data(e.details());
        Self(dog.with_source(anyhow::Error::new(e)).into_anyhow())
    }
}

impl IntoResponse for DogAxumError {
    fn into_response(self) -> Response {
        // If it’s a DogError (even if wrapped by anyhow contexts), preserve Feathers-ish fields
        let dog = match self.0.chain().find_map(|e| e.downcast_ref::<DogError>()) {
            Some(dog) => dog.sanitize_for_client(),
            // Fallback: wrap any non-DogError as a DogError::GeneralError
            None => DogError::general_error(self.0.to_string()),
        };

        let status = StatusCode::from_u16(dog.code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            tracing::error!(status = status.as_u16(), error = %self.0, "Upload request failed");
        } else {
            tracing::debug!(status = status.as_u16(), error = %self.0, "Upload request rejected");
        }
        (status, Json(dog.to_json())).into_response()
    }
}
