use rocket::http::{ContentType, Status};
use serde_json::json;
use std::io::Cursor;
use thiserror::Error;

use crate::api::target::TargetError;
use crate::transport::FetchError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Malformed request: {0}")]
    Malformed(#[from] TargetError),

    #[error("Host not allowed: {0}")]
    Forbidden(String),

    #[error("Request body too large")]
    BodyTooLarge,

    #[error("Unreadable request body: {0}")]
    Body(String),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}

impl ApiError {
    pub fn status(&self) -> Status {
        match self {
            ApiError::Malformed(_) | ApiError::Body(_) => Status::BadRequest,
            ApiError::Forbidden(_) => Status::Forbidden,
            ApiError::Fetch(error) if error.is_blocked() => Status::Forbidden,
            ApiError::BodyTooLarge => Status::PayloadTooLarge,
            ApiError::Fetch(error) if error.is_timeout() => Status::GatewayTimeout,
            ApiError::Fetch(_) => Status::BadGateway,
        }
    }
}

// Fetch failures only ever show a generic message; the detail goes to the log
impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let (error, message) = match &self {
            ApiError::Malformed(reason) => ("Malformed request", reason.to_string()),
            ApiError::Forbidden(host) => ("Forbidden", format!("Host '{}' is not allowed", host)),
            ApiError::BodyTooLarge => (
                "Payload too large",
                "The request body exceeds the forwarding limit".to_string(),
            ),
            ApiError::Body(_) => ("Bad request", "The request body could not be read".to_string()),
            ApiError::Fetch(error) if error.is_blocked() => (
                "Forbidden",
                "The target host resolves to a restricted address".to_string(),
            ),
            ApiError::Fetch(error) if error.is_timeout() => (
                "Gateway timeout",
                "The remote server did not respond in time".to_string(),
            ),
            ApiError::Fetch(_) => (
                "Bad gateway",
                "The remote resource could not be fetched".to_string(),
            ),
        };

        let body = json!({
            "error": error,
            "message": message
        })
        .to_string();

        rocket::Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(body.len(), Cursor::new(body))
            .ok()
    }
}
