//! Errors raised at the HTTP submission boundary.

use axum::extract::rejection::FormRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::models::{MAX_CONTENT_CHARS, MAX_USERNAME_CHARS};

/// Input errors. These never reach the hub.
#[derive(Debug, Error)]
pub enum ChatError {
    #[error("Message cannot be empty")]
    EmptyContent,

    #[error("Message too long ({0} characters, max {max})", max = MAX_CONTENT_CHARS)]
    ContentTooLong(usize),

    #[error("Username is required")]
    UsernameRequired,

    #[error("Username cannot contain control characters")]
    UsernameInvalid,

    #[error("Username too long ({0} characters, max {max})", max = MAX_USERNAME_CHARS)]
    UsernameTooLong(usize),

    #[error("Invalid form data: {0}")]
    InvalidForm(String),
}

impl From<FormRejection> for ChatError {
    fn from(rejection: FormRejection) -> Self {
        ChatError::InvalidForm(rejection.body_text())
    }
}

impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        (StatusCode::BAD_REQUEST, self.to_string()).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_variants_map_to_bad_request() {
        let errors = [
            ChatError::EmptyContent,
            ChatError::ContentTooLong(501),
            ChatError::UsernameRequired,
            ChatError::UsernameInvalid,
            ChatError::UsernameTooLong(21),
            ChatError::InvalidForm("missing field".to_string()),
        ];
        for err in errors {
            assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
        }
    }

    #[test]
    fn test_messages_name_the_limit() {
        assert_eq!(
            ChatError::ContentTooLong(501).to_string(),
            "Message too long (501 characters, max 500)"
        );
    }
}
