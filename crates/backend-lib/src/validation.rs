// ============================
// crates/backend-lib/src/validation.rs
// ============================
//! Input validation for session and chat payloads.

use regex::Regex;
use std::sync::LazyLock;
use thiserror::Error;

// Common validation constants
const MAX_TITLE_LENGTH: usize = 200;
const MAX_DISPLAY_NAME_LENGTH: usize = 100;
const MAX_CHAT_BODY_LENGTH: usize = 2000;
const MAX_URL_LENGTH: usize = 2048;

static DISPLAY_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^<>/\\{}()\[\];]*$").unwrap());

/// Possible validation errors
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Invalid title: {0}")]
    InvalidTitle(String),

    #[error("Invalid display name: {0}")]
    InvalidDisplayName(String),

    #[error("Invalid chat body: {0}")]
    InvalidChatBody(String),

    #[error("Invalid meeting URL: {0}")]
    InvalidMeetingUrl(String),
}

/// Result type for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validate a session title
pub fn validate_title(title: &str) -> ValidationResult<&str> {
    let trimmed = title.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidTitle(
            "Title must not be empty".to_string(),
        ));
    }

    if trimmed.len() > MAX_TITLE_LENGTH {
        return Err(ValidationError::InvalidTitle(format!(
            "Title must be at most {MAX_TITLE_LENGTH} characters"
        )));
    }

    Ok(trimmed)
}

/// Validate a participant display name
pub fn validate_display_name(name: &str) -> ValidationResult<&str> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidDisplayName(
            "Display name must not be empty".to_string(),
        ));
    }

    if trimmed.len() > MAX_DISPLAY_NAME_LENGTH {
        return Err(ValidationError::InvalidDisplayName(format!(
            "Display name must be at most {MAX_DISPLAY_NAME_LENGTH} characters"
        )));
    }

    if !DISPLAY_NAME_REGEX.is_match(trimmed) {
        return Err(ValidationError::InvalidDisplayName(
            "Display name contains forbidden characters".to_string(),
        ));
    }

    Ok(trimmed)
}

/// Validate a chat message body
pub fn validate_chat_body(body: &str) -> ValidationResult<&str> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::InvalidChatBody(
            "Message body must not be empty".to_string(),
        ));
    }

    if trimmed.len() > MAX_CHAT_BODY_LENGTH {
        return Err(ValidationError::InvalidChatBody(format!(
            "Message body must be at most {MAX_CHAT_BODY_LENGTH} characters"
        )));
    }

    Ok(trimmed)
}

/// Validate an external platform meeting URL
pub fn validate_meeting_url(url: &str) -> ValidationResult<&str> {
    if url.len() > MAX_URL_LENGTH {
        return Err(ValidationError::InvalidMeetingUrl(
            "URL is too long".to_string(),
        ));
    }

    if !url.starts_with("https://") && !url.starts_with("http://") {
        return Err(ValidationError::InvalidMeetingUrl(
            "URL must be http(s)".to_string(),
        ));
    }

    Ok(url)
}

/// Strip control characters from free-form text before persisting it.
pub fn sanitize_string(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect()
}
