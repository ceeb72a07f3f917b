use crate::error::ThrottlerError;

const MAX_IDENTIFIER_LEN: usize = 256;
const KNOWN_KINDS: [&str; 3] = ["ip", "email", "api_key"];

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Validates an identifier such as `ip:1.2.3.4` or `email:a@b.com`
    /// received on an admin route.
    pub fn validate_identifier(identifier: &str) -> Result<String, ThrottlerError> {
        let identifier = identifier.trim();

        if identifier.is_empty() {
            return Err(ThrottlerError::Validation(
                "Identifier cannot be empty".to_string(),
            ));
        }

        if identifier.len() > MAX_IDENTIFIER_LEN {
            return Err(ThrottlerError::Validation(format!(
                "Identifier cannot exceed {} characters",
                MAX_IDENTIFIER_LEN
            )));
        }

        let Some((kind, value)) = identifier.split_once(':') else {
            return Err(ThrottlerError::Validation(
                "Identifier must be in kind:value format".to_string(),
            ));
        };

        if !KNOWN_KINDS.contains(&kind) {
            return Err(ThrottlerError::Validation(format!(
                "Unknown identifier kind '{}'. Must be one of: {:?}",
                kind, KNOWN_KINDS
            )));
        }

        if value.is_empty()
            || !value
                .chars()
                .all(|c| c.is_alphanumeric() || "-_.@+:".contains(c))
        {
            return Err(ThrottlerError::Validation(
                "Identifier value contains invalid characters".to_string(),
            ));
        }

        if kind == "email" {
            return Ok(format!("email:{}", value.to_lowercase()));
        }

        Ok(identifier.to_string())
    }

    /// Validates an optional endpoint scope
    pub fn validate_endpoint(endpoint: Option<&str>) -> Result<Option<String>, ThrottlerError> {
        match endpoint.map(str::trim) {
            None | Some("") => Ok(None),
            Some(endpoint) if endpoint.starts_with('/') => Ok(Some(endpoint.to_string())),
            Some(_) => Err(ThrottlerError::Validation(
                "Endpoint must be a path starting with '/'".to_string(),
            )),
        }
    }
}
