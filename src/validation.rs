use crate::error::ThrottlerError;
use crate::types::RateLimitRequest;

/// Request validation utilities
pub struct RequestValidator;

impl RequestValidator {
    /// Rejects the whole call when a batch exceeds `max`.
    pub fn validate_batch_size(field: &str, len: usize, max: usize) -> Result<(), ThrottlerError> {
        if len > max {
            return Err(ThrottlerError::OutOfRange(format!(
                "'{}' list too large; max size is '{}'",
                field, max
            )));
        }
        Ok(())
    }

    /// Checks the fields every item needs before it can be routed.
    ///
    /// The error is returned as text because it travels in the item's
    /// response rather than failing the call.
    pub fn validate_item(req: &RateLimitRequest) -> Result<(), String> {
        if req.unique_key.is_empty() {
            return Err("field 'unique_key' cannot be empty".to_string());
        }

        if req.namespace.is_empty() {
            return Err("field 'namespace' cannot be empty".to_string());
        }

        Ok(())
    }
}
