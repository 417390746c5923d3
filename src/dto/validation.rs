//! Validation helpers for DTOs.

use validator::ValidationError;

use crate::services::allocator::CODE_RANGE;

/// Longest display name accepted, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 32;

/// Validates that an invitation code is exactly 6 ASCII digits inside the allocator range.
///
/// # Examples
///
/// ```ignore
/// validate_invitation_code("482913") // Ok
/// validate_invitation_code("048291") // Err - below range
/// validate_invitation_code("48291")  // Err - too short
/// ```
pub fn validate_invitation_code(code: &str) -> Result<(), ValidationError> {
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        let mut err = ValidationError::new("invitation_code_format");
        err.message = Some("Invitation code must be exactly 6 digits".into());
        return Err(err);
    }

    match code.parse::<u32>() {
        Ok(value) if CODE_RANGE.contains(&value) => Ok(()),
        _ => {
            let mut err = ValidationError::new("invitation_code_range");
            err.message = Some(
                format!(
                    "Invitation code must be between {} and {}",
                    CODE_RANGE.start(),
                    CODE_RANGE.end()
                )
                .into(),
            );
            Err(err)
        }
    }
}

/// Validates that a display name is non-blank and at most [`MAX_DISPLAY_NAME_CHARS`] long.
pub fn validate_display_name(name: &str) -> Result<(), ValidationError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        let mut err = ValidationError::new("display_name_blank");
        err.message = Some("Display name must not be blank".into());
        return Err(err);
    }

    let length = trimmed.chars().count();
    if length > MAX_DISPLAY_NAME_CHARS {
        let mut err = ValidationError::new("display_name_length");
        err.message = Some(
            format!("Display name must be at most {MAX_DISPLAY_NAME_CHARS} characters (got {length})")
                .into(),
        );
        return Err(err);
    }

    if trimmed.chars().any(char::is_control) {
        let mut err = ValidationError::new("display_name_format");
        err.message = Some("Display name must not contain control characters".into());
        return Err(err);
    }

    Ok(())
}
