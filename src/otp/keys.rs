//! Redis keys used by the OTP flow. Emails are expected to be normalized.

/// SHA-256 hex digest of the outstanding code for an email.
pub fn otp_code(email: &str) -> String {
    format!("otp:{}", email)
}

/// Marker set once an email has passed verification.
pub fn otp_verified(email: &str) -> String {
    format!("otp_verified:{}", email)
}

/// Failed verification attempts against the outstanding code.
pub fn otp_attempts(email: &str) -> String {
    format!("otp_attempts:{}", email)
}

/// Present while a new code may not be requested.
pub fn otp_cooldown(email: &str) -> String {
    format!("otp_cooldown:{}", email)
}
