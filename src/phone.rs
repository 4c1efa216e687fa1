//! Phone number validation and canonicalization.
//!
//! Accepts ten-digit North American numbers with an optional parenthesised
//! area code and optional `-`, `.` or space separators, e.g. `555-123-4567`,
//! `(555) 123-4567`, `5551234567`. Canonical form is `(555)-123-4567`.

use std::sync::LazyLock;

use regex::Regex;

use crate::error::Error;

static PHONE_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:\((\d{3})\)|(\d{3}))[-. ]?(\d{3})[-. ]?(\d{4})$")
        .expect("phone pattern is a valid regex")
});

/// Whether `number` matches the accepted phone format.
pub fn is_valid(number: &str) -> bool {
    PHONE_PATTERN.is_match(number)
}

/// Validate `number` and return its canonical `(AAA)-EEE-NNNN` form.
pub fn canonicalize(number: &str) -> Result<String, Error> {
    let caps = PHONE_PATTERN
        .captures(number)
        .ok_or_else(|| Error::InvalidArgument(format!("invalid phone number {number:?}")))?;

    // Exactly one of the two area-code groups participates in a match.
    let area = caps
        .get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str())
        .unwrap_or_default();

    Ok(format!("({area})-{}-{}", &caps[3], &caps[4]))
}
