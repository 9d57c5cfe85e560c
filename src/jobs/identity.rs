//! Job identifier generation.
//!
//! Ids are `<name>.<driver>.<YYYY-MM-DD-HH-MM-SS>` and double as Kubernetes
//! resource names, so they must be DNS-1123 subdomains. Uniqueness relies on
//! the second-resolution timestamp; the orchestrator rejects a clash.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;
use time::{OffsetDateTime, format_description::FormatItem, macros::format_description};

use super::JobId;

/// Upper bound on id length. The orchestrator copies the job name into a pod
/// label value, which caps it at 63 characters.
pub const MAX_ID_LEN: usize = 63;

const TIMESTAMP_FORMAT: &[FormatItem<'static>] =
    format_description!("[year]-[month]-[day]-[hour]-[minute]-[second]");

static DNS_SUBDOMAIN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$")
        .expect("DNS-1123 pattern is valid")
});

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("Job name must not be empty")]
    EmptyName,
    #[error("Job id '{id}' is {len} characters, limit is {MAX_ID_LEN}")]
    TooLong { id: String, len: usize },
    #[error(
        "Job id '{0}' is not a valid resource name (lowercase letters, digits, '-' and '.' only)"
    )]
    InvalidName(String),
    #[error("Failed to format job timestamp: {0}")]
    Timestamp(#[from] time::error::Format),
}

/// Derive the job id for `name` submitted with `driver` at `timestamp`.
pub fn generate_id(
    name: &str,
    driver: &str,
    timestamp: OffsetDateTime,
) -> Result<JobId, IdentityError> {
    if name.trim().is_empty() {
        return Err(IdentityError::EmptyName);
    }
    let stamp = timestamp.format(TIMESTAMP_FORMAT)?;
    let id = format!("{name}.{}.{stamp}", driver.to_lowercase());
    if id.len() > MAX_ID_LEN {
        let len = id.len();
        return Err(IdentityError::TooLong { id, len });
    }
    if !DNS_SUBDOMAIN.is_match(&id) {
        return Err(IdentityError::InvalidName(id));
    }
    Ok(JobId::from_string(id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn formats_name_driver_and_second_precision_timestamp() {
        let at = datetime!(2020-05-17 09:08:07.654 UTC);
        let id = generate_id("libpng", "libFuzzer", at).unwrap();
        assert_eq!(id.as_str(), "libpng.libfuzzer.2020-05-17-09-08-07");
    }

    #[test]
    fn same_second_produces_same_id() {
        let first = generate_id("x", "afl", datetime!(2021-01-01 00:00:00.1 UTC)).unwrap();
        let second = generate_id("x", "afl", datetime!(2021-01-01 00:00:00.9 UTC)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_names_that_are_not_resource_safe() {
        let at = datetime!(2020-05-17 09:08:07 UTC);
        assert!(matches!(
            generate_id("My Target", "afl", at),
            Err(IdentityError::InvalidName(_))
        ));
        assert!(matches!(
            generate_id("-leading", "afl", at),
            Err(IdentityError::InvalidName(_))
        ));
        assert!(matches!(
            generate_id("under_score", "afl", at),
            Err(IdentityError::InvalidName(_))
        ));
        assert!(matches!(
            generate_id("   ", "afl", at),
            Err(IdentityError::EmptyName)
        ));
    }

    #[test]
    fn rejects_ids_over_length_limit() {
        let at = datetime!(2020-05-17 09:08:07 UTC);
        let name = "a".repeat(40);
        let err = generate_id(&name, "libfuzzer", at).unwrap_err();
        assert!(matches!(err, IdentityError::TooLong { len, .. } if len > MAX_ID_LEN));
    }
}
