//! ID generation utilities
//!
//! Provides functions for generating identifiers for capture jobs and
//! correlation ids for the dispatch fabric.

use rand::Rng;
use sha2::{Digest, Sha256};

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Generate a unique capture job ID
///
/// Format: `job-{timestamp_ms}-{random_hex}`
/// Example: `job-1738300800123-a1b2c3d4`
pub fn generate_job_id() -> String {
    let timestamp = now_ms();
    let random: u32 = rand::rng().random();
    format!("job-{}-{:08x}", timestamp, random)
}

/// Generate a backfill state ID
///
/// Format: `bf-{timestamp_ms}-{random_hex}`
pub fn generate_backfill_id() -> String {
    let timestamp = now_ms();
    let random: u16 = rand::rng().random();
    format!("bf-{}-{:04x}", timestamp, random)
}

/// Id of the job resubmitted for a failed job's `attempt`-th retry.
///
/// Deterministic, so a scan can find a replacement that was persisted even
/// though its submission reported an error.
pub fn retry_job_id(original_id: &str, attempt: u32) -> String {
    format!("{}-r{}", original_id, attempt)
}

/// Derive a stable correlation id for a dispatch.
///
/// The same job and attempt always hash to the same id, so a resubmission
/// after a lost acknowledgement is recognised by the fabric.
pub fn correlation_id(job_id: &str, attempt: u32) -> String {
    let mut hasher = Sha256::new();
    hasher.update(job_id.as_bytes());
    hasher.update(b":");
    hasher.update(attempt.to_le_bytes());
    let digest = hasher.finalize();
    format!("corr-{}", &hex::encode(digest)[..24])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_ms_returns_reasonable_timestamp() {
        let ts = now_ms();
        assert!(ts > 1577836800000); // 2020-01-01
        assert!(ts < 4102444800000); // 2100-01-01
    }

    #[test]
    fn test_generate_job_id_format() {
        let id = generate_job_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "job");
        assert!(parts[1].chars().all(|c| c.is_ascii_digit()));
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_job_id_uniqueness() {
        assert_ne!(generate_job_id(), generate_job_id());
    }

    #[test]
    fn test_generate_backfill_id_format() {
        let id = generate_backfill_id();
        assert!(id.starts_with("bf-"));
    }

    #[test]
    fn test_retry_job_id_is_derived_from_original() {
        assert_eq!(retry_job_id("job-1-aa", 1), "job-1-aa-r1");
        assert_eq!(retry_job_id("job-1-aa", 1), retry_job_id("job-1-aa", 1));
        assert_ne!(retry_job_id("job-1-aa", 1), retry_job_id("job-1-aa", 2));
    }

    #[test]
    fn test_correlation_id_is_stable() {
        assert_eq!(correlation_id("job-1", 0), correlation_id("job-1", 0));
        assert_ne!(correlation_id("job-1", 0), correlation_id("job-1", 1));
        assert_ne!(correlation_id("job-1", 0), correlation_id("job-2", 0));
        assert!(correlation_id("job-1", 0).starts_with("corr-"));
    }
}
