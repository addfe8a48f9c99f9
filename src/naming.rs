//! Stored artifact naming with injectable time and randomness

use chrono::{DateTime, Utc};
use std::path::Path;
use uuid::Uuid;

use crate::protocol::ARTIFACT_SUFFIX;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Source of collision-avoidance tokens and encoder identifiers
pub trait TokenSource: Send + Sync {
    fn token(&self) -> String;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// 128 random bits per token, rendered as 32 hex chars
pub struct UuidTokens;

impl TokenSource for UuidTokens {
    fn token(&self) -> String {
        Uuid::new_v4().simple().to_string()
    }
}

/// `<base>_<YYYYmmddHHMM>_<token>.ec`
///
/// Only the final component of the client's name is kept, so a declared
/// `../../etc/passwd` lands as `passwd_...`. Uniqueness comes from the token;
/// the timestamp is informational.
pub fn artifact_name(declared: &str, clock: &dyn Clock, tokens: &dyn TokenSource) -> String {
    let base = Path::new(declared)
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "upload".to_string());
    format!(
        "{}_{}_{}{}",
        base,
        clock.now().format("%Y%m%d%H%M"),
        tokens.token(),
        ARTIFACT_SUFFIX
    )
}

/// Inverse of [`artifact_name`] for naming a downloaded copy: recovers
/// `<base>` when the name has the generated shape, otherwise strips only the suffix.
pub fn declared_base(artifact: &str) -> &str {
    let stem = artifact.strip_suffix(ARTIFACT_SUFFIX).unwrap_or(artifact);
    let mut parts = stem.rsplitn(3, '_');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(token), Some(stamp), Some(base))
            if !base.is_empty()
                && !token.is_empty()
                && token.chars().all(|c| c.is_ascii_alphanumeric())
                && stamp.len() == 12
                && stamp.chars().all(|c| c.is_ascii_digit()) =>
        {
            base
        }
        _ => stem,
    }
}
