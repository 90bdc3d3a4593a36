//! Topic names and topic filters.
//!
//! Topics are `/`-separated paths. Filters may additionally contain the
//! single-level wildcard `+` (one whole segment) and the multi-level
//! wildcard `#` (only as the final segment).

use thiserror::Error;

/// Segment separator.
pub const TOPIC_SEPARATOR: char = '/';

/// Matches exactly one segment.
pub const SINGLE_LEVEL_WILDCARD: &str = "+";

/// Matches all remaining segments.
pub const MULTI_LEVEL_WILDCARD: &str = "#";

/// Maximum topic length in bytes (the length prefix is a u16).
pub const MAX_TOPIC_LENGTH: usize = 65_535;

/// Topic validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TopicError {
    #[error("Topic cannot be empty")]
    Empty,

    #[error("Topic too long: {0} bytes")]
    TooLong(usize),

    #[error("Topic contains a NUL character")]
    NulCharacter,

    #[error("Wildcards are not allowed in topic names")]
    WildcardInName,

    #[error("Wildcard must occupy a whole segment")]
    PartialWildcard,

    #[error("Multi-level wildcard must be the last segment")]
    MultiLevelNotLast,
}

/// Split a topic or filter into its segments.
#[must_use]
pub fn split(topic: &str) -> Vec<&str> {
    topic.split(TOPIC_SEPARATOR).collect()
}

fn validate_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LENGTH {
        return Err(TopicError::TooLong(topic.len()));
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a topic name used for publishing.
///
/// # Errors
///
/// Returns an error if the name is empty, too long, or contains wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), TopicError> {
    validate_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInName);
    }
    Ok(())
}

/// Validate a topic filter used for subscribing.
///
/// # Errors
///
/// Returns an error if a wildcard shares a segment with other characters
/// or `#` is not the final segment.
pub fn validate_topic_filter(filter: &str) -> Result<(), TopicError> {
    validate_common(filter)?;
    let segments = split(filter);
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.len() > 1 && segment.contains(['+', '#']) {
            return Err(TopicError::PartialWildcard);
        }
        if *segment == MULTI_LEVEL_WILDCARD && i != last {
            return Err(TopicError::MultiLevelNotLast);
        }
    }
    Ok(())
}
