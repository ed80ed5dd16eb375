//! Topic naming rules.
//!
//! The relay subscribes to a concrete topic name and answers on
//! `<topic>/response`. Subscribers of the response topic depend on that exact
//! suffix, so it is fixed.

use crate::error::{Error, Result};

/// Suffix appended to the inbound topic to form the outbound topic.
pub const RESPONSE_SUFFIX: &str = "/response";

/// Maximum topic length in bytes (MQTT string length prefix is a u16).
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Derive the outbound topic for an inbound topic.
pub fn response_topic(topic: &str) -> String {
    format!("{topic}{RESPONSE_SUFFIX}")
}

/// Validate a topic name supplied at startup.
///
/// The topic must be publishable once the response suffix is appended, so
/// wildcards are rejected along with empty names, NUL characters and names
/// that would overflow the MQTT length prefix.
pub fn validate_topic(topic: &str) -> Result<()> {
    if topic.is_empty() {
        return Err(Error::Configuration("topic name is empty".into()));
    }
    if topic.len() + RESPONSE_SUFFIX.len() > MAX_TOPIC_LEN {
        return Err(Error::Configuration(format!(
            "topic name is too long ({} bytes)",
            topic.len()
        )));
    }
    if topic.contains('\0') {
        return Err(Error::Configuration(
            "topic name contains a NUL character".into(),
        ));
    }
    if topic.contains(['+', '#']) {
        return Err(Error::Configuration(format!(
            "topic name {topic:?} contains a wildcard; a concrete topic is required"
        )));
    }
    Ok(())
}

/// Check whether a concrete topic name matches a subscription filter.
///
/// Follows MQTT 3.1.1 rules: `+` matches exactly one level, `#` matches the
/// remaining levels (including none) and must be last. Topics starting with
/// `$` are not matched by a leading wildcard.
pub fn matches_filter(topic: &str, filter: &str) -> bool {
    if topic.starts_with('$') && filter.starts_with(['+', '#']) {
        return false;
    }

    let mut topic_levels = topic.split('/');
    let mut filter_levels = filter.split('/').peekable();

    while let Some(f) = filter_levels.next() {
        if f == "#" {
            return filter_levels.peek().is_none();
        }
        match topic_levels.next() {
            Some(t) if f == "+" || f == t => {}
            _ => return false,
        }
    }

    topic_levels.next().is_none()
}
