//! Topic name and topic filter validation
//!
//! Publish topics must be concrete (no wildcards); subscription filters may
//! use `+` for a single level and `#` for the remaining levels. Both are
//! checked before a request reaches the protocol engine so that malformed
//! input is reported as a configuration error without touching the socket.

use crate::error::AdapterError;
use thiserror::Error;

/// Maximum encoded length of an MQTT UTF-8 string
pub const MAX_TOPIC_LEN: usize = 65_535;

/// Topic validation failures
#[derive(Debug, Error, PartialEq)]
pub enum TopicError {
    #[error("topic cannot be empty")]
    Empty,
    #[error("topic exceeds {MAX_TOPIC_LEN} bytes")]
    TooLong,
    #[error("topic contains a NUL character")]
    NulCharacter,
    #[error("wildcards are not allowed in a publish topic")]
    WildcardInPublish,
    #[error("'#' must be the last level of a filter")]
    MisplacedMultiLevel,
    #[error("'+' must occupy a whole level of a filter")]
    MisplacedSingleLevel,
}

impl TopicError {
    pub(crate) fn into_adapter_error(self, topic: &str) -> AdapterError {
        AdapterError::invalid_topic(topic, self.to_string())
    }
}

fn check_common(topic: &str) -> Result<(), TopicError> {
    if topic.is_empty() {
        return Err(TopicError::Empty);
    }
    if topic.len() > MAX_TOPIC_LEN {
        return Err(TopicError::TooLong);
    }
    if topic.contains('\0') {
        return Err(TopicError::NulCharacter);
    }
    Ok(())
}

/// Validate a concrete topic used for publish and will messages
pub fn validate_publish_topic(topic: &str) -> Result<(), TopicError> {
    check_common(topic)?;
    if topic.contains(['+', '#']) {
        return Err(TopicError::WildcardInPublish);
    }
    Ok(())
}

/// Validate a subscription filter
pub fn validate_subscription_filter(filter: &str) -> Result<(), TopicError> {
    check_common(filter)?;

    let levels: Vec<&str> = filter.split('/').collect();
    let last = levels.len() - 1;
    for (index, level) in levels.iter().enumerate() {
        if level.contains('#') && (*level != "#" || index != last) {
            return Err(TopicError::MisplacedMultiLevel);
        }
        if level.contains('+') && *level != "+" {
            return Err(TopicError::MisplacedSingleLevel);
        }
    }
    Ok(())
}
