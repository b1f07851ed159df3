/*!
 * Topic filters and the topic layout.
 *
 * Filters use MQTT wildcards: `+` stands for exactly one non-empty level,
 * `#` for everything after the preceding `/`. `#` may only be the last
 * level.
 */
use std::fmt;

use crate::error::{MqttError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Level {
    Literal(String),
    Single,
    Multi,
}

/// A parsed topic filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicFilter {
    pattern: String,
    levels: Vec<Level>,
}

impl TopicFilter {
    /// Parse a filter such as `panelsync/device/+/status` or `panelsync/#`
    pub fn parse(pattern: &str) -> Result<Self> {
        if pattern.is_empty() {
            return Err(MqttError::InvalidTopic("empty topic filter".to_string()));
        }

        let parts: Vec<&str> = pattern.split('/').collect();
        let mut levels = Vec::with_capacity(parts.len());
        for (index, part) in parts.iter().enumerate() {
            let level = match *part {
                "+" => Level::Single,
                "#" if index + 1 == parts.len() => Level::Multi,
                "#" => {
                    return Err(MqttError::InvalidTopic(format!(
                        "'#' must be the last level in {}",
                        pattern
                    )))
                }
                literal if literal.contains(['+', '#']) => {
                    return Err(MqttError::InvalidTopic(format!(
                        "wildcards must occupy a whole level in {}",
                        pattern
                    )))
                }
                literal => Level::Literal(literal.to_string()),
            };
            levels.push(level);
        }

        Ok(Self {
            pattern: pattern.to_string(),
            levels,
        })
    }

    /// Whether a concrete topic matches this filter
    pub fn matches(&self, topic: &str) -> bool {
        let mut topic_levels = topic.split('/');
        for level in &self.levels {
            let Some(actual) = topic_levels.next() else {
                return false;
            };
            match level {
                Level::Multi => return true,
                Level::Single if actual.is_empty() => return false,
                Level::Single => {}
                Level::Literal(expected) if expected != actual => return false,
                Level::Literal(_) => {}
            }
        }
        topic_levels.next().is_none()
    }

    /// Whether the filter contains wildcards
    pub fn is_wildcard(&self) -> bool {
        self.levels
            .iter()
            .any(|l| matches!(l, Level::Single | Level::Multi))
    }

    /// The filter as written
    pub fn as_str(&self) -> &str {
        &self.pattern
    }
}

impl fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.pattern)
    }
}

/// Topic layout below the configured base topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    base: String,
}

impl Topics {
    /// Layout below `base`
    pub fn new(base: impl Into<String>) -> Self {
        let base = base.into();
        Self {
            base: base.trim_end_matches('/').to_string(),
        }
    }

    /// Base topic
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Where `online` is published while connected; the last will clears it
    pub fn availability(&self) -> String {
        format!("{}/availability", self.base)
    }

    /// Status of one device
    pub fn device_status(&self, serial: &str) -> String {
        format!("{}/device/{}/status", self.base, serial)
    }

    /// Filter over every device status topic
    pub fn device_status_filter(&self) -> String {
        format!("{}/device/+/status", self.base)
    }
}
