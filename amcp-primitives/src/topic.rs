//! Hierarchical topics and subscription patterns.
//!
//! Topics are dotted strings of lowercase alphanumeric segments. Patterns may
//! additionally use `*` for exactly one segment and a trailing `**` for one
//! or more segments. Matching is deterministic and O(segments).

use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

const MAX_TOPIC_LEN: usize = 255;

fn is_literal_segment(segment: &str) -> bool {
    !segment.is_empty() && segment.chars().all(|c| matches!(c, 'a'..='z' | '0'..='9'))
}

/// A concrete routing topic, e.g. `weather.alert.storm`.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

impl Topic {
    /// Parses and validates a concrete topic. Wildcards are rejected here;
    /// they belong to [`TopicPattern`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidTopic`] when the string violates the topic
    /// grammar.
    pub fn parse(topic: impl Into<String>) -> Result<Self> {
        let topic = topic.into();
        if topic.is_empty() {
            return Err(Error::InvalidTopic {
                topic,
                reason: "topic cannot be empty".into(),
            });
        }
        if topic.len() > MAX_TOPIC_LEN {
            return Err(Error::InvalidTopic {
                topic,
                reason: format!("topic length must be <= {MAX_TOPIC_LEN}"),
            });
        }
        if !topic.split('.').all(is_literal_segment) {
            return Err(Error::InvalidTopic {
                topic,
                reason: "segments must be non-empty lowercase alphanumeric".into(),
            });
        }
        Ok(Self(topic))
    }

    /// Returns the topic as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterates over the dotted segments.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('.')
    }

    /// Returns the first segment, used by the A2A bridge to derive the target
    /// service.
    #[must_use]
    pub fn first_segment(&self) -> &str {
        self.0.split('.').next().unwrap_or_default()
    }
}

impl Display for Topic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Topic {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// A subscription pattern over topics.
///
/// `travel.*` matches `travel.request` but not `travel.request.new`;
/// `travel.**` matches both. `**` is only legal as the final segment and
/// matches one or more segments.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicPattern(String);

impl TopicPattern {
    /// Parses and validates a subscription pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] when a segment is neither a literal
    /// nor a wildcard, or when `**` appears before the final position.
    pub fn parse(pattern: impl Into<String>) -> Result<Self> {
        let pattern = pattern.into();
        if pattern.is_empty() {
            return Err(Error::InvalidPattern {
                pattern,
                reason: "pattern cannot be empty".into(),
            });
        }
        if pattern.len() > MAX_TOPIC_LEN {
            return Err(Error::InvalidPattern {
                pattern,
                reason: format!("pattern length must be <= {MAX_TOPIC_LEN}"),
            });
        }
        let segments: Vec<&str> = pattern.split('.').collect();
        for (index, segment) in segments.iter().enumerate() {
            match *segment {
                "*" => {}
                "**" => {
                    if index != segments.len() - 1 {
                        return Err(Error::InvalidPattern {
                            pattern,
                            reason: "`**` is only allowed as the final segment".into(),
                        });
                    }
                }
                literal => {
                    if !is_literal_segment(literal) {
                        return Err(Error::InvalidPattern {
                            pattern: pattern.clone(),
                            reason: format!("invalid segment `{literal}`"),
                        });
                    }
                }
            }
        }
        Ok(Self(pattern))
    }

    /// Returns the pattern as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Tests whether the pattern matches the supplied topic.
    #[must_use]
    pub fn matches(&self, topic: &Topic) -> bool {
        let pattern: Vec<&str> = self.0.split('.').collect();
        let segments: Vec<&str> = topic.segments().collect();

        for (index, expected) in pattern.iter().enumerate() {
            if *expected == "**" {
                // Final by construction; needs at least one remaining segment.
                return segments.len() > index;
            }
            let Some(actual) = segments.get(index) else {
                return false;
            };
            if *expected != "*" && expected != actual {
                return false;
            }
        }

        segments.len() == pattern.len()
    }
}

impl Display for TopicPattern {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for TopicPattern {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
