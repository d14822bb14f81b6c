//! Colon-delimited channel names and the wildcard patterns used to
//! subscribe to them (`trigger:*`, `trigger:**`).

use std::fmt;

pub const SEPARATOR: char = ':';

/// Channels that only carry the latest liveness snapshot. A newer one always
/// supersedes them, so they are never buffered.
pub const LIVENESS_CHANNELS: [&str; 2] = ["status", "monitoring"];

/// Prefix of every command and command-response channel.
pub const TRIGGER_PREFIX: &str = "trigger:";

pub fn is_liveness(channel: &str) -> bool {
    LIVENESS_CHANNELS.contains(&channel)
}

pub fn is_trigger(channel: &str) -> bool {
    channel.starts_with(TRIGGER_PREFIX)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    /// `*`: exactly one segment.
    One,
    /// `**`: everything from here on, including nothing.
    Rest,
}

/// A parsed subscription pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelPattern {
    segments: Vec<Segment>,
}

impl ChannelPattern {
    pub fn parse(pattern: &str) -> Self {
        let mut segments = Vec::new();
        for part in pattern.split(SEPARATOR) {
            match part {
                "**" => {
                    segments.push(Segment::Rest);
                    break;
                }
                "*" => segments.push(Segment::One),
                literal => segments.push(Segment::Literal(literal.to_string())),
            }
        }
        Self { segments }
    }

    /// Pattern matching every channel.
    pub fn any() -> Self {
        Self {
            segments: vec![Segment::Rest],
        }
    }

    pub fn matches(&self, channel: &str) -> bool {
        let mut parts = channel.split(SEPARATOR);
        for segment in &self.segments {
            match segment {
                Segment::Rest => return true,
                Segment::One => {
                    if parts.next().is_none() {
                        return false;
                    }
                }
                Segment::Literal(lit) => {
                    if parts.next() != Some(lit.as_str()) {
                        return false;
                    }
                }
            }
        }
        parts.next().is_none()
    }
}

impl fmt::Display for ChannelPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rendered: Vec<&str> = self
            .segments
            .iter()
            .map(|s| match s {
                Segment::Literal(lit) => lit.as_str(),
                Segment::One => "*",
                Segment::Rest => "**",
            })
            .collect();
        f.write_str(&rendered.join(":"))
    }
}

impl From<&str> for ChannelPattern {
    fn from(pattern: &str) -> Self {
        Self::parse(pattern)
    }
}
