//! Topic names, subscription filters and the canonical → alias table.
//!
//! Topics are lowercase, slash-separated paths such as
//! `sensors/attitude/imu`. Each data stream has exactly one canonical name;
//! legacy names are registered as aliases in an [`AliasTable`] and receive a
//! mirror of every canonical publish.
//!
//! | Canonical topic | Traffic |
//! |---|---|
//! | `sensors/<class>/<id>` | Normalised sensor readings |
//! | [`SAFETY_STATUS`] | Every safety state transition (audit trail) |
//! | [`SAFETY_EMERGENCY`] | Stop / clear events |
//! | [`SYSTEM_HEARTBEAT`] | Liveness pulses consumed by the watchdog |

use std::collections::HashMap;

use mowguard_types::{MowError, SensorClass};

pub const SAFETY_STATUS: &str = "safety/status";
pub const SAFETY_EMERGENCY: &str = "safety/emergency";
pub const SYSTEM_HEARTBEAT: &str = "system/heartbeat";

/// Build the canonical topic for a sensor instance.
pub fn sensor_topic(class: SensorClass, instance: &str) -> String {
    format!("sensors/{}/{}", class.as_str(), instance)
}

/// Validate a concrete (non-wildcard) topic name.
pub fn validate_topic(topic: &str) -> Result<(), MowError> {
    let invalid = |reason: &str| MowError::InvalidTopic {
        topic: topic.to_string(),
        reason: reason.to_string(),
    };
    if topic.is_empty() {
        return Err(invalid("empty topic"));
    }
    for segment in topic.split('/') {
        if segment.is_empty() {
            return Err(invalid("empty segment"));
        }
        if segment == "+" || segment == "#" {
            return Err(invalid("wildcards are only valid in filters"));
        }
        if !segment
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(invalid("segments must match [a-z0-9_-]+"));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Topic groups
// ---------------------------------------------------------------------------

/// Named groups a push-channel client may subscribe to instead of naming
/// individual topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicGroup {
    Telemetry,
    Control,
    Maps,
    Ai,
}

impl TopicGroup {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "telemetry" => Some(TopicGroup::Telemetry),
            "control" => Some(TopicGroup::Control),
            "maps" => Some(TopicGroup::Maps),
            "ai" => Some(TopicGroup::Ai),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TopicGroup::Telemetry => "telemetry",
            TopicGroup::Control => "control",
            TopicGroup::Maps => "maps",
            TopicGroup::Ai => "ai",
        }
    }

    /// Patterns covered by this group.
    fn patterns(&self) -> &'static [&'static str] {
        match self {
            TopicGroup::Telemetry => &["sensors/#", SYSTEM_HEARTBEAT],
            TopicGroup::Control => &["safety/#"],
            TopicGroup::Maps => &["maps/#"],
            TopicGroup::Ai => &["ai/#"],
        }
    }
}

// ---------------------------------------------------------------------------
// TopicFilter
// ---------------------------------------------------------------------------

/// Selects the topics a subscriber receives.
///
/// Patterns use MQTT wildcards: `+` matches exactly one segment, a trailing
/// `#` matches the remaining segments (including none).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TopicFilter {
    Exact(String),
    Pattern(String),
    Group(TopicGroup),
}

impl TopicFilter {
    /// Filter matching every topic.
    pub fn all() -> Self {
        TopicFilter::Pattern("#".to_string())
    }

    /// Parse a client-supplied filter: a group name, a wildcard pattern, or
    /// an exact topic.
    pub fn parse(raw: &str) -> Result<Self, MowError> {
        if let Some(group) = TopicGroup::parse(raw) {
            return Ok(TopicFilter::Group(group));
        }
        if raw.contains('+') || raw.contains('#') {
            validate_pattern(raw)?;
            return Ok(TopicFilter::Pattern(raw.to_string()));
        }
        validate_topic(raw)?;
        Ok(TopicFilter::Exact(raw.to_string()))
    }

    /// `true` when `topic` is selected by this filter.
    pub fn matches(&self, topic: &str) -> bool {
        match self {
            TopicFilter::Exact(name) => name == topic,
            TopicFilter::Pattern(pattern) => pattern_matches(pattern, topic),
            TopicFilter::Group(group) => group
                .patterns()
                .iter()
                .any(|p| pattern_matches(p, topic)),
        }
    }
}

impl std::fmt::Display for TopicFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicFilter::Exact(s) | TopicFilter::Pattern(s) => f.write_str(s),
            TopicFilter::Group(g) => f.write_str(g.as_str()),
        }
    }
}

fn validate_pattern(pattern: &str) -> Result<(), MowError> {
    let segments: Vec<&str> = pattern.split('/').collect();
    for (i, segment) in segments.iter().enumerate() {
        let ok = match *segment {
            "+" => true,
            "#" => i == segments.len() - 1,
            s => {
                !s.is_empty()
                    && s.chars().all(|c| {
                        c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-'
                    })
            }
        };
        if !ok {
            return Err(MowError::InvalidTopic {
                topic: pattern.to_string(),
                reason: "invalid wildcard pattern".to_string(),
            });
        }
    }
    Ok(())
}

fn pattern_matches(pattern: &str, topic: &str) -> bool {
    let mut pat = pattern.split('/');
    let mut top = topic.split('/');
    loop {
        match (pat.next(), top.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

// ---------------------------------------------------------------------------
// AliasTable
// ---------------------------------------------------------------------------

/// Pure mapping from canonical topics to their legacy aliases.
///
/// Resolution happens once per publish; the bus validates the reading a
/// single time and then fans out one message per name returned by
/// [`AliasTable::expand`].
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: HashMap<String, Vec<String>>,
    canonical: HashMap<String, String>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table preloaded with the legacy names still used by older observers.
    pub fn with_legacy_defaults() -> Self {
        let mut table = Self::new();
        // Static names below are valid by construction.
        let _ = table.register("sensors/attitude/imu", "imu/data");
        let _ = table.register(SAFETY_STATUS, "safety_status");
        let _ = table.register(SYSTEM_HEARTBEAT, "heartbeat");
        table
    }

    /// Register `alias` as a mirror of `canonical`.
    ///
    /// # Errors
    ///
    /// [`MowError::InvalidTopic`] when either name is malformed, when the
    /// alias is itself canonical for another topic, or when the alias is
    /// already bound to a different canonical topic.
    pub fn register(&mut self, canonical: &str, alias: &str) -> Result<(), MowError> {
        validate_topic(canonical)?;
        validate_topic(alias)?;
        if canonical == alias
            || self.aliases.contains_key(alias)
            || self.canonical.contains_key(canonical)
        {
            return Err(MowError::InvalidTopic {
                topic: alias.to_string(),
                reason: "alias collides with a canonical topic".to_string(),
            });
        }
        if let Some(existing) = self.canonical.get(alias) {
            if existing == canonical {
                return Ok(());
            }
            return Err(MowError::InvalidTopic {
                topic: alias.to_string(),
                reason: format!("alias already bound to {existing}"),
            });
        }
        self.canonical
            .insert(alias.to_string(), canonical.to_string());
        self.aliases
            .entry(canonical.to_string())
            .or_default()
            .push(alias.to_string());
        Ok(())
    }

    /// Map an alias back to its canonical topic; canonical names map to
    /// themselves.
    pub fn canonicalize<'a>(&'a self, topic: &'a str) -> &'a str {
        self.canonical.get(topic).map(String::as_str).unwrap_or(topic)
    }

    /// Every name a publish under `topic` is delivered on, canonical first.
    pub fn expand(&self, topic: &str) -> Vec<String> {
        let canonical = self.canonicalize(topic);
        let mut names = vec![canonical.to_string()];
        if let Some(aliases) = self.aliases.get(canonical) {
            names.extend(aliases.iter().cloned());
        }
        names
    }

    pub fn aliases_of(&self, canonical: &str) -> &[String] {
        self.aliases
            .get(canonical)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
