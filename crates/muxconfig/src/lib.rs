use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};

/// Annotated configuration written by `camswitch sample-config`.
pub const SAMPLE_CONFIG: &str = r#"# camswitch session
version = 1
initial = "left"          # target that owns the feed at start
switch_interval = "2s"    # rotate the feed this often; 0 disables rotation
switch_timeout = "5s"     # give up on an attach or detach after this long

[producer]
fps = 30
width = 64
height = 48

[consume]
policy = "latest"         # "latest" never blocks, "wait" waits for a new frame
wait_timeout = "50ms"

[[targets]]
name = "left"
width = 320
height = 240
present_interval = "16ms"

[[targets]]
name = "right"
width = 640
height = 480
present_interval = "16ms"
"#;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MuxConfig {
    pub version: u32,
    #[serde(default)]
    pub initial: Option<String>,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub switch_interval: Option<Duration>,
    #[serde(
        default = "default_switch_timeout",
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub switch_timeout: Option<Duration>,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consume: ConsumeConfig,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProducerConfig {
    #[serde(default = "default_fps")]
    pub fps: f32,
    #[serde(default = "default_frame_width")]
    pub width: u32,
    #[serde(default = "default_frame_height")]
    pub height: u32,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            fps: default_fps(),
            width: default_frame_width(),
            height: default_frame_height(),
        }
    }
}

impl ProducerConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f32(1.0 / self.fps)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumeMode {
    #[default]
    Latest,
    Wait,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConsumeConfig {
    #[serde(default)]
    pub policy: ConsumeMode,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub wait_timeout: Option<Duration>,
}

impl ConsumeConfig {
    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout.unwrap_or_else(default_wait_timeout)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub name: String,
    pub width: u32,
    pub height: u32,
    #[serde(
        default,
        deserialize_with = "deserialize_duration_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub present_interval: Option<Duration>,
    #[serde(default)]
    pub samples: Option<u32>,
    #[serde(default)]
    pub swap_interval: Option<u32>,
}

fn default_switch_timeout() -> Option<Duration> {
    Some(Duration::from_secs(5))
}

fn default_wait_timeout() -> Duration {
    Duration::from_millis(50)
}

fn default_fps() -> f32 {
    30.0
}

fn default_frame_width() -> u32 {
    64
}

fn default_frame_height() -> u32 {
    48
}

/// Parses a duration the way configuration files spell them: a humantime
/// string (`"250ms"`, `"2s"`) or a plain number of seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let trimmed = raw.trim();
    if let Ok(seconds) = trimmed.parse::<f64>() {
        if seconds.is_nan() || seconds.is_sign_negative() {
            return Err(ConfigError::Invalid(format!(
                "duration '{raw}' must be non-negative"
            )));
        }
        return Ok(Duration::from_secs_f64(seconds));
    }
    humantime::parse_duration(trimmed)
        .map_err(|err| ConfigError::Invalid(format!("invalid duration '{raw}': {err}")))
}

fn deserialize_duration_opt<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    struct Visitor;
    impl<'de> de::Visitor<'de> for Visitor {
        type Value = Option<Duration>;

        fn expecting(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
            formatter.write_str("a duration as number of seconds or human-readable string")
        }

        fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            humantime::parse_duration(v)
                .map(Some)
                .map_err(|err| E::custom(format!("invalid duration '{v}': {err}")))
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(Some(Duration::from_secs(v)))
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v < 0 {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs(v as u64)))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() || v.is_sign_negative() {
                return Err(E::custom("duration must be non-negative"));
            }
            Ok(Some(Duration::from_secs_f64(v)))
        }

        fn visit_none<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }

        fn visit_unit<E>(self) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(None)
        }
    }

    deserializer.deserialize_any(Visitor)
}

impl MuxConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let raw: MuxConfig = toml::from_str(input)?;
        raw.validate()?;
        Ok(raw)
    }

    pub fn target(&self, name: &str) -> Option<&TargetConfig> {
        self.targets.iter().find(|target| target.name == name)
    }

    /// Target that takes the feed at start: `initial`, or the first target.
    pub fn initial_target(&self) -> Option<&str> {
        self.initial
            .as_deref()
            .or_else(|| self.targets.first().map(|target| target.name.as_str()))
    }

    /// Auto-rotation period; `None` when rotation is disabled.
    pub fn switch_interval(&self) -> Option<Duration> {
        self.switch_interval.filter(|interval| !interval.is_zero())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.version != 1 {
            return Err(ConfigError::Invalid(format!(
                "unsupported config version {}; expected 1",
                self.version
            )));
        }

        if self.targets.is_empty() {
            return Err(ConfigError::Invalid(
                "config must define at least one target".into(),
            ));
        }

        let mut names = HashSet::new();
        for target in &self.targets {
            if target.name.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "target name may not be empty".into(),
                ));
            }
            if !names.insert(target.name.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' is defined more than once",
                    target.name
                )));
            }
            if target.width == 0 || target.height == 0 {
                return Err(ConfigError::Invalid(format!(
                    "target '{}' must have a non-zero size",
                    target.name
                )));
            }
            if let Some(samples) = target.samples {
                if !(1..=16).contains(&samples) {
                    return Err(ConfigError::Invalid(format!(
                        "target '{}' samples must be between 1 and 16",
                        target.name
                    )));
                }
            }
        }

        if let Some(initial) = &self.initial {
            if !names.contains(initial.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "initial references unknown target '{initial}'"
                )));
            }
        }

        if !(self.producer.fps > 0.0) {
            return Err(ConfigError::Invalid("producer.fps must be > 0".into()));
        }
        if self.producer.width == 0 || self.producer.height == 0 {
            return Err(ConfigError::Invalid(
                "producer frames must have a non-zero size".into(),
            ));
        }

        if let Some(timeout) = self.switch_timeout {
            if timeout.is_zero() {
                return Err(ConfigError::Invalid(
                    "switch_timeout must be greater than zero".into(),
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_sample_config() {
        let config = MuxConfig::from_toml_str(SAMPLE_CONFIG).expect("parse config");
        assert_eq!(config.version, 1);
        assert_eq!(config.initial_target(), Some("left"));
        assert_eq!(config.switch_interval(), Some(Duration::from_secs(2)));
        assert_eq!(config.switch_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.consume.policy, ConsumeMode::Latest);
        assert_eq!(config.consume.wait_timeout(), Duration::from_millis(50));
        let right = config.target("right").unwrap();
        assert_eq!((right.width, right.height), (640, 480));
        assert_eq!(right.present_interval, Some(Duration::from_millis(16)));
    }

    #[test]
    fn applies_defaults() {
        let config = MuxConfig::from_toml_str(
            r#"
version = 1
switch_interval = 0

[[targets]]
name = "only"
width = 8
height = 8
"#,
        )
        .unwrap();
        assert_eq!(config.initial_target(), Some("only"));
        assert_eq!(config.switch_interval(), None);
        assert_eq!(config.switch_timeout, Some(Duration::from_secs(5)));
        assert_eq!(config.producer.fps, 30.0);
        assert_eq!(
            config.producer.frame_interval(),
            Duration::from_secs_f32(1.0 / 30.0)
        );
    }

    #[test]
    fn rejects_duplicate_targets() {
        let config = r#"
version = 1

[[targets]]
name = "a"
width = 8
height = 8

[[targets]]
name = "a"
width = 8
height = 8
"#;
        let err = MuxConfig::from_toml_str(config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("more than once")));
    }

    #[test]
    fn rejects_unknown_initial_target() {
        let config = r#"
version = 1
initial = "missing"

[[targets]]
name = "a"
width = 8
height = 8
"#;
        let err = MuxConfig::from_toml_str(config).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_empty_or_zero_sized() {
        let no_targets = "version = 1\n";
        assert!(MuxConfig::from_toml_str(no_targets).is_err());

        let zero = r#"
version = 1

[[targets]]
name = "a"
width = 0
height = 8
"#;
        assert!(MuxConfig::from_toml_str(zero).is_err());

        let stalled = r#"
version = 1

[producer]
fps = 0

[[targets]]
name = "a"
width = 8
height = 8
"#;
        assert!(MuxConfig::from_toml_str(stalled).is_err());
    }

    #[test]
    fn rejects_wrong_version_and_bad_durations() {
        let config = r#"
version = 2

[[targets]]
name = "a"
width = 8
height = 8
"#;
        assert!(matches!(
            MuxConfig::from_toml_str(config),
            Err(ConfigError::Invalid(_))
        ));

        let config = r#"
version = 1
switch_timeout = "soon"

[[targets]]
name = "a"
width = 8
height = 8
"#;
        assert!(matches!(
            MuxConfig::from_toml_str(config),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn parse_duration_accepts_both_spellings() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("1.5").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("-1").is_err());
        assert!(parse_duration("eventually").is_err());
    }
}
