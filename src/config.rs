//! Engine configuration.
//!
//! [`EngineConfig`] gathers every tunable of the stack in one serde-derived
//! tree. Every section has a `Default`, so a YAML document only needs the
//! keys it changes:
//!
//! ```rust
//! use smartscreen::EngineConfig;
//!
//! let config = EngineConfig::from_yaml_str(
//!     r#"
//! device:
//!   port: /dev/ttyACM0
//! session:
//!   brightness: 40
//! budget:
//!   frame_interval_ms: 50
//! "#,
//! )?;
//! assert_eq!(config.session.brightness, Some(40));
//! # Ok::<(), smartscreen::LinkError>(())
//! ```
//!
//! Durations are written in milliseconds under `*_ms` keys.

use serde::{Deserialize, Serialize};

use crate::controller::{AdaptivePolicy, BackoffPolicy, PerformanceBudget};
use crate::session::SessionConfig;
use crate::types::{DeviceSelector, LinkParams};
use crate::{LinkError, Result};

/// Serde adapter for `Duration` fields stored as (fractional) milliseconds.
pub(crate) mod millis {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64() * 1000.0)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let millis = f64::deserialize(deserializer)?;
        if !millis.is_finite() || millis < 0.0 {
            return Err(D::Error::custom(format!("invalid duration {millis} ms")));
        }
        Ok(Duration::from_secs_f64(millis / 1000.0))
    }
}

/// Everything needed to run a [`StreamController`](crate::controller::StreamController).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub device: DeviceSelector,
    pub link: LinkParams,
    pub session: SessionConfig,
    pub budget: PerformanceBudget,
    pub adaptive: AdaptivePolicy,
    pub backoff: BackoffPolicy,
    /// Connect as soon as the controller starts
    pub auto_connect: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device: DeviceSelector::default(),
            link: LinkParams::default(),
            session: SessionConfig::default(),
            budget: PerformanceBudget::default(),
            adaptive: AdaptivePolicy::default(),
            backoff: BackoffPolicy::default(),
            auto_connect: true,
        }
    }
}

impl EngineConfig {
    /// Parse a YAML document and validate the result.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml_ng::from_str(yaml).map_err(|err| LinkError::invalid_config("yaml", err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml_ng::to_string(self).map_err(|err| LinkError::invalid_config("yaml", err.to_string()))
    }

    /// Check every section, reporting the first bad field.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;
        self.link.validate()?;
        self.session.validate()?;
        self.budget.validate()?;
        self.adaptive.validate()?;
        self.backoff.validate()
    }

    /// Same as the default, aimed at an explicit port.
    pub fn for_port(port: impl Into<String>) -> Self {
        Self { device: DeviceSelector::Port(port.into()), ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn empty_document_gives_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert!(config.auto_connect);
        assert_eq!(config.link.baud_rate, 115_200);
    }

    #[test]
    fn durations_are_milliseconds() {
        let config = EngineConfig::from_yaml_str(
            "session:\n  handshake_timeout_ms: 250\nbackoff:\n  initial_ms: 100\n  ceiling_ms: 2000\n  seed: 7\n",
        )
        .unwrap();
        assert_eq!(config.session.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.backoff.ceiling, Duration::from_secs(2));
        assert_eq!(config.backoff.seed, Some(7));
    }

    #[test]
    fn usb_selector_from_yaml() {
        let config =
            EngineConfig::from_yaml_str("device:\n  usb:\n    vendor_id: 6790\n    product_id: 22306\n").unwrap();
        assert_eq!(config.device, DeviceSelector::Usb { vendor_id: 0x1A86, product_id: 0x5722 });
    }

    #[test]
    fn invalid_values_name_the_field() {
        let err = EngineConfig::from_yaml_str("session:\n  brightness: 120\n").unwrap_err();
        assert!(matches!(err, LinkError::InvalidConfig { ref field, .. } if field == "session.brightness"));

        let err = EngineConfig::from_yaml_str("budget:\n  frame_interval_ms: -5\n").unwrap_err();
        assert!(matches!(err, LinkError::InvalidConfig { ref field, .. } if field == "yaml"));
    }

    #[test]
    fn yaml_round_trip_keeps_settings() {
        let mut config = EngineConfig::for_port("/dev/ttyACM1");
        config.session.brightness = Some(80);
        config.adaptive.max_frame_divisor = 4;
        let yaml = config.to_yaml_string().unwrap();
        let parsed = EngineConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(parsed.device, config.device);
        assert_eq!(parsed.session.brightness, Some(80));
        assert_eq!(parsed.adaptive.max_frame_divisor, 4);
    }
}
