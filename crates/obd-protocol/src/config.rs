//! Connection configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ObdError;
use crate::protocol::ProtocolPreference;

/// Which adapter to connect to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceSelector {
    /// Port path or substring of the port/product name (e.g. "rfcomm0",
    /// "OBDII"); `None` picks the first Bluetooth serial port
    pub name: Option<String>,
    /// Serial baud rate (ignored by most Bluetooth SPP stacks)
    pub baud_rate: u32,
    /// AT commands sent after opening the port. Replies are parsed with
    /// headers on and spaces off, so keep `ATH1` and `ATS0` in any override.
    pub init_commands: Vec<String>,
}

/// Adapter setup: reset, echo off, linefeeds off, headers on, spaces off
pub const DEFAULT_INIT_COMMANDS: [&str; 5] = ["ATZ", "ATE0", "ATL0", "ATH1", "ATS0"];

impl Default for DeviceSelector {
    fn default() -> Self {
        Self {
            name: None,
            baud_rate: 38400,
            init_commands: DEFAULT_INIT_COMMANDS.iter().map(|c| c.to_string()).collect(),
        }
    }
}

/// How the negotiation budget is divided among candidates
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetSplit {
    /// Remaining budget divided evenly over remaining candidates
    #[default]
    Even,
    /// Remaining budget divided in proportion to per-candidate weights;
    /// candidates beyond the list weigh 1
    Weighted(Vec<u32>),
}

impl BudgetSplit {
    fn weight(&self, index: usize) -> u128 {
        match self {
            BudgetSplit::Even => 1,
            BudgetSplit::Weighted(weights) => weights.get(index).copied().unwrap_or(1) as u128,
        }
    }

    /// Read deadline slice for candidate `index` of `count`, given what is
    /// left of the budget
    ///
    /// Recomputed before every probe, so time a failed probe did not use
    /// flows to the candidates after it.
    pub fn slice(&self, remaining: Duration, index: usize, count: usize) -> Duration {
        if index >= count {
            return Duration::ZERO;
        }
        let total: u128 = (index..count).map(|i| self.weight(i)).sum();
        let (share, total) = if total == 0 {
            (1, (count - index) as u128)
        } else {
            (self.weight(index), total)
        };
        let nanos = remaining.as_nanos() * share / total;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

/// Session configuration, fixed once the session starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Per-request response deadline in milliseconds
    pub timeout_ms: u64,
    /// Protocols to try during negotiation
    pub protocol_preference: ProtocolPreference,
    /// Re-sends after a timeout or incomplete frame
    pub retry_count: u32,
    /// Fixed pause before each re-send (no backoff growth)
    pub retry_delay_ms: u64,
    /// Overall negotiation budget in milliseconds, shared by all candidates
    pub negotiation_timeout_ms: u64,
    /// Budget division policy
    pub negotiation_split: BudgetSplit,
    /// Adapter to connect to
    pub device: DeviceSelector,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 2000,
            protocol_preference: ProtocolPreference::Auto,
            retry_count: 2,
            retry_delay_ms: 0,
            negotiation_timeout_ms: 10_000,
            negotiation_split: BudgetSplit::Even,
            device: DeviceSelector::default(),
        }
    }
}

impl ConnectionConfig {
    /// Per-request deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause before a re-send
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// Overall negotiation budget
    pub fn negotiation_budget(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Reject settings no session could work with
    pub fn validate(&self) -> Result<(), ObdError> {
        if self.timeout_ms == 0 {
            return Err(ObdError::InvalidConfig("timeout_ms must be positive".to_string()));
        }
        if self.negotiation_timeout_ms == 0 {
            return Err(ObdError::InvalidConfig(
                "negotiation_timeout_ms must be positive".to_string(),
            ));
        }
        if self.protocol_preference.candidates().is_empty() {
            return Err(ObdError::InvalidConfig(
                "protocol_preference lists no protocols".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_even_split() {
        let split = BudgetSplit::Even;
        let budget = Duration::from_millis(900);
        assert_eq!(split.slice(budget, 0, 3), Duration::from_millis(300));
        // A probe that failed fast leaves more for the rest
        assert_eq!(split.slice(Duration::from_millis(800), 1, 3), Duration::from_millis(400));
        assert_eq!(split.slice(Duration::from_millis(400), 2, 3), Duration::from_millis(400));
    }

    #[test]
    fn test_weighted_split() {
        let split = BudgetSplit::Weighted(vec![3, 1]);
        assert_eq!(
            split.slice(Duration::from_millis(1000), 0, 2),
            Duration::from_millis(750)
        );
        assert_eq!(
            split.slice(Duration::from_millis(250), 1, 2),
            Duration::from_millis(250)
        );
        // Missing weights default to 1
        assert_eq!(
            split.slice(Duration::from_millis(1000), 1, 3),
            Duration::from_millis(500)
        );
    }

    #[test]
    fn test_zero_weights_fall_back_to_even() {
        let split = BudgetSplit::Weighted(vec![0, 0]);
        assert_eq!(split.slice(Duration::from_millis(1000), 0, 2), Duration::from_millis(500));
    }

    #[test]
    fn test_validate() {
        assert!(ConnectionConfig::default().validate().is_ok());
        let bad = ConnectionConfig {
            protocol_preference: ProtocolPreference::Ordered(vec![]),
            ..Default::default()
        };
        assert_eq!(bad.validate().unwrap_err().code(), "INVALID_CONFIG");
        let bad = ConnectionConfig {
            timeout_ms: 0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"timeout_ms": 500, "protocol_preference": ["ISO9141"], "negotiation_split": {"weighted": [2, 1]}}"#,
        )
        .unwrap();
        assert_eq!(config.timeout_ms, 500);
        assert_eq!(config.retry_count, 2);
        assert_eq!(config.negotiation_split, BudgetSplit::Weighted(vec![2, 1]));
        assert_eq!(config.device.init_commands[0], "ATZ");
    }

    #[test]
    fn test_device_override_keeps_other_defaults() {
        let config: ConnectionConfig = serde_json::from_str(
            r#"{"device": {"name": "rfcomm0", "init_commands": ["ATWS", "ATH1", "ATS0"]}}"#,
        )
        .unwrap();
        assert_eq!(config.device.baud_rate, 38400);
        assert_eq!(config.device.init_commands.len(), 3);
    }
}
