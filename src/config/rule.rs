#![allow(dead_code)]

use serde::{Deserialize, Serialize};

/// Routing-rule profile handed to the config compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleMode {
    /// Regional/private traffic goes direct, ads are blocked, the rest is
    /// proxied.
    Default,
    /// Proxy everything except private ranges.
    All,
    /// Internal probe mode: one inbound, everything to the proxy.
    Test,
}

impl RuleMode {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "default" => Some(RuleMode::Default),
            "all" => Some(RuleMode::All),
            "test" => Some(RuleMode::Test),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            RuleMode::Default => "default",
            RuleMode::All => "all",
            RuleMode::Test => "test",
        }
    }

    pub fn is_test(&self) -> bool {
        matches!(self, RuleMode::Test)
    }
}

impl Default for RuleMode {
    fn default() -> Self {
        RuleMode::Default
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_mode_from_str() {
        assert_eq!(RuleMode::from_str("default"), Some(RuleMode::Default));
        assert_eq!(RuleMode::from_str("ALL"), Some(RuleMode::All));
        assert_eq!(RuleMode::from_str("test"), Some(RuleMode::Test));
        assert_eq!(RuleMode::from_str("bogus"), None);
    }

    #[test]
    fn test_rule_mode_round_trip() {
        for mode in [RuleMode::Default, RuleMode::All, RuleMode::Test] {
            assert_eq!(RuleMode::from_str(mode.as_str()), Some(mode));
        }
    }
}
