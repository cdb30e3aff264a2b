//! Numbering policy for per-pool bridges
//!
//! Each alias class owns a contiguous block of `vmbrNNNN` names. Well-known
//! aliases get their own block, everything else shares the fallback block.

use serde::{Deserialize, Serialize};

/// An inclusive range of bridge numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeRange {
    pub start: u32,
    pub end: u32,
}

impl BridgeRange {
    pub const fn new(start: u32, end: u32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, number: u32) -> bool {
        (self.start..=self.end).contains(&number)
    }

    /// Candidate bridge names in probe order
    pub fn candidates(&self) -> impl Iterator<Item = String> {
        (self.start..=self.end).map(bridge_name)
    }
}

/// A range reserved for one alias
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AliasRange {
    pub alias: String,
    #[serde(flatten)]
    pub range: BridgeRange,
}

/// Alias class to bridge-number mapping
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgePolicy {
    #[serde(default = "default_alias_ranges")]
    pub ranges: Vec<AliasRange>,
    #[serde(default = "default_fallback")]
    pub fallback: BridgeRange,
}

impl Default for BridgePolicy {
    fn default() -> Self {
        Self {
            ranges: default_alias_ranges(),
            fallback: default_fallback(),
        }
    }
}

fn default_alias_ranges() -> Vec<AliasRange> {
    vec![
        AliasRange {
            alias: "hq".to_string(),
            range: BridgeRange::new(1000, 1999),
        },
        AliasRange {
            alias: "inet".to_string(),
            range: BridgeRange::new(2000, 2999),
        },
    ]
}

fn default_fallback() -> BridgeRange {
    BridgeRange::new(9000, 9999)
}

/// Format a bridge number as an interface name (`vmbr1000`)
pub fn bridge_name(number: u32) -> String {
    format!("vmbr{:04}", number)
}

/// Extract the number from a `vmbrNNNN` name
pub fn bridge_number(name: &str) -> Option<u32> {
    let digits = name.strip_prefix("vmbr")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

impl BridgePolicy {
    /// Range probed for a symbolic alias
    pub fn range_for(&self, alias: &str) -> BridgeRange {
        self.ranges
            .iter()
            .find(|r| r.alias == alias)
            .map(|r| r.range)
            .unwrap_or(self.fallback)
    }

    /// Whether a bridge was created by the allocator and may be swept
    pub fn is_managed(&self, bridge: &str) -> bool {
        match bridge_number(bridge) {
            Some(n) => self.fallback.contains(n) || self.ranges.iter().any(|r| r.range.contains(n)),
            None => false,
        }
    }
}
