//! Bridge alias parsing
//!
//! ```text
//! "hq"        -> Symbolic { alias: "hq", vlan: None }
//! "hq.50"     -> Symbolic { alias: "hq", vlan: Some(50) }
//! "**lan**"   -> Reserved { bridge: "lan", vlan: None }
//! "vmbr0"     -> Reserved { bridge: "vmbr0", vlan: None }
//! "20"        -> Reserved { bridge: "20", vlan: None }
//! ```

use thiserror::Error;

use crate::config::NetworkSpec;

/// Highest 802.1Q id usable as an interface tag
pub const MAX_VLAN_ID: u16 = 4094;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AliasError {
    #[error("Empty bridge alias")]
    Empty,

    #[error("Invalid VLAN id '{tag}' in alias '{alias}' (expected 1..={max})", max = MAX_VLAN_ID)]
    InvalidVlan { alias: String, tag: String },
}

/// A parsed interface bridge reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeRef {
    /// Literal bridge name, shared across pools
    Reserved { bridge: String, vlan: Option<u16> },
    /// Per-pool alias resolved through the allocator
    Symbolic { alias: String, vlan: Option<u16> },
}

impl BridgeRef {
    pub fn vlan(&self) -> Option<u16> {
        match self {
            BridgeRef::Reserved { vlan, .. } | BridgeRef::Symbolic { vlan, .. } => *vlan,
        }
    }

    /// Alias identity with the VLAN suffix stripped
    pub fn identity(&self) -> &str {
        match self {
            BridgeRef::Reserved { bridge, .. } => bridge,
            BridgeRef::Symbolic { alias, .. } => alias,
        }
    }
}

/// Split `alias.N` into the alias and its VLAN id.
///
/// Only a single dot followed by digits counts as a VLAN suffix; anything
/// else is part of the alias.
pub fn split_vlan(name: &str) -> Result<(&str, Option<u16>), AliasError> {
    let mut parts = name.split('.');
    let (Some(alias), Some(tag), None) = (parts.next(), parts.next(), parts.next()) else {
        return Ok((name, None));
    };
    if alias.is_empty() || tag.is_empty() || !tag.bytes().all(|b| b.is_ascii_digit()) {
        return Ok((name, None));
    }
    match tag.parse::<u16>() {
        Ok(id) if (1..=MAX_VLAN_ID).contains(&id) => Ok((alias, Some(id))),
        _ => Err(AliasError::InvalidVlan {
            alias: name.to_string(),
            tag: tag.to_string(),
        }),
    }
}

fn looks_literal(name: &str) -> bool {
    name.starts_with("vmbr") || (!name.is_empty() && name.bytes().all(|b| b.is_ascii_digit()))
}

/// Classify a network entry as reserved or symbolic
pub fn parse_bridge_ref(spec: &NetworkSpec) -> Result<BridgeRef, AliasError> {
    let raw = spec.bridge.trim();
    if raw.is_empty() {
        return Err(AliasError::Empty);
    }

    if let Some(inner) = raw.strip_prefix("**").and_then(|r| r.strip_suffix("**")) {
        let (bridge, vlan) = split_vlan(inner.trim())?;
        if bridge.is_empty() {
            return Err(AliasError::Empty);
        }
        return Ok(BridgeRef::Reserved {
            bridge: bridge.to_string(),
            vlan,
        });
    }

    let (name, vlan) = split_vlan(raw)?;
    if spec.reserved || looks_literal(name) {
        Ok(BridgeRef::Reserved {
            bridge: name.to_string(),
            vlan,
        })
    } else {
        Ok(BridgeRef::Symbolic {
            alias: name.to_string(),
            vlan,
        })
    }
}
