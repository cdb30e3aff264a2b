//! Tenant network wiring: alias parsing, bridge allocation, interface
//! layout and the post-deletion bridge sweep.

pub mod alias;
pub mod allocator;
pub mod cleanup;
pub mod interfaces;
pub mod ranges;

pub use alias::{parse_bridge_ref, split_vlan, AliasError, BridgeRef, MAX_VLAN_ID};
pub use allocator::{Allocation, BridgeAllocator, VlanPlan};
pub use cleanup::{cleanup_unused_bridges, unused_bridges, BridgeCleanupReport};
pub use interfaces::{build_interfaces, ResolvedInterface, MANAGEMENT_BRIDGE};
pub use ranges::{bridge_name, bridge_number, AliasRange, BridgePolicy, BridgeRange};
