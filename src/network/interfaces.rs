//! Interface definitions per device type

use crate::config::DeviceType;
use crate::gateway::InterfaceMap;

/// Management bridge the disabled ecorouter port is parked on
pub const MANAGEMENT_BRIDGE: &str = "vmbr0";

/// An interface after alias resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedInterface {
    pub bridge: String,
    pub vlan: Option<u16>,
}

impl ResolvedInterface {
    pub fn new(bridge: impl Into<String>, vlan: Option<u16>) -> Self {
        Self {
            bridge: bridge.into(),
            vlan,
        }
    }
}

fn tagged(base: String, vlan: Option<u16>) -> String {
    match vlan {
        Some(tag) => format!("{},tag={}", base, tag),
        None => base,
    }
}

/// Build the `netN` slots for a machine.
///
/// ```text
/// linux:     net0..netN   model=virtio,bridge=B[,tag=T],firewall=1
/// ecorouter: net0         model=vmxnet3,bridge=vmbr0,link_down=1
///            net2..netN+2 model=vmxnet3,bridge=B[,tag=T]
/// ```
pub fn build_interfaces(device: DeviceType, interfaces: &[ResolvedInterface]) -> InterfaceMap {
    let mut map = InterfaceMap::new();
    match device {
        DeviceType::Linux => {
            for (i, iface) in interfaces.iter().enumerate() {
                let base = tagged(format!("model=virtio,bridge={}", iface.bridge), iface.vlan);
                map.insert(format!("net{}", i), format!("{},firewall=1", base));
            }
        }
        DeviceType::Ecorouter => {
            map.insert(
                "net0".to_string(),
                format!("model=vmxnet3,bridge={},link_down=1", MANAGEMENT_BRIDGE),
            );
            for (i, iface) in interfaces.iter().enumerate() {
                map.insert(
                    format!("net{}", i + 2),
                    tagged(format!("model=vmxnet3,bridge={}", iface.bridge), iface.vlan),
                );
            }
        }
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linux_interfaces() {
        let map = build_interfaces(
            DeviceType::Linux,
            &[
                ResolvedInterface::new("vmbr1000", None),
                ResolvedInterface::new("vmbr1000", Some(50)),
            ],
        );
        assert_eq!(map["net0"], "model=virtio,bridge=vmbr1000,firewall=1");
        assert_eq!(map["net1"], "model=virtio,bridge=vmbr1000,tag=50,firewall=1");
    }

    #[test]
    fn test_ecorouter_layout() {
        let map = build_interfaces(
            DeviceType::Ecorouter,
            &[
                ResolvedInterface::new("vmbr1000", None),
                ResolvedInterface::new("vmbr2000", Some(7)),
            ],
        );
        assert_eq!(map.len(), 3);
        assert_eq!(map["net0"], "model=vmxnet3,bridge=vmbr0,link_down=1");
        assert!(!map.contains_key("net1"));
        assert_eq!(map["net2"], "model=vmxnet3,bridge=vmbr1000");
        assert_eq!(map["net3"], "model=vmxnet3,bridge=vmbr2000,tag=7");
    }

    #[test]
    fn test_no_interfaces() {
        assert!(build_interfaces(DeviceType::Linux, &[]).is_empty());
    }
}
