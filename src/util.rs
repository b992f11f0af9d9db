// src/util.rs
// Small shared helpers: time, interface enumeration, JSON merging

use network_interface::NetworkInterfaceConfig;
use serde_json::Value;
use std::net::Ipv4Addr;

/// Milliseconds since the unix epoch, as carried in protocol frames.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Does `ip` fall under the dotted prefix, e.g. "10.41.0" matches "10.41.0.7"?
/// A full address is matched exactly.
pub fn ip_matches(ip: &str, prefix: &str) -> bool {
    if prefix.is_empty() || ip.is_empty() {
        return false;
    }
    if ip == prefix {
        return true;
    }
    ip.starts_with(prefix) && ip.as_bytes().get(prefix.len()) == Some(&b'.')
}

/// All local IPv4 addresses, loopback included.
pub fn local_ipv4_addresses() -> Vec<Ipv4Addr> {
    let mut ips = Vec::new();
    if let Ok(interfaces) = network_interface::NetworkInterface::show() {
        for iface in &interfaces {
            for addr in &iface.addr {
                if let network_interface::Addr::V4(v4) = addr {
                    if !ips.contains(&v4.ip) {
                        ips.push(v4.ip);
                    }
                }
            }
        }
    }
    ips
}

/// First IPv4 address of the named interface (e.g. "eth0"), if any.
pub fn interface_ipv4(device: &str) -> Option<Ipv4Addr> {
    let interfaces = network_interface::NetworkInterface::show().ok()?;
    interfaces
        .iter()
        .filter(|i| i.name == device)
        .flat_map(|i| i.addr.iter())
        .find_map(|a| match a {
            network_interface::Addr::V4(v4) => Some(v4.ip),
            _ => None,
        })
}

/// Broadcast addresses for every local interface. Loopback is included so
/// that deployments talking to themselves on one host still hear broadcasts.
pub fn local_broadcast_addresses() -> Vec<Ipv4Addr> {
    let mut addresses = Vec::new();

    if let Ok(interfaces) = network_interface::NetworkInterface::show() {
        for iface in &interfaces {
            for addr in &iface.addr {
                if let network_interface::Addr::V4(v4) = addr {
                    let ip = v4.ip;
                    if let Some(bcast) = v4.broadcast {
                        if !addresses.contains(&bcast) && bcast != Ipv4Addr::BROADCAST {
                            addresses.push(bcast);
                        }
                    } else if let Some(netmask) = v4.netmask {
                        let o = ip.octets();
                        let m = netmask.octets();
                        let bcast = Ipv4Addr::new(o[0] | !m[0], o[1] | !m[1], o[2] | !m[2], o[3] | !m[3]);
                        if !addresses.contains(&bcast) && bcast != Ipv4Addr::BROADCAST {
                            addresses.push(bcast);
                        }
                    } else {
                        let o = ip.octets();
                        let bcast = Ipv4Addr::new(o[0], o[1], o[2], 255);
                        if !addresses.contains(&bcast) && bcast != Ipv4Addr::BROADCAST {
                            addresses.push(bcast);
                        }
                    }
                }
            }
        }
    }

    addresses
}

/// Recursively merge `b` into `a`. Objects merge key-wise, everything else in
/// `b` replaces the value in `a`.
pub fn deep_merge(a: &mut Value, b: &Value) {
    match (a, b) {
        (Value::Object(a_map), Value::Object(b_map)) => {
            for (k, v) in b_map {
                deep_merge(a_map.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
        (a_slot, b_val) => {
            *a_slot = b_val.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_ip_matches() {
        assert!(ip_matches("10.41.0.7", "10.41.0"));
        assert!(ip_matches("10.41.0.7", "10.41.0.7"));
        assert!(!ip_matches("10.41.10.7", "10.41.1"));
        assert!(!ip_matches("10.41.0.7", "10.41.1"));
        assert!(!ip_matches("", "10.41.0"));
        assert!(!ip_matches("10.41.0.7", ""));
    }

    #[test]
    fn test_deep_merge() {
        let mut a = json!({"channel": "36", "nested": {"x": 1, "y": 2}});
        let b = json!({"channel": "48", "tx_power": "23", "nested": {"y": 3}});
        deep_merge(&mut a, &b);
        assert_eq!(a["channel"], "48");
        assert_eq!(a["tx_power"], "23");
        assert_eq!(a["nested"]["x"], 1);
        assert_eq!(a["nested"]["y"], 3);
    }

    #[test]
    fn test_local_addresses_include_loopback() {
        let ips = local_ipv4_addresses();
        assert!(ips.iter().any(|ip| ip.is_loopback()));
    }
}
