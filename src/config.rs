// src/config.rs
// Typed configuration for a connection manager. All stringly JSON from the
// embedder is validated here, once, at init; the rest of the crate works
// with these structs.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::util;

fn default_true() -> bool {
    true
}

fn default_link_layer() -> String {
    "udp".to_string()
}

fn default_configuration_file() -> String {
    "pairing-cm.json".to_string()
}

fn default_ethernet_device() -> String {
    "eth0".to_string()
}

fn default_bandwidth() -> i64 {
    i64::MAX
}

fn default_priority() -> i32 {
    i32::MAX
}

/// Protocol periods and timeouts, in milliseconds. Defaults are the wire
/// contract; deployments normally leave them alone.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Timing {
    pub broadcast_period: u64,
    pub status_period: u64,
    pub status_timeout: u64,
    pub request_timeout: u64,
    pub request_retries: u32,
    pub reconfiguration_timeout: u64,
    pub driver_configure_timeout: u64,
    pub mavlink_router_period: u64,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            broadcast_period: 3000,
            status_period: 2000,
            status_timeout: 6000,
            request_timeout: 500,
            request_retries: 10,
            reconfiguration_timeout: 20000,
            driver_configure_timeout: 30000,
            mavlink_router_period: 10000,
        }
    }
}

impl Timing {
    /// A pairing-mode broadcast entry expires after this long without refresh.
    pub fn broadcast_expiry(&self) -> u64 {
        self.broadcast_period * 3
    }
}

/// One configured driver instance with its three parameter sections.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriverConfig {
    pub name: String,
    #[serde(default)]
    pub instance: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub simplified: bool,
    #[serde(default)]
    pub autopair: bool,
    #[serde(default = "default_true")]
    pub mavlink: bool,
    #[serde(default)]
    pub mavlink_port: u16,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ip_status: bool,
    #[serde(default = "default_bandwidth")]
    pub download_bandwidth: i64,
    #[serde(default = "default_priority")]
    pub streaming_priority: i32,
    #[serde(default)]
    pub local: Map<String, Value>,
    #[serde(default)]
    pub pairing: Map<String, Value>,
    #[serde(default)]
    pub connection: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Which of a driver's parameter sections to apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ParamSection {
    Local,
    Pairing,
    Connection,
}

impl DriverConfig {
    pub fn section(&self, section: ParamSection) -> &Map<String, Value> {
        match section {
            ParamSection::Local => &self.local,
            ParamSection::Pairing => &self.pairing,
            ParamSection::Connection => &self.connection,
        }
    }
}

/// Validated manager configuration (see `ManagerConfig::parse`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ManagerConfig {
    pub machine_name: String,
    #[serde(default)]
    pub encryption_key: String,
    #[serde(default = "default_link_layer")]
    pub link_layer: String,
    #[serde(default = "default_configuration_file")]
    pub configuration_file: String,
    #[serde(default)]
    pub aes_encryption: bool,
    #[serde(default = "default_true")]
    pub rsa_encryption: bool,
    #[serde(default = "default_ethernet_device")]
    pub ethernet_device: String,
    #[serde(default)]
    pub multicast_ip: String,
    /// Local UDP port; None picks the role default, 0 an OS-assigned port.
    #[serde(default)]
    pub port: Option<u16>,
    /// Port the counterpart role listens on (broadcast destination).
    #[serde(default)]
    pub remote_port: Option<u16>,
    #[serde(default)]
    pub timing: Timing,
    #[serde(default)]
    pub drivers: Vec<DriverConfig>,
}

impl ManagerConfig {
    pub fn parse(configuration: &str) -> Result<Self, String> {
        let mut config: ManagerConfig =
            serde_json::from_str(configuration).map_err(|e| e.to_string())?;

        if config.machine_name.is_empty() {
            return Err("machine_name is required".to_string());
        }
        if config.link_layer != "udp" {
            return Err(format!("unsupported link_layer '{}'", config.link_layer));
        }

        let mut seen = std::collections::HashSet::new();
        for driver in &mut config.drivers {
            if driver.name.is_empty() {
                return Err("driver name is required".to_string());
            }
            if driver.instance.is_empty() {
                driver.instance = driver.name.clone();
            }
            if !seen.insert(driver.instance.clone()) {
                return Err(format!("duplicate driver instance '{}'", driver.instance));
            }
        }

        Ok(config)
    }

    pub fn driver(&self, instance: &str) -> Option<&DriverConfig> {
        self.drivers.iter().find(|d| d.instance == instance)
    }

    pub fn driver_mut(&mut self, instance: &str) -> Option<&mut DriverConfig> {
        self.drivers.iter_mut().find(|d| d.instance == instance)
    }

    /// Merge a reconfiguration delta of the shape
    /// `{"drivers": [{"instance": "...", "channel": "48", ...}]}` into the
    /// running configuration's connection sections. Returns the set of
    /// instances that changed.
    pub fn merge_driver_params(&mut self, params: &Value, add_missing_drivers: bool) -> Vec<String> {
        let mut changed = Vec::new();
        let entries = match params.get("drivers").and_then(|d| d.as_array()) {
            Some(entries) => entries,
            None => return changed,
        };

        for entry in entries {
            let obj = match entry.as_object() {
                Some(o) => o,
                None => continue,
            };
            let instance = obj
                .get("instance")
                .or_else(|| obj.get("name"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            if instance.is_empty() {
                continue;
            }

            if self.driver(&instance).is_none() {
                if !add_missing_drivers {
                    continue;
                }
                let name = obj
                    .get("name")
                    .and_then(|v| v.as_str())
                    .unwrap_or(instance.as_str())
                    .to_string();
                self.drivers.push(DriverConfig {
                    name,
                    instance: instance.clone(),
                    password: None,
                    simplified: false,
                    autopair: false,
                    mavlink: true,
                    mavlink_port: 0,
                    ip: None,
                    ip_status: false,
                    download_bandwidth: default_bandwidth(),
                    streaming_priority: default_priority(),
                    local: Map::new(),
                    pairing: Map::new(),
                    connection: Map::new(),
                    extra: Map::new(),
                });
            }

            let driver = self.driver_mut(&instance).unwrap();
            let mut section = Value::Object(driver.connection.clone());
            for (k, v) in obj {
                if k == "instance" || k == "name" {
                    continue;
                }
                util::deep_merge(
                    section.as_object_mut().unwrap().entry(k.clone()).or_insert(Value::Null),
                    v,
                );
            }
            if let Value::Object(map) = section {
                if map != driver.connection {
                    driver.connection = map;
                    changed.push(instance);
                }
            }
        }

        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_config() -> String {
        json!({
            "machine_name": "TestGCS",
            "encryption_key": "1234567890",
            "link_layer": "udp",
            "configuration_file": "pairing-cm.json",
            "aes_encryption": false,
            "rsa_encryption": true,
            "drivers": [{
                "name": "WIFI",
                "ip": "10.41.0",
                "password": "secret",
                "local": {"mode": "0"},
                "pairing": {"channel": "36", "bandwidth": "1", "tx_power": "7"},
                "connection": {"channel": "16", "bandwidth": "0", "tx_power": "20"}
            }]
        })
        .to_string()
    }

    #[test]
    fn test_parse_defaults() {
        let config = ManagerConfig::parse(&sample_config()).unwrap();
        assert_eq!(config.machine_name, "TestGCS");
        assert!(config.rsa_encryption);
        assert!(!config.aes_encryption);
        assert_eq!(config.drivers.len(), 1);
        // instance defaults to the driver name
        assert_eq!(config.drivers[0].instance, "WIFI");
        assert!(config.drivers[0].mavlink);
        assert_eq!(config.timing.broadcast_period, 3000);
        assert_eq!(config.timing.request_retries, 10);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ManagerConfig::parse("{}").is_err());
        assert!(ManagerConfig::parse(r#"{"machine_name":"x","link_layer":"tcp"}"#).is_err());

        let dup = json!({
            "machine_name": "x",
            "drivers": [{"name": "WIFI"}, {"name": "WIFI"}]
        })
        .to_string();
        assert!(ManagerConfig::parse(&dup).is_err());
    }

    #[test]
    fn test_timing_override() {
        let cfg = json!({
            "machine_name": "x",
            "timing": {"broadcast_period": 200, "request_timeout": 50}
        })
        .to_string();
        let config = ManagerConfig::parse(&cfg).unwrap();
        assert_eq!(config.timing.broadcast_period, 200);
        assert_eq!(config.timing.request_timeout, 50);
        // untouched fields keep their defaults
        assert_eq!(config.timing.status_timeout, 6000);
        assert_eq!(config.timing.broadcast_expiry(), 600);
    }

    #[test]
    fn test_merge_driver_params() {
        let mut config = ManagerConfig::parse(&sample_config()).unwrap();
        let delta = json!({
            "drivers": [{"instance": "WIFI", "channel": "48", "tx_power": "23"}]
        });
        let changed = config.merge_driver_params(&delta, false);
        assert_eq!(changed, vec!["WIFI".to_string()]);

        let driver = config.driver("WIFI").unwrap();
        assert_eq!(driver.connection["channel"], "48");
        assert_eq!(driver.connection["tx_power"], "23");
        // keys absent from the delta survive
        assert_eq!(driver.connection["bandwidth"], "0");

        // merging the same delta again is a no-op
        let changed = config.merge_driver_params(&delta, false);
        assert!(changed.is_empty());
    }

    #[test]
    fn test_merge_unknown_instance() {
        let mut config = ManagerConfig::parse(&sample_config()).unwrap();
        let delta = json!({"drivers": [{"instance": "Ghost", "channel": "1"}]});
        assert!(config.merge_driver_params(&delta, false).is_empty());

        let changed = config.merge_driver_params(&delta, true);
        assert_eq!(changed, vec!["Ghost".to_string()]);
        assert_eq!(config.driver("Ghost").unwrap().connection["channel"], "1");
    }
}
