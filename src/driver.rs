// src/driver.rs
// Abstraction over one physical or logical link (a radio, a tunnel, a wired
// interface) plus the registry that creates drivers by type name.

use crossbeam_channel::Sender;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::DriverConfig;
use crate::status::StatusCode;

/// Events a driver emits to its manager.
#[derive(Clone, Debug)]
pub enum DriverEvent {
    Status { instance: String, code: StatusCode },
    Telemetry { instance: String, data: Value },
}

/// Hands driver events to the manager's pump thread, coalescing duplicate
/// consecutive status values.
#[derive(Clone)]
pub struct DriverEventSender {
    instance: String,
    sender: Sender<DriverEvent>,
    last_status: std::sync::Arc<Mutex<Option<StatusCode>>>,
}

impl DriverEventSender {
    pub fn new(instance: &str, sender: Sender<DriverEvent>) -> Self {
        Self {
            instance: instance.to_string(),
            sender,
            last_status: std::sync::Arc::new(Mutex::new(None)),
        }
    }

    pub fn report_status(&self, code: StatusCode) {
        {
            let mut last = self.last_status.lock().unwrap();
            if *last == Some(code) {
                return;
            }
            *last = Some(code);
        }
        let _ = self
            .sender
            .send(DriverEvent::Status { instance: self.instance.clone(), code });
    }

    pub fn report_telemetry(&self, data: Value) {
        let _ = self
            .sender
            .send(DriverEvent::Telemetry { instance: self.instance.clone(), data });
    }
}

/// Contract every link driver implements. Mutating operations (`init`,
/// `configure`, `enter_pairing_mode`, `stop`) are only ever called from the
/// state-machine thread; queries may come from anywhere.
pub trait ConnectionDriver: Send + Sync {
    /// Driver type, e.g. "WIFI".
    fn name(&self) -> String;

    /// Unique label of this instance within the manager.
    fn instance(&self) -> String;

    /// Bring the driver up with its configuration; spawns whatever workers
    /// the driver needs and starts the status event stream.
    fn init(&self, config: &DriverConfig, events: DriverEventSender) -> Result<(), String>;

    /// Apply a parameter section while running.
    fn configure(&self, params: &Map<String, Value>) -> Result<(), String>;

    /// Stop workers. Called exactly once, at manager shutdown.
    fn stop(&self);

    fn enter_pairing_mode(&self) {}

    /// Reachability info to include in broadcasts; None while not ready.
    fn get_broadcast_info(&self) -> Option<Map<String, Value>>;

    /// Our own address on this link, or empty.
    fn get_local_ip(&self) -> String;

    /// Radio/interface address from the configuration.
    fn get_ip(&self) -> String {
        String::new()
    }

    fn set_ip(&self, _ip: &str) {}

    fn get_vlan(&self) -> String {
        String::new()
    }

    fn get_pairing_settings(&self) -> Map<String, Value>;

    /// Settings changeable while connected; None if the driver has none.
    fn get_connection_settings(&self) -> Option<Map<String, Value>>;

    fn report_wired_status(&self) -> bool {
        false
    }

    /// Skip the RSA handshake when pairing over this driver.
    fn simplified(&self) -> bool;

    /// Pair on the first broadcast without an operator in the loop.
    fn autopair(&self) -> bool;

    /// UDP port to hand off to the MAVLink router, 0 for none.
    fn mavlink_port(&self) -> u16;

    /// Bytes per second; higher is better for downloads.
    fn download_bandwidth(&self) -> i64;

    /// Lower is better for streaming; negative disables streaming use.
    fn streaming_priority(&self) -> i32;
}

type DriverFactory = Box<dyn Fn() -> Box<dyn ConnectionDriver> + Send + Sync>;

struct RegistryEntry {
    settings_template: Value,
    pairing_settings: Value,
    factory: DriverFactory,
}

/// Creates drivers by type name and serves their settings templates to
/// configuration UIs.
#[derive(Default)]
pub struct DriverRegistry {
    entries: HashMap<String, RegistryEntry>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in interface drivers.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        for name in crate::ip_driver::BUILTIN_NAMES {
            let driver_name = name.to_string();
            registry.register(
                name,
                crate::ip_driver::settings_template(),
                Value::Object(Map::new()),
                Box::new(move || Box::new(crate::ip_driver::IpDriver::new(&driver_name))),
            );
        }
        registry
    }

    pub fn register(
        &mut self,
        name: &str,
        settings_template: Value,
        pairing_settings: Value,
        factory: DriverFactory,
    ) {
        self.entries.insert(
            name.to_string(),
            RegistryEntry { settings_template, pairing_settings, factory },
        );
    }

    pub fn create(&self, name: &str) -> Option<Box<dyn ConnectionDriver>> {
        self.entries.get(name).map(|e| (e.factory)())
    }

    /// Map of driver type name to settings template.
    pub fn settings_templates(&self) -> Value {
        let mut map = Map::new();
        for (name, entry) in &self.entries {
            map.insert(name.clone(), entry.settings_template.clone());
        }
        Value::Object(map)
    }

    pub fn pairing_settings(&self, name: &str) -> Option<Value> {
        self.entries.get(name).map(|e| e.pairing_settings.clone())
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;

    #[test]
    fn test_status_coalescing() {
        let (tx, rx) = unbounded();
        let sender = DriverEventSender::new("WIFI", tx);

        sender.report_status(StatusCode::DriverConnected);
        sender.report_status(StatusCode::DriverConnected);
        sender.report_status(StatusCode::DriverNotConnected);
        sender.report_status(StatusCode::DriverConnected);

        let codes: Vec<StatusCode> = rx
            .try_iter()
            .map(|e| match e {
                DriverEvent::Status { code, .. } => code,
                _ => panic!("unexpected telemetry"),
            })
            .collect();
        assert_eq!(
            codes,
            vec![
                StatusCode::DriverConnected,
                StatusCode::DriverNotConnected,
                StatusCode::DriverConnected
            ]
        );
    }

    #[test]
    fn test_builtin_registry() {
        let registry = DriverRegistry::with_builtin();
        assert!(registry.create("WIFI").is_some());
        assert!(registry.create("USB-C").is_some());
        assert!(registry.create("Nope").is_none());

        let templates = registry.settings_templates();
        assert!(templates.get("WIFI").is_some());
        assert!(registry.pairing_settings("WIFI").is_some());
    }
}
