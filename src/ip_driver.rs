// src/ip_driver.rs
// Built-in driver for links that are plain IP interfaces: WiFi bridges,
// USB-C networking, mesh VPN tunnels. The driver is addressed by an IPv4
// prefix; a poll worker watches the local interfaces and reports the link
// up whenever an address under that prefix exists.

use serde_json::{json, Map, Value};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::DriverConfig;
use crate::driver::{ConnectionDriver, DriverEventSender};
use crate::status::StatusCode;
use crate::util;

pub const BUILTIN_NAMES: &[&str] = &["WIFI", "USB-C", "ZeroTier"];

const POLL_PERIOD_MS: u64 = 1000;

pub fn settings_template() -> Value {
    json!({
        "ip": "",
        "ip_status": false,
        "simplified": true,
        "autopair": false,
        "mavlink": true
    })
}

struct IpDriverState {
    instance: RwLock<String>,
    prefix: RwLock<String>,
    ip_status: RwLock<bool>,
    simplified: RwLock<bool>,
    autopair: RwLock<bool>,
    mavlink_port: RwLock<u16>,
    download_bandwidth: RwLock<i64>,
    streaming_priority: RwLock<i32>,
    local_ip: RwLock<String>,
    events: RwLock<Option<DriverEventSender>>,
    running: RwLock<bool>,
}

pub struct IpDriver {
    name: String,
    state: Arc<IpDriverState>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl IpDriver {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Arc::new(IpDriverState {
                instance: RwLock::new(name.to_string()),
                prefix: RwLock::new(String::new()),
                ip_status: RwLock::new(false),
                simplified: RwLock::new(true),
                autopair: RwLock::new(false),
                mavlink_port: RwLock::new(0),
                download_bandwidth: RwLock::new(i64::MAX),
                streaming_priority: RwLock::new(i32::MAX),
                local_ip: RwLock::new(String::new()),
                events: RwLock::new(None),
                running: RwLock::new(false),
            }),
            worker: Mutex::new(None),
        }
    }

    fn poll_once(state: &IpDriverState) {
        let prefix = state.prefix.read().unwrap().clone();
        let found = util::local_ipv4_addresses()
            .into_iter()
            .map(|ip| ip.to_string())
            .find(|ip| util::ip_matches(ip, &prefix));

        let events = state.events.read().unwrap().clone();
        let events = match events {
            Some(e) => e,
            None => return,
        };

        match found {
            Some(ip) => {
                let changed = {
                    let mut current = state.local_ip.write().unwrap();
                    let changed = *current != ip;
                    *current = ip.clone();
                    changed
                };
                let code = if *state.ip_status.read().unwrap() {
                    StatusCode::DriverWiredConnected
                } else {
                    StatusCode::DriverConnected
                };
                events.report_status(code);
                if changed {
                    events.report_telemetry(json!({"ip": ip}));
                }
            }
            None => {
                state.local_ip.write().unwrap().clear();
                events.report_status(StatusCode::DriverNotConnected);
            }
        }
    }
}

impl ConnectionDriver for IpDriver {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn instance(&self) -> String {
        self.state.instance.read().unwrap().clone()
    }

    fn init(&self, config: &DriverConfig, events: DriverEventSender) -> Result<(), String> {
        let prefix = config.ip.clone().unwrap_or_default();
        if prefix.is_empty() {
            return Err(format!("driver {} requires an 'ip' prefix", config.instance));
        }

        *self.state.instance.write().unwrap() = config.instance.clone();
        *self.state.prefix.write().unwrap() = prefix;
        *self.state.ip_status.write().unwrap() = config.ip_status;
        *self.state.simplified.write().unwrap() = config.simplified;
        *self.state.autopair.write().unwrap() = config.autopair;
        *self.state.mavlink_port.write().unwrap() =
            if config.mavlink { config.mavlink_port } else { 0 };
        *self.state.download_bandwidth.write().unwrap() = config.download_bandwidth;
        *self.state.streaming_priority.write().unwrap() = config.streaming_priority;
        *self.state.events.write().unwrap() = Some(events);
        *self.state.running.write().unwrap() = true;

        let state = Arc::clone(&self.state);
        let handle = thread::spawn(move || {
            while *state.running.read().unwrap() {
                IpDriver::poll_once(&state);
                thread::sleep(Duration::from_millis(POLL_PERIOD_MS));
            }
        });
        *self.worker.lock().unwrap() = Some(handle);

        // first report without waiting a poll period
        IpDriver::poll_once(&self.state);
        Ok(())
    }

    fn configure(&self, params: &Map<String, Value>) -> Result<(), String> {
        // interface links have no radio parameters; a new prefix is the only
        // thing that can change at runtime
        if let Some(ip) = params.get("ip").and_then(|v| v.as_str()) {
            *self.state.prefix.write().unwrap() = ip.to_string();
        }
        Ok(())
    }

    fn stop(&self) {
        {
            let mut running = self.state.running.write().unwrap();
            if !*running {
                return;
            }
            *running = false;
        }
        if let Some(handle) = self.worker.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    fn get_broadcast_info(&self) -> Option<Map<String, Value>> {
        let ip = self.state.local_ip.read().unwrap().clone();
        if ip.is_empty() {
            return None;
        }
        let mut info = Map::new();
        info.insert("ip".to_string(), Value::String(ip));
        Some(info)
    }

    fn get_local_ip(&self) -> String {
        self.state.local_ip.read().unwrap().clone()
    }

    fn get_ip(&self) -> String {
        self.state.prefix.read().unwrap().clone()
    }

    fn set_ip(&self, ip: &str) {
        *self.state.prefix.write().unwrap() = ip.to_string();
    }

    fn get_pairing_settings(&self) -> Map<String, Value> {
        Map::new()
    }

    fn get_connection_settings(&self) -> Option<Map<String, Value>> {
        None
    }

    fn report_wired_status(&self) -> bool {
        *self.state.ip_status.read().unwrap()
    }

    fn simplified(&self) -> bool {
        *self.state.simplified.read().unwrap()
    }

    fn autopair(&self) -> bool {
        *self.state.autopair.read().unwrap()
    }

    fn mavlink_port(&self) -> u16 {
        *self.state.mavlink_port.read().unwrap()
    }

    fn download_bandwidth(&self) -> i64 {
        *self.state.download_bandwidth.read().unwrap()
    }

    fn streaming_priority(&self) -> i32 {
        *self.state.streaming_priority.read().unwrap()
    }
}

impl Drop for IpDriver {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::DriverEvent;
    use crossbeam_channel::unbounded;
    use serde_json::json;

    fn loopback_config(instance: &str, prefix: &str) -> DriverConfig {
        serde_json::from_value(json!({
            "name": "WIFI",
            "instance": instance,
            "ip": prefix,
            "simplified": false
        }))
        .unwrap()
    }

    #[test]
    fn test_reports_connected_on_loopback() {
        let driver = IpDriver::new("WIFI");
        let (tx, rx) = unbounded();
        driver
            .init(&loopback_config("WIFI", "127.0.0"), DriverEventSender::new("WIFI", tx))
            .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        match event {
            DriverEvent::Status { instance, code } => {
                assert_eq!(instance, "WIFI");
                assert_eq!(code, StatusCode::DriverConnected);
            }
            _ => panic!("expected status"),
        }
        // the address is reported as telemetry once it is known
        let event = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        match event {
            DriverEvent::Telemetry { data, .. } => assert_eq!(data["ip"], "127.0.0.1"),
            _ => panic!("expected telemetry"),
        }
        assert_eq!(driver.get_local_ip(), "127.0.0.1");
        assert!(driver.get_broadcast_info().unwrap()["ip"] == "127.0.0.1");
        driver.stop();
        driver.stop();
    }

    #[test]
    fn test_never_present_prefix() {
        let driver = IpDriver::new("WIFI");
        let (tx, rx) = unbounded();
        // TEST-NET-3, never assigned locally
        driver
            .init(&loopback_config("WIFI", "203.0.113"), DriverEventSender::new("WIFI", tx))
            .unwrap();

        let event = rx.recv_timeout(Duration::from_secs(3)).unwrap();
        match event {
            DriverEvent::Status { code, .. } => assert_eq!(code, StatusCode::DriverNotConnected),
            _ => panic!("expected status"),
        }
        assert!(driver.get_broadcast_info().is_none());
        driver.stop();
    }

    #[test]
    fn test_missing_prefix_rejected() {
        let driver = IpDriver::new("WIFI");
        let (tx, _rx) = unbounded();
        let config: DriverConfig = serde_json::from_value(json!({"name": "WIFI"})).unwrap();
        assert!(driver.init(&config, DriverEventSender::new("WIFI", tx)).is_err());
    }
}
