// src/manager.rs
// Shared machinery of the master and slave connection managers: validated
// configuration, crypto, the pairing store, the driver collection with its
// event pump, and the envelope around every outbound/inbound frame.

use crossbeam_channel::{unbounded, Receiver, Sender};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::time::{Duration, Instant};

use crate::config::{ManagerConfig, ParamSection, Timing};
use crate::crypto::{AesCipher, RsaKeys, DEFAULT_SALT};
use crate::driver::{ConnectionDriver, DriverEvent, DriverEventSender, DriverRegistry};
use crate::link::UdpLink;
use crate::protocol::{Frame, OpenedFrame, ReplayGuard, SeqCounter, Verb};
use crate::status::{ConnectionStatus, StatusCode};
use crate::store::{PairedRecord, PairingStore};

pub type StatusCallback = Arc<dyn Fn(ConnectionStatus) + Send + Sync>;
pub type ListChangedCallback = Arc<dyn Fn() + Send + Sync>;
pub type ConnectedCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type TelemetryCallback = Arc<dyn Fn(&str, &Value) + Send + Sync>;

const PUMP_POLL_MS: u64 = 200;
const WAIT_SLICE_MS: u64 = 50;

pub struct ManagerCore {
    pub config: RwLock<ManagerConfig>,
    pub machine_name: String,
    pub timing: Timing,
    pub store: PairingStore,
    pub link: UdpLink,
    pub drivers: Vec<Box<dyn ConnectionDriver>>,
    pub seq: SeqCounter,
    pub replay: ReplayGuard,
    pub should_exit: Arc<AtomicBool>,

    aes: Option<AesCipher>,
    rsa: RsaKeys,
    remote_rsa: Mutex<HashMap<String, RsaKeys>>,

    driver_events_tx: Sender<DriverEvent>,
    driver_events_rx: Receiver<DriverEvent>,
    pub driver_status: Mutex<HashMap<String, StatusCode>>,
    pub driver_status_cv: Condvar,

    status_callback: RwLock<Option<StatusCallback>>,
    telemetry_callback: RwLock<Option<TelemetryCallback>>,
    paired_list_changed: RwLock<Option<ListChangedCallback>>,
    last_reported: Mutex<Option<ConnectionStatus>>,

    drivers_stopped: AtomicBool,
}

impl ManagerCore {
    /// Parse and validate the configuration, load the pairing store (creating
    /// our RSA identity if needed) and instantiate the configured drivers.
    /// Nothing is started yet.
    pub fn new(configuration: &str, default_port: u16) -> Result<Self, String> {
        let config = ManagerConfig::parse(configuration)?;

        let aes = if config.encryption_key.is_empty() {
            None
        } else {
            Some(AesCipher::new(&config.encryption_key, DEFAULT_SALT, true))
        };

        let (store, rsa) =
            PairingStore::load_or_create(Path::new(&config.configuration_file), &config.machine_name)?;

        let port = config.port.unwrap_or(default_port);
        let link = UdpLink::new(port, &config.multicast_ip);

        let registry = DriverRegistry::with_builtin();
        let mut drivers: Vec<Box<dyn ConnectionDriver>> = Vec::new();
        for driver_config in &config.drivers {
            let driver = registry
                .create(&driver_config.name)
                .ok_or_else(|| format!("unknown driver '{}'", driver_config.name))?;
            drivers.push(driver);
        }

        let (driver_events_tx, driver_events_rx) = unbounded();

        Ok(Self {
            machine_name: config.machine_name.clone(),
            timing: config.timing.clone(),
            store,
            link,
            drivers,
            seq: SeqCounter::new(),
            replay: ReplayGuard::new(),
            should_exit: Arc::new(AtomicBool::new(false)),
            aes,
            rsa,
            remote_rsa: Mutex::new(HashMap::new()),
            driver_events_tx,
            driver_events_rx,
            driver_status: Mutex::new(HashMap::new()),
            driver_status_cv: Condvar::new(),
            status_callback: RwLock::new(None),
            telemetry_callback: RwLock::new(None),
            paired_list_changed: RwLock::new(None),
            last_reported: Mutex::new(None),
            drivers_stopped: AtomicBool::new(false),
            config: RwLock::new(config),
        })
    }

    pub fn register_status_callback(&self, callback: StatusCallback) {
        *self.status_callback.write().unwrap() = Some(callback);
    }

    pub fn register_telemetry_callback(&self, callback: TelemetryCallback) {
        *self.telemetry_callback.write().unwrap() = Some(callback);
    }

    pub fn register_paired_list_changed_callback(&self, callback: ListChangedCallback) {
        *self.paired_list_changed.write().unwrap() = Some(callback);
    }

    /// Bring up every configured driver and apply its `local` section.
    /// Drivers were created in configuration order, so the two line up.
    pub fn init_drivers(&self) -> Result<(), String> {
        let config = self.config.read().unwrap().clone();
        for (driver, driver_config) in self.drivers.iter().zip(config.drivers.iter()) {
            let events = DriverEventSender::new(&driver_config.instance, self.driver_events_tx.clone());
            driver.init(driver_config, events)?;
            if !driver_config.local.is_empty() {
                driver.configure(&driver_config.local)?;
            }
        }
        Ok(())
    }

    /// Drain driver events until shutdown. Runs on a dedicated pump thread;
    /// callbacks are invoked here, never while a lock is held.
    pub fn pump_events<F>(&self, hook: F)
    where
        F: Fn(&str, StatusCode),
    {
        while !self.should_exit.load(Ordering::SeqCst) {
            match self.driver_events_rx.recv_timeout(Duration::from_millis(PUMP_POLL_MS)) {
                Ok(DriverEvent::Status { instance, code }) => {
                    {
                        let mut status = self.driver_status.lock().unwrap();
                        status.insert(instance.clone(), code);
                    }
                    self.driver_status_cv.notify_all();
                    self.report_status(code, &instance);
                    hook(&instance, code);
                }
                Ok(DriverEvent::Telemetry { instance, data }) => {
                    let callback = self.telemetry_callback.read().unwrap().clone();
                    if let Some(callback) = callback {
                        callback(&instance, &data);
                    }
                }
                Err(_) => {}
            }
        }
    }

    /// Apply one parameter section to the drivers (all of them, or a subset
    /// of instances).
    pub fn configure_drivers(
        &self,
        section: ParamSection,
        subset: Option<&HashSet<String>>,
    ) -> Result<(), String> {
        let config = self.config.read().unwrap().clone();
        for driver in &self.drivers {
            let instance = driver.instance();
            if let Some(subset) = subset {
                if !subset.contains(&instance) {
                    continue;
                }
            }
            let driver_config = match config.driver(&instance) {
                Some(c) => c,
                None => continue,
            };
            let params = driver_config.section(section);
            if let Err(e) = driver.configure(params) {
                self.report_status(StatusCode::ErrorDriverConfiguration, &instance);
                return Err(e);
            }
        }
        Ok(())
    }

    pub fn enter_pairing_mode_drivers(&self) {
        for driver in &self.drivers {
            driver.enter_pairing_mode();
        }
    }

    /// Block until every driver instance reports itself connected, the
    /// timeout expires, `abort` fires, or we are shutting down.
    pub fn wait_drivers_connected<F>(&self, timeout_ms: u64, abort: F) -> bool
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let mut status = self.driver_status.lock().unwrap();
        loop {
            let all_up = self.drivers.iter().all(|d| {
                status
                    .get(&d.instance())
                    .map(|c| c.is_driver_connected())
                    .unwrap_or(false)
            });
            if all_up {
                return true;
            }
            if self.should_exit.load(Ordering::SeqCst) || abort() || Instant::now() >= deadline {
                return false;
            }
            let (guard, _) = self
                .driver_status_cv
                .wait_timeout(status, Duration::from_millis(WAIT_SLICE_MS))
                .unwrap();
            status = guard;
        }
    }

    pub fn all_drivers_connected(&self) -> bool {
        let status = self.driver_status.lock().unwrap();
        self.drivers.iter().all(|d| {
            status
                .get(&d.instance())
                .map(|c| c.is_driver_connected())
                .unwrap_or(false)
        })
    }

    pub fn driver(&self, instance: &str) -> Option<&dyn ConnectionDriver> {
        self.drivers
            .iter()
            .find(|d| d.instance() == instance)
            .map(|d| d.as_ref())
    }

    pub fn driver_instance_pairing_settings(
        &self,
        instance: &str,
    ) -> Option<serde_json::Map<String, Value>> {
        self.driver(instance).map(|d| d.get_pairing_settings())
    }

    pub fn driver_instance_connection_settings(
        &self,
        instance: &str,
    ) -> Option<serde_json::Map<String, Value>> {
        self.driver(instance).and_then(|d| d.get_connection_settings())
    }

    /// Whether the given driver wants its wired state surfaced (indicator
    /// patterns on the vehicle).
    pub fn report_wired_status(&self, instance: &str) -> bool {
        self.driver(instance).map(|d| d.report_wired_status()).unwrap_or(false)
    }

    /// All drivers are on the simplified path, so pair exchanges skip the
    /// RSA handshake entirely.
    pub fn all_drivers_simplified(&self) -> bool {
        !self.drivers.is_empty() && self.drivers.iter().all(|d| d.simplified())
    }

    pub fn own_public_key_pem(&self) -> String {
        self.rsa.public_key_pem().unwrap_or_default()
    }

    /// Cache a peer's public key; an empty PEM (simplified peers) clears it.
    pub fn add_peer_key(&self, name: &str, pem: &str) {
        let mut map = self.remote_rsa.lock().unwrap();
        if pem.is_empty() {
            map.remove(name);
            return;
        }
        match RsaKeys::from_public_pem(pem) {
            Ok(keys) => {
                map.insert(name.to_string(), keys);
            }
            Err(e) => log::debug!("ignoring invalid public key for {}: {}", name, e),
        }
    }

    pub fn peer_key(&self, name: &str) -> Option<RsaKeys> {
        {
            let map = self.remote_rsa.lock().unwrap();
            if let Some(keys) = map.get(name) {
                return Some(keys.clone());
            }
        }
        // fall back to the persisted record and cache the parsed key
        let record = self.store.get(name)?;
        if record.public_key.is_empty() {
            return None;
        }
        let keys = RsaKeys::from_public_pem(&record.public_key).ok()?;
        self.remote_rsa.lock().unwrap().insert(name.to_string(), keys.clone());
        Some(keys)
    }

    fn aes_for_wire(&self) -> Option<&AesCipher> {
        if self.config.read().unwrap().aes_encryption {
            self.aes.as_ref()
        } else {
            None
        }
    }

    /// Stamp, sign and encrypt a verb for the wire. `peer` selects the RSA
    /// recipient when we know their key.
    pub fn seal_frame(&self, verb: Verb, peer: Option<&str>) -> Result<String, String> {
        let frame = Frame::new(&self.machine_name, self.seq.next(), verb);
        let rsa_on = self.config.read().unwrap().rsa_encryption;
        let peer_keys = peer.and_then(|name| self.peer_key(name));
        crate::protocol::seal(&frame, rsa_on, &self.rsa, peer_keys.as_ref(), self.aes_for_wire())
    }

    /// Decode an inbound datagram; applies decryption, signature checking and
    /// replay protection. None means the frame was dropped.
    pub fn open_frame(&self, wire: &str) -> Option<OpenedFrame> {
        let opened =
            crate::protocol::open(wire, &self.rsa, self.aes_for_wire(), |name| self.peer_key(name))?;
        if opened.frame.machine_name == self.machine_name {
            // our own broadcast looped back
            return None;
        }
        if !self.replay.accept(&opened.frame.machine_name, opened.frame.seq) {
            log::debug!(
                "dropping replayed frame from {} (seq {})",
                opened.frame.machine_name,
                opened.frame.seq
            );
            return None;
        }
        Some(opened)
    }

    /// A frame passes the authenticity gate when RSA is off, the signature
    /// checked out, or the peer is on the keyless simplified path.
    pub fn frame_acceptable(&self, opened: &OpenedFrame) -> bool {
        if !self.config.read().unwrap().rsa_encryption || opened.verified {
            return true;
        }
        match self.store.get(&opened.frame.machine_name) {
            Some(record) => record.public_key.is_empty(),
            None => self.all_drivers_simplified(),
        }
    }

    /// Report a status to the embedder, coalescing exact repeats.
    pub fn report_status(&self, code: StatusCode, context: &str) {
        let status = ConnectionStatus::new(code, context);
        {
            let mut last = self.last_reported.lock().unwrap();
            if last.as_ref() == Some(&status) {
                return;
            }
            *last = Some(status.clone());
        }
        let callback = self.status_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(status);
        }
    }

    pub fn add_paired(&self, record: PairedRecord) {
        let name = record.name.clone();
        let key = record.public_key.clone();
        if self.store.add_or_replace(record) {
            self.add_peer_key(&name, &key);
            self.notify_paired_list_changed();
        }
    }

    pub fn remove_paired(&self, name: &str) -> bool {
        if self.store.remove(name) {
            self.remote_rsa.lock().unwrap().remove(name);
            self.replay.forget(name);
            self.notify_paired_list_changed();
            true
        } else {
            false
        }
    }

    pub fn notify_paired_list_changed(&self) {
        let callback = self.paired_list_changed.read().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    /// Stop the link layer and, exactly once, the drivers.
    pub fn stop(&self) {
        self.should_exit.store(true, Ordering::SeqCst);
        self.driver_status_cv.notify_all();
        self.link.stop();
        if !self.drivers_stopped.swap(true, Ordering::SeqCst) {
            for driver in &self.drivers {
                driver.stop();
            }
        }
    }
}
