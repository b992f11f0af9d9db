// src/slave.rs
// Slave connection manager: the responder side (typically a vehicle).
// Broadcasts presence, answers pairing and connection requests from a
// master, then keeps the session alive with periodic status frames.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ParamSection;
use crate::fsm::{StateMachine, Transition};
use crate::link::{DEFAULT_MASTER_PORT, DEFAULT_SLAVE_PORT};
use crate::manager::{ListChangedCallback, ManagerCore, StatusCallback, TelemetryCallback};
use crate::protocol::{
    BroadcastInfo, ConnectRequest, ConnectResponse, DriverBroadcast, DriverEndpoint, Exchange,
    PairRequest, PairResponse, ReconfigureResponse, StatusInfo, Verb,
};
use crate::status::StatusCode;
use crate::store::PairedRecord;
use crate::util;

const SM_TICK_MS: u64 = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum SlaveState {
    Idle,
    Broadcast,
    ConfigConnect,
    Connected,
    Reconfigure,
    Reconfiguring,
}

#[derive(Default)]
struct SlaveIntents {
    pairing_mode: bool,
    stop_pairing: bool,
    disconnect: bool,
}

/// Requests latched by the receive path for the state machine to act on.
#[derive(Default)]
struct Pending {
    pair: Option<(String, PairRequest, SocketAddr)>,
    connect: Option<(String, ConnectRequest, SocketAddr)>,
    reconfigure: Option<(String, Value, SocketAddr)>,
}

struct SlaveInner {
    core: ManagerCore,
    remote_port: u16,
    fsm: Mutex<StateMachine<SlaveState>>,
    intents: Mutex<SlaveIntents>,
    pending: Mutex<Pending>,

    master_name: Mutex<String>,
    master_addr: Mutex<Option<SocketAddr>>,
    /// Last time the master was heard per local driver instance.
    master_seen: Mutex<HashMap<String, Instant>>,

    last_broadcast: Mutex<Instant>,
    last_status_sent: Mutex<Instant>,
    config_connect_entered: Mutex<Instant>,
    reconfigure_started: Mutex<Instant>,

    sm_wake: Mutex<bool>,
    sm_wake_cv: Condvar,
}

/// The responder side of a deployment. Construct, register callbacks,
/// `start()`; pairing acceptance is armed with `enter_pairing_mode()`.
pub struct SlaveManager {
    inner: Arc<SlaveInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
}

fn slave_table() -> StateMachine<SlaveState> {
    StateMachine::new(SlaveState::Idle)
        .on(SlaveState::Idle, Transition::Next1, SlaveState::Broadcast)
        .on(SlaveState::Idle, Transition::Error, SlaveState::Idle)
        .on(SlaveState::Broadcast, Transition::Next1, SlaveState::ConfigConnect)
        .on(SlaveState::Broadcast, Transition::Error, SlaveState::Idle)
        .on(SlaveState::ConfigConnect, Transition::Next1, SlaveState::Connected)
        .on(SlaveState::ConfigConnect, Transition::Error, SlaveState::Idle)
        .on(SlaveState::Connected, Transition::Next2, SlaveState::Reconfigure)
        .on(SlaveState::Connected, Transition::Error, SlaveState::Idle)
        .on(SlaveState::Reconfigure, Transition::Next1, SlaveState::Reconfiguring)
        .on(SlaveState::Reconfigure, Transition::Error, SlaveState::Idle)
        .on(SlaveState::Reconfiguring, Transition::Next1, SlaveState::Connected)
        .on(SlaveState::Reconfiguring, Transition::Error, SlaveState::Idle)
}

impl SlaveManager {
    pub fn new(configuration: &str) -> Result<Self, String> {
        let core = ManagerCore::new(configuration, DEFAULT_SLAVE_PORT)?;
        let remote_port = core.config.read().unwrap().remote_port.unwrap_or(DEFAULT_MASTER_PORT);
        let now = Instant::now();
        let inner = Arc::new(SlaveInner {
            core,
            remote_port,
            fsm: Mutex::new(slave_table()),
            intents: Mutex::new(SlaveIntents::default()),
            pending: Mutex::new(Pending::default()),
            master_name: Mutex::new(String::new()),
            master_addr: Mutex::new(None),
            master_seen: Mutex::new(HashMap::new()),
            last_broadcast: Mutex::new(now - Duration::from_secs(3600)),
            last_status_sent: Mutex::new(now - Duration::from_secs(3600)),
            config_connect_entered: Mutex::new(now),
            reconfigure_started: Mutex::new(now),
            sm_wake: Mutex::new(false),
            sm_wake_cv: Condvar::new(),
        });
        Ok(Self { inner, workers: Mutex::new(Vec::new()), started: Mutex::new(false) })
    }

    pub fn register_status_callback(&self, callback: StatusCallback) {
        self.inner.core.register_status_callback(callback);
    }

    pub fn register_telemetry_callback(&self, callback: TelemetryCallback) {
        self.inner.core.register_telemetry_callback(callback);
    }

    pub fn register_paired_list_changed_callback(&self, callback: ListChangedCallback) {
        self.inner.core.register_paired_list_changed_callback(callback);
    }

    pub fn start(&self) -> Result<(), String> {
        let mut started = self.started.lock().unwrap();
        if *started {
            return Ok(());
        }

        self.inner.core.init_drivers()?;

        let weak = Arc::downgrade(&self.inner);
        self.inner.core.link.register_message_callback(Arc::new(move |msg, from| {
            if let Some(inner) = weak.upgrade() {
                inner.message_received(msg, from);
            }
        }));
        self.inner.core.link.init()?;

        let mut workers = self.workers.lock().unwrap();

        let pump = Arc::clone(&self.inner);
        workers.push(thread::spawn(move || {
            let hook_inner = Arc::clone(&pump);
            pump.core.pump_events(move |_, _| hook_inner.wake());
        }));

        let sm = Arc::clone(&self.inner);
        workers.push(thread::spawn(move || sm.state_machine_worker()));

        *started = true;
        Ok(())
    }

    pub fn stop(&self) {
        {
            let mut started = self.started.lock().unwrap();
            if !*started {
                self.inner.core.stop();
                return;
            }
            *started = false;
        }
        self.inner.core.should_exit.store(true, Ordering::SeqCst);
        self.inner.wake();
        self.inner.core.stop();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }

    /// Arm pairing: configure the pairing sections and start broadcasting.
    pub fn enter_pairing_mode(&self) {
        self.inner.intents.lock().unwrap().pairing_mode = true;
        self.inner.wake();
    }

    pub fn stop_pairing(&self) {
        let mut intents = self.inner.intents.lock().unwrap();
        intents.stop_pairing = true;
        intents.pairing_mode = false;
        drop(intents);
        self.inner.wake();
    }

    pub fn get_paired_list(&self) -> Vec<String> {
        self.inner.core.store.paired_names()
    }

    pub fn get_last_connected(&self) -> String {
        self.inner.core.store.last_connected()
    }

    pub fn report_wired_status(&self, instance: &str) -> bool {
        self.inner.core.report_wired_status(instance)
    }

    pub fn connected_master(&self) -> Option<String> {
        if self.inner.fsm.lock().unwrap().state() == SlaveState::Connected {
            let name = self.inner.master_name.lock().unwrap().clone();
            if !name.is_empty() {
                return Some(name);
            }
        }
        None
    }
}

impl Drop for SlaveManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl SlaveInner {
    fn wake(&self) {
        let mut fired = self.sm_wake.lock().unwrap();
        *fired = true;
        self.sm_wake_cv.notify_all();
    }

    // ---- inbound frames ----

    fn message_received(&self, msg: &str, from: SocketAddr) {
        let opened = match self.core.open_frame(msg) {
            Some(o) => o,
            None => return,
        };
        let name = opened.frame.machine_name.clone();

        match &opened.frame.verb {
            Verb::Pair(Exchange::Request(request)) => {
                let rsa_on = self.core.config.read().unwrap().rsa_encryption;
                if rsa_on && !opened.verified && !request.public_key.is_empty() {
                    log::debug!("unverified pair request from {}", name);
                    return;
                }
                if !self.pair_request_allowed(request) {
                    log::debug!("rejecting pair request from {}", name);
                    return;
                }
                self.pending.lock().unwrap().pair = Some((name, request.clone(), from));
                self.wake();
            }
            Verb::Connect(Exchange::Request(request)) => {
                if !self.core.frame_acceptable(&opened) || !self.core.store.is_paired(&name) {
                    log::debug!("rejecting connect request from {}", name);
                    return;
                }
                self.pending.lock().unwrap().connect = Some((name, request.clone(), from));
                self.wake();
            }
            Verb::Reconfigure(Exchange::Request(request)) => {
                if !self.core.frame_acceptable(&opened) || name != *self.master_name.lock().unwrap()
                {
                    return;
                }
                self.pending.lock().unwrap().reconfigure =
                    Some((name, request.params.clone(), from));
                self.wake();
            }
            Verb::Status(status) => {
                if !self.core.frame_acceptable(&opened) || name != *self.master_name.lock().unwrap()
                {
                    return;
                }
                *self.master_addr.lock().unwrap() = Some(from);
                self.master_seen.lock().unwrap().insert(status.instance.clone(), Instant::now());
                self.wake();
            }
            Verb::Disconnect(_) => {
                if !self.core.frame_acceptable(&opened) || name != *self.master_name.lock().unwrap()
                {
                    return;
                }
                self.intents.lock().unwrap().disconnect = true;
                self.wake();
            }
            _ => {
                log::debug!("slave ignoring frame from {}", name);
            }
        }
    }

    /// Password gate for inbound pair requests. Autopair drivers accept
    /// unconditionally; anything else must present the configured password.
    fn pair_request_allowed(&self, request: &PairRequest) -> bool {
        let config = self.core.config.read().unwrap().clone();
        for driver_config in &config.drivers {
            let password = match &driver_config.password {
                Some(p) if !p.is_empty() => p,
                _ => continue,
            };
            let autopair = self
                .core
                .driver(&driver_config.instance)
                .map(|d| d.autopair())
                .unwrap_or(driver_config.autopair);
            if autopair {
                continue;
            }
            let offered = request
                .drivers
                .get(&driver_config.instance)
                .and_then(|v| v.get("password"))
                .and_then(|v| v.as_str())
                .or(request.password.as_deref());
            if offered != Some(password.as_str()) {
                return false;
            }
        }
        true
    }

    // ---- state machine ----

    fn state_machine_worker(self: Arc<Self>) {
        while !self.core.should_exit.load(Ordering::SeqCst) {
            let state = self.fsm.lock().unwrap().state();
            let transition = self.run_state(state);
            if let Some((old, new)) = self.fsm.lock().unwrap().apply(transition) {
                log::debug!("slave: {:?} --{}--> {:?}", old, transition.name(), new);
                if new == SlaveState::ConfigConnect {
                    *self.config_connect_entered.lock().unwrap() = Instant::now();
                }
            }
            if transition == Transition::Repeat {
                let mut fired = self.sm_wake.lock().unwrap();
                if !*fired {
                    let (guard, _) = self
                        .sm_wake_cv
                        .wait_timeout(fired, Duration::from_millis(SM_TICK_MS))
                        .unwrap();
                    fired = guard;
                }
                *fired = false;
            }
        }
    }

    fn run_state(&self, state: SlaveState) -> Transition {
        match state {
            SlaveState::Idle => self.run_idle(),
            SlaveState::Broadcast => self.run_broadcast(),
            SlaveState::ConfigConnect => self.run_config_connect(),
            SlaveState::Connected => self.run_connected(),
            SlaveState::Reconfigure => self.run_reconfigure(),
            SlaveState::Reconfiguring => self.run_reconfiguring(),
        }
    }

    fn run_idle(&self) -> Transition {
        {
            let mut intents = self.intents.lock().unwrap();
            intents.stop_pairing = false;
            intents.disconnect = false;
        }
        self.master_seen.lock().unwrap().clear();
        // requests latched for an earlier session are stale here
        *self.pending.lock().unwrap() = Pending::default();

        if self.intents.lock().unwrap().pairing_mode {
            self.core.report_status(StatusCode::ConfigureForPairing, "");
            if self.core.configure_drivers(ParamSection::Pairing, None).is_err() {
                self.intents.lock().unwrap().pairing_mode = false;
                return Transition::Error;
            }
            self.core.enter_pairing_mode_drivers();
            let timeout = self.core.timing.driver_configure_timeout;
            let ok = self
                .core
                .wait_drivers_connected(timeout, || self.intents.lock().unwrap().stop_pairing);
            if !ok {
                if !self.intents.lock().unwrap().stop_pairing {
                    self.core.report_status(StatusCode::ErrorDriverTimeout, "");
                }
                self.intents.lock().unwrap().pairing_mode = false;
                return Transition::Error;
            }
            self.core.report_status(StatusCode::PairingIdle, "");
            return Transition::Next1;
        }

        // paired with autoconnect: come up connectable without an operator
        let autoconnect = self
            .core
            .store
            .paired_names()
            .iter()
            .any(|n| self.core.store.autoconnect(n));
        if autoconnect {
            if self.core.configure_drivers(ParamSection::Connection, None).is_err() {
                return Transition::Repeat;
            }
            let timeout = self.core.timing.driver_configure_timeout;
            if !self.core.wait_drivers_connected(timeout, || false) {
                return Transition::Repeat;
            }
            return Transition::Next1;
        }

        Transition::Repeat
    }

    fn run_broadcast(&self) -> Transition {
        if self.intents.lock().unwrap().stop_pairing {
            self.core.report_status(StatusCode::Idle, "");
            return Transition::Error;
        }

        if let Some((name, request, from)) = self.pending.lock().unwrap().pair.take() {
            self.accept_pair_request(&name, &request, from);
            return Transition::Next1;
        }
        if self.pending.lock().unwrap().connect.is_some() {
            // already paired with this master; handle it in config-connect
            return Transition::Next1;
        }

        self.broadcast_if_due();
        Transition::Repeat
    }

    fn accept_pair_request(&self, name: &str, request: &PairRequest, from: SocketAddr) {
        self.core.report_status(StatusCode::Pairing, name);

        self.core.add_paired(PairedRecord {
            name: name.to_string(),
            public_key: request.public_key.clone(),
            autoconnect: true,
            drivers: Map::new(),
            extra: Map::new(),
        });
        *self.master_name.lock().unwrap() = name.to_string();
        *self.master_addr.lock().unwrap() = Some(from);

        // answer with our identity; parameters are accepted as offered
        let public_key = if request.public_key.is_empty() {
            String::new()
        } else {
            self.core.own_public_key_pem()
        };
        let mut accepted = request.drivers.clone();
        for value in accepted.values_mut() {
            if let Some(obj) = value.as_object_mut() {
                obj.remove("password");
            }
        }
        let response = PairResponse { public_key, accepted };
        match self.core.seal_frame(Verb::Pair(Exchange::Response(response)), Some(name)) {
            Ok(wire) => {
                let _ = self.core.link.send_to(&wire, from);
            }
            Err(e) => log::debug!("cannot seal pair response: {}", e),
        }
    }

    fn run_config_connect(&self) -> Transition {
        if self.intents.lock().unwrap().disconnect {
            return Transition::Error;
        }

        let pending = self.pending.lock().unwrap().connect.take();
        if let Some((name, request, from)) = pending {
            self.core.report_status(StatusCode::ConfigureForConnecting, &name);

            // adopt the master's connection parameters before applying
            {
                let mut config = self.core.config.write().unwrap();
                for (instance, params) in &request.drivers {
                    if let (Some(driver), Value::Object(map)) =
                        (config.driver_mut(instance), params)
                    {
                        let mut merged = Value::Object(driver.connection.clone());
                        crate::util::deep_merge(&mut merged, &Value::Object(map.clone()));
                        if let Value::Object(merged) = merged {
                            driver.connection = merged;
                        }
                    }
                }
            }
            if self.core.configure_drivers(ParamSection::Connection, None).is_err() {
                self.core.report_status(StatusCode::ErrorConnecting, &name);
                return Transition::Error;
            }
            let timeout = self.core.timing.driver_configure_timeout;
            if !self.core.wait_drivers_connected(timeout, || false) {
                self.core.report_status(StatusCode::ErrorConnecting, &name);
                return Transition::Error;
            }

            self.core.report_status(StatusCode::Connecting, &name);
            let response = ConnectResponse { drivers: self.local_endpoints() };
            match self.core.seal_frame(Verb::Connect(Exchange::Response(response)), Some(&name)) {
                Ok(wire) => {
                    let _ = self.core.link.send_to(&wire, from);
                }
                Err(e) => log::debug!("cannot seal connect response: {}", e),
            }

            *self.master_name.lock().unwrap() = name.to_string();
            *self.master_addr.lock().unwrap() = Some(from);
            {
                let mut seen = self.master_seen.lock().unwrap();
                seen.clear();
                seen.insert(String::new(), Instant::now());
            }
            self.core.store.set_last_connected(&name);
            self.core.report_status(StatusCode::Connected, &name);
            return Transition::Next1;
        }

        // waiting for the connect request; keep announcing so the master can
        // reach us on the new parameters
        self.broadcast_if_due();

        let timeout = Duration::from_millis(self.core.timing.driver_configure_timeout);
        if self.config_connect_entered.lock().unwrap().elapsed() >= timeout {
            self.core.report_status(StatusCode::ErrorConnecting, "");
            return Transition::Error;
        }
        Transition::Repeat
    }

    fn run_connected(&self) -> Transition {
        if self.intents.lock().unwrap().disconnect {
            self.disconnected();
            return Transition::Error;
        }
        if self.pending.lock().unwrap().reconfigure.is_some() {
            return Transition::Next2;
        }
        if self.pending.lock().unwrap().connect.is_some() {
            // master re-issued a connect (e.g. after it restarted): answer
            // again without dropping the session
            let pending = self.pending.lock().unwrap().connect.take();
            if let Some((name, _request, from)) = pending {
                let response = ConnectResponse { drivers: self.local_endpoints() };
                if let Ok(wire) =
                    self.core.seal_frame(Verb::Connect(Exchange::Response(response)), Some(&name))
                {
                    let _ = self.core.link.send_to(&wire, from);
                }
            }
        }

        if self.master_silent() {
            self.disconnected();
            return Transition::Error;
        }

        self.send_status_if_due();
        Transition::Repeat
    }

    fn run_reconfigure(&self) -> Transition {
        let (name, params, from) = match self.pending.lock().unwrap().reconfigure.take() {
            Some(p) => p,
            None => return Transition::Error,
        };

        self.core.report_status(StatusCode::Reconfiguring, &name);

        // acknowledge before retuning; the master watches for our status
        // frames reappearing on the new parameters
        let response = ReconfigureResponse { accepted: true };
        if let Ok(wire) =
            self.core.seal_frame(Verb::Reconfigure(Exchange::Response(response)), Some(&name))
        {
            let _ = self.core.link.send_to(&wire, from);
        }

        let changed = self.core.config.write().unwrap().merge_driver_params(&params, false);
        if !changed.is_empty() {
            let subset: HashSet<String> = changed.into_iter().collect();
            if self.core.configure_drivers(ParamSection::Connection, Some(&subset)).is_err() {
                self.core.report_status(StatusCode::ErrorReconfiguring, &name);
                return Transition::Error;
            }
        }

        *self.reconfigure_started.lock().unwrap() = Instant::now();
        self.master_seen.lock().unwrap().clear();
        Transition::Next1
    }

    fn run_reconfiguring(&self) -> Transition {
        // keep the master fed with status so it can confirm us
        if self.core.all_drivers_connected() {
            self.send_status_if_due();
        }

        let started = *self.reconfigure_started.lock().unwrap();
        let master_back = {
            let seen = self.master_seen.lock().unwrap();
            seen.values().any(|at| *at > started)
        };
        if master_back {
            self.core.report_status(StatusCode::Reconfigured, &self.master_name.lock().unwrap());
            return Transition::Next1;
        }

        let timeout = Duration::from_millis(self.core.timing.reconfiguration_timeout);
        if started.elapsed() >= timeout {
            self.core.report_status(StatusCode::ErrorReconfiguring, "");
            self.disconnected();
            return Transition::Error;
        }
        Transition::Repeat
    }

    fn disconnected(&self) {
        let name = self.master_name.lock().unwrap().clone();
        self.core.report_status(StatusCode::Disconnected, &name);
        self.master_name.lock().unwrap().clear();
        *self.master_addr.lock().unwrap() = None;
        self.master_seen.lock().unwrap().clear();
    }

    fn master_silent(&self) -> bool {
        let timeout = Duration::from_millis(self.core.timing.status_timeout);
        let seen = self.master_seen.lock().unwrap();
        if seen.is_empty() {
            return false;
        }
        let now = Instant::now();
        seen.values().all(|at| now.duration_since(*at) > timeout)
    }

    fn broadcast_if_due(&self) {
        let period = Duration::from_millis(self.core.timing.broadcast_period);
        {
            let mut last = self.last_broadcast.lock().unwrap();
            if last.elapsed() < period {
                return;
            }
            *last = Instant::now();
        }

        let info = self.compose_broadcast_info();
        if info.drivers.is_empty() {
            return;
        }
        match self.core.seal_frame(Verb::Broadcast(info), None) {
            Ok(wire) => {
                if let Err(e) = self.core.link.send_broadcast(&wire, self.remote_port) {
                    log::debug!("broadcast failed: {}", e);
                }
            }
            Err(e) => log::debug!("cannot seal broadcast: {}", e),
        }
    }

    fn compose_broadcast_info(&self) -> BroadcastInfo {
        let ethernet_fallback = {
            let device = self.core.config.read().unwrap().ethernet_device.clone();
            util::interface_ipv4(&device).map(|ip| ip.to_string()).unwrap_or_default()
        };
        let mut info = BroadcastInfo::default();
        for driver in &self.core.drivers {
            if let Some(extra) = driver.get_broadcast_info() {
                let mut ip = extra
                    .get("ip")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| driver.get_local_ip());
                if ip.is_empty() {
                    ip = ethernet_fallback.clone();
                }
                info.drivers.push(DriverBroadcast {
                    name: driver.name(),
                    instance: driver.instance(),
                    ip,
                    info: extra,
                });
            }
        }
        info
    }

    fn local_endpoints(&self) -> Vec<DriverEndpoint> {
        self.core
            .drivers
            .iter()
            .map(|driver| DriverEndpoint {
                instance: driver.instance(),
                ip: driver.get_local_ip(),
                mavlink_port: driver.mavlink_port(),
            })
            .filter(|e| !e.ip.is_empty())
            .collect()
    }

    fn send_status_if_due(&self) {
        let period = Duration::from_millis(self.core.timing.status_period);
        {
            let mut last = self.last_status_sent.lock().unwrap();
            if last.elapsed() < period {
                return;
            }
            *last = Instant::now();
        }

        let name = self.master_name.lock().unwrap().clone();
        let addr = *self.master_addr.lock().unwrap();
        let addr = match addr {
            Some(a) => a,
            None => return,
        };

        let instances: Vec<String> = {
            let status = self.core.driver_status.lock().unwrap();
            self.core
                .drivers
                .iter()
                .map(|d| d.instance())
                .filter(|i| status.get(i).map(|c| c.is_driver_connected()).unwrap_or(false))
                .collect()
        };
        for instance in instances {
            let verb = Verb::Status(StatusInfo { instance });
            match self.core.seal_frame(verb, Some(&name)) {
                Ok(wire) => {
                    let _ = self.core.link.send_to(&wire, addr);
                }
                Err(e) => log::debug!("cannot seal status frame: {}", e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;
    use serde_json::json;

    fn temp_file(tag: &str) -> String {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let name: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        std::env::temp_dir()
            .join(format!("pairlink-{}-{}.json", tag, name))
            .to_string_lossy()
            .into_owned()
    }

    fn slave_config(store: &str, password: Option<&str>) -> String {
        let mut driver = json!({
            "name": "WIFI",
            "ip": "127.0.0",
            "simplified": false
        });
        if let Some(password) = password {
            driver["password"] = json!(password);
        }
        json!({
            "machine_name": "TestVehicle",
            "encryption_key": "1234567890",
            "configuration_file": store,
            "aes_encryption": false,
            "rsa_encryption": true,
            "port": 0,
            "timing": {"broadcast_period": 150, "status_period": 150, "status_timeout": 900},
            "drivers": [driver]
        })
        .to_string()
    }

    #[test]
    fn test_password_gate() {
        let store = temp_file("slave-pw");
        let slave = SlaveManager::new(&slave_config(&store, Some("skylinkfct"))).unwrap();

        let mut drivers = Map::new();
        drivers.insert("WIFI".to_string(), json!({"password": "skylinkfct", "channel": "36"}));
        let good = PairRequest { public_key: String::new(), password: None, drivers };
        assert!(slave.inner.pair_request_allowed(&good));

        let mut drivers = Map::new();
        drivers.insert("WIFI".to_string(), json!({"password": "wrong"}));
        let bad = PairRequest { public_key: String::new(), password: None, drivers };
        assert!(!slave.inner.pair_request_allowed(&bad));

        let none = PairRequest { public_key: String::new(), password: None, drivers: Map::new() };
        assert!(!slave.inner.pair_request_allowed(&none));
        let _ = std::fs::remove_file(&store);
    }

    #[test]
    fn test_no_password_accepts_any() {
        let store = temp_file("slave-nopw");
        let slave = SlaveManager::new(&slave_config(&store, None)).unwrap();
        let request =
            PairRequest { public_key: String::new(), password: None, drivers: Map::new() };
        assert!(slave.inner.pair_request_allowed(&request));
        let _ = std::fs::remove_file(&store);
    }

    #[test]
    fn test_stop_without_start() {
        let store = temp_file("slave-stop");
        let slave = SlaveManager::new(&slave_config(&store, None)).unwrap();
        slave.stop();
        slave.stop();
        let _ = std::fs::remove_file(&store);
    }
}
