// src/master.rs
// Master connection manager: the coordinator side (typically a ground
// station). Discovers broadcasting slaves, drives pairing and connection,
// keeps per-peer liveness and handles mid-session reconfiguration.

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ParamSection;
use crate::fsm::{StateMachine, Transition};
use crate::link::{DEFAULT_MASTER_PORT, DEFAULT_SLAVE_PORT};
use crate::manager::{ConnectedCallback, ListChangedCallback, ManagerCore, StatusCallback, TelemetryCallback};
use crate::protocol::{
    BroadcastInfo, ConnectRequest, ConnectResponse, DisconnectInfo, DriverBroadcast, Exchange,
    PairRequest, PairResponse, ReconfigureRequest, StatusInfo, Verb,
};
use crate::status::StatusCode;
use crate::store::PairedRecord;

const SM_TICK_MS: u64 = 50;
const EXPIRY_TICK_MS: u64 = 200;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
enum MasterState {
    Idle,
    ConfigPairing,
    Pair,
    ConfigConnect,
    Reconfigure,
    Reconfiguring,
}

/// A slave we have seen broadcasting while in pairing mode.
struct PairingEntry {
    info: BroadcastInfo,
    addr: SocketAddr,
    last_seen: Instant,
    expired: bool,
}

/// A connected slave: the connect response it sent and the last time each of
/// its driver instances was heard from.
struct ConnectedEntry {
    response: ConnectResponse,
    addr: SocketAddr,
    instances: HashMap<String, Instant>,
}

#[derive(Default)]
struct Intents {
    pairing_mode: bool,
    stop_pairing: bool,
    stop_connecting: bool,
    pair_target: Option<(String, bool)>,
    connect_target: Option<String>,
    reconfigure_params: Option<Value>,
}

struct PairRun {
    target: String,
    retries_left: u32,
}

struct ReconfigureRun {
    targets: HashSet<String>,
    started: Instant,
}

struct MasterInner {
    core: ManagerCore,
    remote_port: u16,
    fsm: Mutex<StateMachine<MasterState>>,
    intents: Mutex<Intents>,
    pairing_map: Mutex<HashMap<String, PairingEntry>>,
    connected_map: Mutex<HashMap<String, ConnectedEntry>>,
    pair_run: Mutex<Option<PairRun>>,
    reconfigure_run: Mutex<Option<ReconfigureRun>>,

    sm_wake: Mutex<bool>,
    sm_wake_cv: Condvar,
    pair_response: Mutex<Option<(String, PairResponse)>>,
    pair_response_cv: Condvar,
    connect_response: Mutex<Option<(String, ConnectResponse, SocketAddr)>>,
    connect_response_cv: Condvar,

    pairing_list_changed: RwLock<Option<ListChangedCallback>>,
    connected_list_changed: RwLock<Option<ListChangedCallback>>,
    connected_callback: RwLock<Option<ConnectedCallback>>,
}

/// The coordinator side of a deployment. Construct, register callbacks,
/// `start()`, then drive it through the external commands.
pub struct MasterManager {
    inner: Arc<MasterInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    started: Mutex<bool>,
}

fn master_table() -> StateMachine<MasterState> {
    StateMachine::new(MasterState::Idle)
        .on(MasterState::Idle, Transition::Next1, MasterState::ConfigPairing)
        .on(MasterState::Idle, Transition::Next2, MasterState::Pair)
        .on(MasterState::Idle, Transition::Next3, MasterState::ConfigConnect)
        .on(MasterState::Idle, Transition::Next4, MasterState::Reconfigure)
        .on(MasterState::Idle, Transition::Error, MasterState::Idle)
        .on(MasterState::ConfigPairing, Transition::Next1, MasterState::Pair)
        .on(MasterState::ConfigPairing, Transition::Error, MasterState::Idle)
        .on(MasterState::Pair, Transition::Next1, MasterState::ConfigConnect)
        .on(MasterState::Pair, Transition::Error, MasterState::Idle)
        .on(MasterState::ConfigConnect, Transition::Next1, MasterState::Idle)
        .on(MasterState::ConfigConnect, Transition::Error, MasterState::Idle)
        .on(MasterState::Reconfigure, Transition::Next1, MasterState::Reconfiguring)
        .on(MasterState::Reconfigure, Transition::Error, MasterState::Idle)
        .on(MasterState::Reconfiguring, Transition::Next1, MasterState::Idle)
        .on(MasterState::Reconfiguring, Transition::Error, MasterState::Idle)
}

impl MasterManager {
    pub fn new(configuration: &str) -> Result<Self, String> {
        let core = ManagerCore::new(configuration, DEFAULT_MASTER_PORT)?;
        let remote_port = core.config.read().unwrap().remote_port.unwrap_or(DEFAULT_SLAVE_PORT);
        let inner = Arc::new(MasterInner {
            core,
            remote_port,
            fsm: Mutex::new(master_table()),
            intents: Mutex::new(Intents::default()),
            pairing_map: Mutex::new(HashMap::new()),
            connected_map: Mutex::new(HashMap::new()),
            pair_run: Mutex::new(None),
            reconfigure_run: Mutex::new(None),
            sm_wake: Mutex::new(false),
            sm_wake_cv: Condvar::new(),
            pair_response: Mutex::new(None),
            pair_response_cv: Condvar::new(),
            connect_response: Mutex::new(None),
            connect_response_cv: Condvar::new(),
            pairing_list_changed: RwLock::new(None),
            connected_list_changed: RwLock::new(None),
            connected_callback: RwLock::new(None),
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

    pub fn register_pairing_list_changed_callback(&self, callback: ListChangedCallback) {
        *self.inner.pairing_list_changed.write().unwrap() = Some(callback);
    }

    pub fn register_connected_list_changed_callback(&self, callback: ListChangedCallback) {
        *self.inner.connected_list_changed.write().unwrap() = Some(callback);
    }

    pub fn register_connected_callback(&self, callback: ConnectedCallback) {
        *self.inner.connected_callback.write().unwrap() = Some(callback);
    }

    /// Bring up drivers, the link layer and the worker threads.
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

        let expiry = Arc::clone(&self.inner);
        workers.push(thread::spawn(move || expiry.expiry_worker()));

        *started = true;
        Ok(())
    }

    /// Stop workers and drivers. Safe to call more than once.
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
        self.inner.pair_response_cv.notify_all();
        self.inner.connect_response_cv.notify_all();
        self.inner.core.stop();
        let workers: Vec<_> = self.workers.lock().unwrap().drain(..).collect();
        for handle in workers {
            let _ = handle.join();
        }
    }

    // ---- external commands ----

    pub fn enter_pairing_mode(&self) {
        self.inner.intents.lock().unwrap().pairing_mode = true;
        self.inner.wake();
    }

    pub fn stop_pairing(&self) {
        let mut intents = self.inner.intents.lock().unwrap();
        intents.stop_pairing = true;
        intents.pairing_mode = false;
        intents.pair_target = None;
        drop(intents);
        self.inner.wake();
    }

    pub fn stop_connecting(&self) {
        let mut intents = self.inner.intents.lock().unwrap();
        intents.stop_connecting = true;
        intents.connect_target = None;
        drop(intents);
        self.inner.wake();
    }

    /// Pair to a specific slave; `skip_config` goes straight to the pair
    /// exchange without reapplying the pairing sections.
    pub fn pair_to(&self, name: &str, skip_config: bool) {
        self.inner.intents.lock().unwrap().pair_target = Some((name.to_string(), skip_config));
        self.inner.wake();
    }

    pub fn connect_to(&self, name: &str) {
        self.inner.intents.lock().unwrap().connect_target = Some(name.to_string());
        self.inner.wake();
    }

    pub fn disconnect_from(&self, name: &str) {
        let entry_addr = {
            let mut connected = self.inner.connected_map.lock().unwrap();
            connected.remove(name).map(|e| e.addr)
        };
        if let Some(addr) = entry_addr {
            if let Ok(wire) = self
                .inner
                .core
                .seal_frame(Verb::Disconnect(DisconnectInfo::default()), Some(name))
            {
                let _ = self.inner.core.link.send_to(&wire, addr);
            }
            self.inner.core.report_status(StatusCode::Disconnected, name);
            self.inner.notify_connected_list_changed();
        }
        self.inner.wake();
    }

    pub fn unpair_from(&self, name: &str) {
        self.disconnect_from(name);
        self.inner.core.remove_paired(name);
    }

    /// Push a new connection-parameter delta to every connected slave.
    pub fn reconfigure(&self, new_configuration: &str) -> Result<(), String> {
        let params: Value = serde_json::from_str(new_configuration).map_err(|e| e.to_string())?;
        self.inner.intents.lock().unwrap().reconfigure_params = Some(params);
        self.inner.wake();
        Ok(())
    }

    /// Unicast our reachability directly to a known address, for links where
    /// the slave cannot hear broadcasts yet.
    pub fn advertise(&self, ip: &str) {
        let info = self.inner.compose_broadcast_info();
        if info.drivers.is_empty() {
            return;
        }
        if let Ok(wire) = self.inner.core.seal_frame(Verb::Broadcast(info), None) {
            let _ = self.inner.core.link.send(&wire, ip, self.inner.remote_port);
        }
    }

    // ---- queries ----

    pub fn get_pairing_list(&self) -> Vec<String> {
        let map = self.inner.pairing_map.lock().unwrap();
        let mut names: Vec<String> =
            map.iter().filter(|(_, e)| !e.expired).map(|(n, _)| n.clone()).collect();
        names.sort();
        names
    }

    pub fn get_paired_list(&self) -> Vec<String> {
        self.inner.core.store.paired_names()
    }

    pub fn get_connected_list(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.inner.connected_map.lock().unwrap().keys().cloned().collect();
        names.sort();
        names
    }

    /// Driver instances of a connected slave that are currently alive.
    pub fn get_connected_instances(&self, name: &str) -> Vec<String> {
        let map = self.inner.connected_map.lock().unwrap();
        match map.get(name) {
            Some(entry) => {
                let timeout = Duration::from_millis(self.inner.core.timing.status_timeout);
                let now = Instant::now();
                entry
                    .instances
                    .iter()
                    .filter(|(_, seen)| now.duration_since(**seen) <= timeout)
                    .map(|(i, _)| i.clone())
                    .collect()
            }
            None => Vec::new(),
        }
    }

    /// UDP ports to hand off to the MAVLink router for this slave.
    pub fn get_active_mavlink_ports(&self, name: &str) -> Vec<u16> {
        let mut ports = Vec::new();
        for instance in self.get_connected_instances(name) {
            if let Some(driver) = self.inner.core.driver(&instance) {
                let port = driver.mavlink_port();
                if port != 0 && !ports.contains(&port) {
                    ports.push(port);
                }
            }
        }
        ports
    }

    /// IP of the connected instance with the highest download bandwidth.
    pub fn get_best_ip_for_download(&self, name: &str) -> Option<(String, String, i64)> {
        let mut best: Option<(String, String, i64)> = None;
        for (instance, ip) in self.inner.connected_endpoints(name) {
            let bandwidth = self.inner.core.driver(&instance).map(|d| d.download_bandwidth())?;
            if best.as_ref().map(|(_, _, b)| bandwidth > *b).unwrap_or(true) {
                best = Some((ip, instance, bandwidth));
            }
        }
        best
    }

    /// IP of the connected instance with the best (lowest nonnegative)
    /// streaming priority.
    pub fn get_best_ip_for_streaming(&self, name: &str) -> Option<(String, String)> {
        let mut best: Option<(String, String, i32)> = None;
        for (instance, ip) in self.inner.connected_endpoints(name) {
            let priority = self.inner.core.driver(&instance).map(|d| d.streaming_priority())?;
            if priority < 0 {
                continue;
            }
            if best.as_ref().map(|(_, _, p)| priority < *p).unwrap_or(true) {
                best = Some((ip, instance, priority));
            }
        }
        best.map(|(ip, instance, _)| (ip, instance))
    }

    pub fn get_paired_autoconnect(&self, name: &str) -> bool {
        self.inner.core.store.autoconnect(name)
    }

    pub fn set_paired_autoconnect(&self, name: &str, value: bool) {
        if self.inner.core.store.set_autoconnect(name, value) {
            self.inner.core.notify_paired_list_changed();
            self.inner.wake();
        }
    }

    pub fn get_last_connected(&self) -> String {
        self.inner.core.store.last_connected()
    }

    pub fn get_driver_instance_pairing_settings(&self, instance: &str) -> Option<Map<String, Value>> {
        self.inner.core.driver_instance_pairing_settings(instance)
    }

    pub fn get_driver_instance_connection_settings(
        &self,
        instance: &str,
    ) -> Option<Map<String, Value>> {
        self.inner.core.driver_instance_connection_settings(instance)
    }

    pub fn report_wired_status(&self, instance: &str) -> bool {
        self.inner.core.report_wired_status(instance)
    }

    pub fn settings_templates(&self) -> Value {
        crate::driver::DriverRegistry::with_builtin().settings_templates()
    }
}

impl Drop for MasterManager {
    fn drop(&mut self) {
        self.stop();
    }
}

impl MasterInner {
    fn wake(&self) {
        let mut fired = self.sm_wake.lock().unwrap();
        *fired = true;
        self.sm_wake_cv.notify_all();
    }

    fn notify_pairing_list_changed(&self) {
        let callback = self.pairing_list_changed.read().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn notify_connected_list_changed(&self) {
        let callback = self.connected_list_changed.read().unwrap().clone();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn connected_endpoints(&self, name: &str) -> Vec<(String, String)> {
        let timeout = Duration::from_millis(self.core.timing.status_timeout);
        let now = Instant::now();
        let map = self.connected_map.lock().unwrap();
        match map.get(name) {
            Some(entry) => entry
                .response
                .drivers
                .iter()
                .filter(|e| {
                    entry
                        .instances
                        .get(&e.instance)
                        .map(|seen| now.duration_since(*seen) <= timeout)
                        .unwrap_or(false)
                })
                .map(|e| (e.instance.clone(), e.ip.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn compose_broadcast_info(&self) -> BroadcastInfo {
        let mut info = BroadcastInfo::default();
        for driver in &self.core.drivers {
            if let Some(extra) = driver.get_broadcast_info() {
                let ip = extra
                    .get("ip")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| driver.get_local_ip());
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

    // ---- inbound frames ----

    fn message_received(&self, msg: &str, from: SocketAddr) {
        let opened = match self.core.open_frame(msg) {
            Some(o) => o,
            None => return,
        };
        let name = opened.frame.machine_name.clone();

        match &opened.frame.verb {
            Verb::Broadcast(info) => self.process_broadcast(&name, info, from),
            Verb::Pair(Exchange::Response(response)) => {
                if !self.core.frame_acceptable(&opened) {
                    log::debug!("unverified pair response from {}", name);
                    return;
                }
                let mut slot = self.pair_response.lock().unwrap();
                *slot = Some((name, response.clone()));
                drop(slot);
                self.pair_response_cv.notify_all();
            }
            Verb::Connect(Exchange::Response(response)) => {
                if !self.core.frame_acceptable(&opened) {
                    return;
                }
                let mut slot = self.connect_response.lock().unwrap();
                *slot = Some((name, response.clone(), from));
                drop(slot);
                self.connect_response_cv.notify_all();
            }
            Verb::Status(status) => {
                if !self.core.frame_acceptable(&opened) {
                    return;
                }
                let mut connected = self.connected_map.lock().unwrap();
                if let Some(entry) = connected.get_mut(&name) {
                    entry.addr = from;
                    entry.instances.insert(status.instance.clone(), Instant::now());
                }
                drop(connected);
                self.wake();
            }
            Verb::Disconnect(_) => {
                if !self.core.frame_acceptable(&opened) {
                    return;
                }
                let removed = self.connected_map.lock().unwrap().remove(&name).is_some();
                if removed {
                    self.core.report_status(StatusCode::Disconnected, &name);
                    self.notify_connected_list_changed();
                }
            }
            other => {
                log::debug!("master ignoring {:?} from {}", frame_kind(other), name);
            }
        }
    }

    fn process_broadcast(&self, name: &str, info: &BroadcastInfo, from: SocketAddr) {
        let changed = {
            let mut map = self.pairing_map.lock().unwrap();
            match map.get_mut(name) {
                Some(entry) => {
                    let was_expired = entry.expired;
                    entry.info = info.clone();
                    entry.addr = from;
                    entry.last_seen = Instant::now();
                    entry.expired = false;
                    was_expired
                }
                None => {
                    map.insert(
                        name.to_string(),
                        PairingEntry {
                            info: info.clone(),
                            addr: from,
                            last_seen: Instant::now(),
                            expired: false,
                        },
                    );
                    true
                }
            }
        };
        if changed {
            self.notify_pairing_list_changed();
        }

        if self.core.store.is_paired(name) {
            for driver in &info.drivers {
                self.core.store.set_instance_remote_ip(name, &driver.instance, &driver.ip);
            }
        } else {
            // unpaired peer on an autopair link: initiate pairing unattended
            let autopair = info
                .drivers
                .iter()
                .any(|d| self.core.driver(&d.instance).map(|l| l.autopair()).unwrap_or(false));
            if autopair {
                let mut intents = self.intents.lock().unwrap();
                if intents.pair_target.is_none() && intents.connect_target.is_none() {
                    intents.pair_target = Some((name.to_string(), true));
                }
            }
        }

        self.wake();
    }

    // ---- workers ----

    fn state_machine_worker(self: Arc<Self>) {
        while !self.core.should_exit.load(Ordering::SeqCst) {
            let state = self.fsm.lock().unwrap().state();
            let transition = self.run_state(state);
            if let Some((old, new)) = self.fsm.lock().unwrap().apply(transition) {
                log::debug!("master: {:?} --{}--> {:?}", old, transition.name(), new);
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

    fn run_state(&self, state: MasterState) -> Transition {
        match state {
            MasterState::Idle => self.run_idle(),
            MasterState::ConfigPairing => self.run_config_pairing(),
            MasterState::Pair => self.run_pair(),
            MasterState::ConfigConnect => self.run_config_connect(),
            MasterState::Reconfigure => self.run_reconfigure(),
            MasterState::Reconfiguring => self.run_reconfiguring(),
        }
    }

    fn run_idle(&self) -> Transition {
        {
            let mut intents = self.intents.lock().unwrap();
            intents.stop_pairing = false;
            intents.stop_connecting = false;

            if intents.reconfigure_params.is_some() {
                if self.connected_map.lock().unwrap().is_empty() {
                    intents.reconfigure_params = None;
                } else {
                    return Transition::Next4;
                }
            }
            if let Some((_, skip_config)) = intents.pair_target.clone() {
                return if skip_config { Transition::Next2 } else { Transition::Next1 };
            }
            if intents.pairing_mode {
                return Transition::Next1;
            }
            if intents.connect_target.is_some() {
                return Transition::Next3;
            }
        }

        // autoconnect: any paired + autoconnect slave currently visible
        let candidates: Vec<String> = {
            let connected = self.connected_map.lock().unwrap();
            let pairing = self.pairing_map.lock().unwrap();
            self.core
                .store
                .paired_names()
                .into_iter()
                .filter(|n| !connected.contains_key(n))
                .filter(|n| self.core.store.autoconnect(n))
                .filter(|n| pairing.get(n).map(|e| !e.expired).unwrap_or(false))
                .collect()
        };
        if let Some(name) = candidates.into_iter().next() {
            self.intents.lock().unwrap().connect_target = Some(name);
            return Transition::Next3;
        }

        Transition::Repeat
    }

    fn run_config_pairing(&self) -> Transition {
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
        Transition::Next1
    }

    fn run_pair(&self) -> Transition {
        if self.intents.lock().unwrap().stop_pairing {
            let mut intents = self.intents.lock().unwrap();
            intents.stop_pairing = false;
            intents.pairing_mode = false;
            intents.pair_target = None;
            *self.pair_run.lock().unwrap() = None;
            self.core.report_status(StatusCode::Idle, "");
            return Transition::Error;
        }

        let target = match self.intents.lock().unwrap().pair_target.clone() {
            Some((name, _)) => name,
            None => {
                self.core.report_status(StatusCode::PairingIdle, "");
                return Transition::Repeat;
            }
        };

        {
            let mut run = self.pair_run.lock().unwrap();
            let stale = run.as_ref().map(|r| r.target != target).unwrap_or(true);
            if stale {
                *run = Some(PairRun {
                    target: target.clone(),
                    retries_left: self.core.timing.request_retries,
                });
                self.core.report_status(StatusCode::Pairing, &target);
                *self.pair_response.lock().unwrap() = None;
            }
        }

        let retries_left = {
            let mut run = self.pair_run.lock().unwrap();
            let run = run.as_mut().unwrap();
            if run.retries_left == 0 {
                None
            } else {
                run.retries_left -= 1;
                Some(run.retries_left)
            }
        };
        if retries_left.is_none() {
            self.core.report_status(StatusCode::ErrorPairing, &target);
            let mut intents = self.intents.lock().unwrap();
            intents.pair_target = None;
            intents.pairing_mode = false;
            *self.pair_run.lock().unwrap() = None;
            return Transition::Error;
        }

        self.send_pairing_request(&target);

        // wait one request period for the response (it may already be here)
        let deadline = Duration::from_millis(self.core.timing.request_timeout);
        let mut slot = self.pair_response.lock().unwrap();
        if slot.is_none() {
            let (guard, _) = self.pair_response_cv.wait_timeout(slot, deadline).unwrap();
            slot = guard;
        }
        let response = match slot.take() {
            Some((name, response)) if name == target => response,
            other => {
                *slot = other;
                return Transition::Repeat;
            }
        };
        drop(slot);

        // bind name -> key and persist the pairing
        let drivers = self.pairing_drivers_map(&target);
        self.core.add_paired(PairedRecord {
            name: target.clone(),
            public_key: response.public_key.clone(),
            autoconnect: true,
            drivers,
            extra: Map::new(),
        });

        let mut intents = self.intents.lock().unwrap();
        intents.pair_target = None;
        intents.pairing_mode = false;
        intents.connect_target = Some(target);
        drop(intents);
        *self.pair_run.lock().unwrap() = None;
        Transition::Next1
    }

    fn pairing_drivers_map(&self, name: &str) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(entry) = self.pairing_map.lock().unwrap().get(name) {
            for driver in &entry.info.drivers {
                let mut remote = Map::new();
                remote.insert("remote_ip".to_string(), Value::String(driver.ip.clone()));
                map.insert(driver.instance.clone(), Value::Object(remote));
            }
        }
        map
    }

    fn send_pairing_request(&self, name: &str) {
        let addr = match self.pairing_map.lock().unwrap().get(name) {
            Some(entry) => Some(entry.addr),
            None => None,
        };
        let addr = match addr {
            Some(a) => a,
            None => return, // not visible yet, the retry loop keeps counting
        };

        let public_key = if self.core.all_drivers_simplified() {
            String::new()
        } else {
            self.core.own_public_key_pem()
        };

        let mut drivers = Map::new();
        let config = self.core.config.read().unwrap().clone();
        for driver_config in &config.drivers {
            let mut params = driver_config.pairing.clone();
            if let Some(password) = &driver_config.password {
                params.insert("password".to_string(), Value::String(password.clone()));
            }
            drivers.insert(driver_config.instance.clone(), Value::Object(params));
        }

        let request = PairRequest { public_key, password: None, drivers };
        match self.core.seal_frame(Verb::Pair(Exchange::Request(request)), None) {
            Ok(wire) => {
                let _ = self.core.link.send_to(&wire, addr);
            }
            Err(e) => log::debug!("cannot seal pairing request: {}", e),
        }
    }

    fn run_config_connect(&self) -> Transition {
        let target = match self.intents.lock().unwrap().connect_target.clone() {
            Some(name) => name,
            None => return Transition::Error,
        };

        self.core.report_status(StatusCode::ConfigureForConnecting, &target);
        if self.core.configure_drivers(ParamSection::Connection, None).is_err() {
            self.fail_connect(&target);
            return Transition::Error;
        }
        let timeout = self.core.timing.driver_configure_timeout;
        let ok = self
            .core
            .wait_drivers_connected(timeout, || self.intents.lock().unwrap().stop_connecting);
        if !ok {
            self.fail_connect(&target);
            return Transition::Error;
        }

        self.core.report_status(StatusCode::Connecting, &target);
        *self.connect_response.lock().unwrap() = None;

        let mut retries = self.core.timing.request_retries;
        while retries > 0 {
            if self.core.should_exit.load(Ordering::SeqCst)
                || self.intents.lock().unwrap().stop_connecting
            {
                self.intents.lock().unwrap().connect_target = None;
                return Transition::Error;
            }
            retries -= 1;
            self.send_connection_request(&target);

            let deadline = Duration::from_millis(self.core.timing.request_timeout);
            let mut slot = self.connect_response.lock().unwrap();
            if slot.is_none() {
                let (guard, _) = self.connect_response_cv.wait_timeout(slot, deadline).unwrap();
                slot = guard;
            }
            let response = match slot.take() {
                Some((name, response, addr)) if name == target => Some((response, addr)),
                other => {
                    *slot = other;
                    None
                }
            };
            drop(slot);

            if let Some((response, addr)) = response {
                self.register_connected(&target, response, addr);
                self.intents.lock().unwrap().connect_target = None;
                return Transition::Next1;
            }
        }

        self.fail_connect(&target);
        Transition::Error
    }

    fn fail_connect(&self, target: &str) {
        self.core.report_status(StatusCode::ErrorConnecting, target);
        let mut intents = self.intents.lock().unwrap();
        intents.connect_target = None;
        intents.stop_connecting = false;
    }

    fn send_connection_request(&self, name: &str) {
        let addr = {
            let pairing = self.pairing_map.lock().unwrap();
            pairing.get(name).map(|e| e.addr)
        };
        let addr = match addr.or_else(|| self.stored_addr(name)) {
            Some(a) => a,
            None => return,
        };

        let mut drivers = Map::new();
        let config = self.core.config.read().unwrap().clone();
        for driver_config in &config.drivers {
            drivers.insert(
                driver_config.instance.clone(),
                Value::Object(driver_config.connection.clone()),
            );
        }
        let request = ConnectRequest { drivers };
        match self.core.seal_frame(Verb::Connect(Exchange::Request(request)), Some(name)) {
            Ok(wire) => {
                let _ = self.core.link.send_to(&wire, addr);
            }
            Err(e) => log::debug!("cannot seal connection request: {}", e),
        }
    }

    fn stored_addr(&self, name: &str) -> Option<SocketAddr> {
        let record = self.core.store.get(name)?;
        let ip = record
            .drivers
            .values()
            .find_map(|v| v.get("remote_ip").and_then(|ip| ip.as_str()).map(|s| s.to_string()))?;
        format!("{}:{}", ip, self.remote_port).parse().ok()
    }

    fn register_connected(&self, name: &str, response: ConnectResponse, addr: SocketAddr) {
        for endpoint in &response.drivers {
            self.core.store.set_instance_remote_ip(name, &endpoint.instance, &endpoint.ip);
        }
        {
            let mut connected = self.connected_map.lock().unwrap();
            let now = Instant::now();
            let instances = response.drivers.iter().map(|e| (e.instance.clone(), now)).collect();
            connected.insert(name.to_string(), ConnectedEntry { response, addr, instances });
        }
        self.core.store.set_last_connected(name);
        self.core.report_status(StatusCode::Connected, name);
        let callback = self.connected_callback.read().unwrap().clone();
        if let Some(callback) = callback {
            callback(name);
        }
        self.notify_connected_list_changed();
    }

    fn run_reconfigure(&self) -> Transition {
        let params = match self.intents.lock().unwrap().reconfigure_params.take() {
            Some(p) => p,
            None => return Transition::Error,
        };

        self.core.report_status(StatusCode::Reconfiguring, "");

        let targets: HashSet<String> =
            self.connected_map.lock().unwrap().keys().cloned().collect();
        let started = Instant::now();

        // tell the slaves first, while we can still reach them on the old
        // parameters
        for name in &targets {
            let request = ReconfigureRequest { params: params.clone() };
            let addr = self.connected_map.lock().unwrap().get(name).map(|e| e.addr);
            if let Some(addr) = addr {
                match self
                    .core
                    .seal_frame(Verb::Reconfigure(Exchange::Request(request)), Some(name))
                {
                    Ok(wire) => {
                        let _ = self.core.link.send_to(&wire, addr);
                    }
                    Err(e) => log::debug!("cannot seal reconfigure request: {}", e),
                }
            }
        }

        let changed = self.core.config.write().unwrap().merge_driver_params(&params, false);
        if !changed.is_empty() {
            let subset: HashSet<String> = changed.into_iter().collect();
            if self.core.configure_drivers(ParamSection::Connection, Some(&subset)).is_err() {
                self.core.report_status(StatusCode::ErrorReconfiguring, "");
                return Transition::Error;
            }
        }

        *self.reconfigure_run.lock().unwrap() = Some(ReconfigureRun { targets, started });
        Transition::Next1
    }

    fn run_reconfiguring(&self) -> Transition {
        let (targets, started) = match &*self.reconfigure_run.lock().unwrap() {
            Some(run) => (run.targets.clone(), run.started),
            None => return Transition::Error,
        };

        let missing: Vec<String> = {
            let connected = self.connected_map.lock().unwrap();
            targets
                .iter()
                .filter(|name| {
                    connected
                        .get(*name)
                        .map(|e| !e.instances.values().any(|seen| *seen > started))
                        .unwrap_or(true)
                })
                .cloned()
                .collect()
        };

        if missing.is_empty() {
            *self.reconfigure_run.lock().unwrap() = None;
            self.core.report_status(StatusCode::Reconfigured, "");
            return Transition::Next1;
        }

        let timeout = Duration::from_millis(self.core.timing.reconfiguration_timeout);
        if started.elapsed() >= timeout {
            *self.reconfigure_run.lock().unwrap() = None;
            self.core.report_status(StatusCode::ErrorReconfiguring, &missing.join(","));
            return Transition::Error;
        }

        Transition::Repeat
    }

    /// Periodic housekeeping: expire stale pairing entries, prune dead
    /// connected instances, send our own status heartbeats and refresh the
    /// MAVLink handoff set.
    fn expiry_worker(self: Arc<Self>) {
        let mut last_status_sent = Instant::now() - Duration::from_secs(3600);
        let mut last_mavlink_refresh = Instant::now();
        while !self.core.should_exit.load(Ordering::SeqCst) {
            let now = Instant::now();

            // broadcast entries expire silently after a few missed periods
            let expired = {
                let mut map = self.pairing_map.lock().unwrap();
                let expiry = Duration::from_millis(self.core.timing.broadcast_expiry());
                let mut any = false;
                for entry in map.values_mut() {
                    if !entry.expired && now.duration_since(entry.last_seen) > expiry {
                        entry.expired = true;
                        any = true;
                    }
                }
                any
            };
            if expired {
                self.notify_pairing_list_changed();
            }

            // a peer with every instance silent for status_timeout is gone
            let lost: Vec<String> = {
                let mut connected = self.connected_map.lock().unwrap();
                let timeout = Duration::from_millis(self.core.timing.status_timeout);
                let mut lost = Vec::new();
                connected.retain(|name, entry| {
                    entry.instances.retain(|_, seen| now.duration_since(*seen) <= timeout);
                    if entry.instances.is_empty() {
                        lost.push(name.clone());
                        false
                    } else {
                        true
                    }
                });
                lost
            };
            for name in &lost {
                self.core.report_status(StatusCode::Disconnected, name);
            }
            if !lost.is_empty() {
                self.notify_connected_list_changed();
                self.wake();
            }

            // our own heartbeats towards every connected slave
            if now.duration_since(last_status_sent)
                >= Duration::from_millis(self.core.timing.status_period)
            {
                last_status_sent = now;
                self.send_status_frames();
            }

            if now.duration_since(last_mavlink_refresh)
                >= Duration::from_millis(self.core.timing.mavlink_router_period)
            {
                last_mavlink_refresh = now;
                let connected: Vec<String> =
                    self.connected_map.lock().unwrap().keys().cloned().collect();
                for name in connected {
                    let ports = {
                        let mut ports = Vec::new();
                        let map = self.connected_map.lock().unwrap();
                        if let Some(entry) = map.get(&name) {
                            for endpoint in &entry.response.drivers {
                                if let Some(driver) = self.core.driver(&endpoint.instance) {
                                    let port = driver.mavlink_port();
                                    if port != 0 && !ports.contains(&port) {
                                        ports.push(port);
                                    }
                                }
                            }
                        }
                        ports
                    };
                    log::debug!("mavlink router handoff for {}: {:?}", name, ports);
                }
            }

            thread::sleep(Duration::from_millis(EXPIRY_TICK_MS.min(self.core.timing.status_period / 2)));
        }
    }

    fn send_status_frames(&self) {
        let peers: Vec<(String, SocketAddr)> = {
            let map = self.connected_map.lock().unwrap();
            map.iter().map(|(n, e)| (n.clone(), e.addr)).collect()
        };
        if peers.is_empty() {
            return;
        }
        let instances: Vec<String> = {
            let status = self.core.driver_status.lock().unwrap();
            self.core
                .drivers
                .iter()
                .map(|d| d.instance())
                .filter(|i| status.get(i).map(|c| c.is_driver_connected()).unwrap_or(false))
                .collect()
        };
        for (name, addr) in peers {
            for instance in &instances {
                let verb = Verb::Status(StatusInfo { instance: instance.clone() });
                match self.core.seal_frame(verb, Some(&name)) {
                    Ok(wire) => {
                        let _ = self.core.link.send_to(&wire, addr);
                    }
                    Err(e) => log::debug!("cannot seal status frame: {}", e),
                }
            }
        }
    }
}

fn frame_kind(verb: &Verb) -> &'static str {
    match verb {
        Verb::Broadcast(_) => "broadcast",
        Verb::Pair(Exchange::Request(_)) => "pair request",
        Verb::Pair(Exchange::Response(_)) => "pair response",
        Verb::Connect(Exchange::Request(_)) => "connect request",
        Verb::Connect(Exchange::Response(_)) => "connect response",
        Verb::Reconfigure(Exchange::Request(_)) => "reconfigure request",
        Verb::Reconfigure(Exchange::Response(_)) => "reconfigure response",
        Verb::Status(_) => "status",
        Verb::Disconnect(_) => "disconnect",
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

    fn master_config(store: &str) -> String {
        json!({
            "machine_name": "TestGCS",
            "encryption_key": "1234567890",
            "configuration_file": store,
            "aes_encryption": false,
            "rsa_encryption": true,
            "port": 0,
            "timing": {
                "broadcast_period": 200,
                "status_period": 200,
                "status_timeout": 1000,
                "request_timeout": 100,
                "request_retries": 5,
                "driver_configure_timeout": 2000,
                "reconfiguration_timeout": 2000
            },
            "drivers": [{"name": "WIFI", "ip": "127.0.0", "simplified": false}]
        })
        .to_string()
    }

    #[test]
    fn test_pairing_gives_up_on_ghost() {
        let store = temp_file("master-ghost");
        let master = MasterManager::new(&master_config(&store)).unwrap();

        let (tx, rx) = crossbeam_channel::unbounded();
        master.register_status_callback(Arc::new(move |status| {
            let _ = tx.send(status);
        }));
        master.start().unwrap();

        master.enter_pairing_mode();
        master.pair_to("Ghost", true);

        // 5 retries x 100 ms, plus scheduling slack
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut errors = 0;
        while Instant::now() < deadline {
            match rx.recv_timeout(Duration::from_millis(500)) {
                Ok(status) if status.code == StatusCode::ErrorPairing => {
                    assert_eq!(status.context, "Ghost");
                    errors += 1;
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(errors, 1);

        master.stop();
        let _ = std::fs::remove_file(&store);
    }

    #[test]
    fn test_lists_empty_on_fresh_start() {
        let store = temp_file("master-fresh");
        let master = MasterManager::new(&master_config(&store)).unwrap();
        master.start().unwrap();
        assert!(master.get_pairing_list().is_empty());
        assert!(master.get_paired_list().is_empty());
        assert!(master.get_connected_list().is_empty());
        assert!(master.get_best_ip_for_download("Nobody").is_none());
        master.stop();
        master.stop();
        let _ = std::fs::remove_file(&store);
    }
}
