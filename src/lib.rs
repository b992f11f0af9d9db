// src/lib.rs
// Pairlink - secure pairing and connection management for vehicle radio links
// Library entry point

pub mod config;
pub mod crypto;
pub mod driver;
pub mod fsm;
pub mod ip_driver;
pub mod link;
pub mod manager;
pub mod master;
pub mod protocol;
pub mod slave;
pub mod status;
pub mod store;
pub mod util;

pub use config::{DriverConfig, ManagerConfig, Timing};
pub use driver::{ConnectionDriver, DriverEvent, DriverRegistry};
pub use master::MasterManager;
pub use slave::SlaveManager;
pub use status::{ConnectionStatus, StatusCode};
pub use store::PairedRecord;

#[cfg(test)]
mod integration_tests {
    use crate::status::{ConnectionStatus, StatusCode};
    use crate::{MasterManager, SlaveManager};
    use rand::RngCore;
    use serde_json::json;
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::{Duration, Instant};

    // an uncommon master port so parallel test runs on a shared machine do
    // not collide with real deployments
    const TEST_MASTER_PORT: u16 = 28471;

    fn temp_file(tag: &str) -> String {
        let mut bytes = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        let name: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
        std::env::temp_dir()
            .join(format!("pairlink-e2e-{}-{}.json", tag, name))
            .to_string_lossy()
            .into_owned()
    }

    fn timing() -> serde_json::Value {
        json!({
            "broadcast_period": 200,
            "status_period": 200,
            "status_timeout": 1500,
            "request_timeout": 150,
            "request_retries": 10,
            "reconfiguration_timeout": 5000,
            "driver_configure_timeout": 5000,
            "mavlink_router_period": 10000
        })
    }

    fn master_config(store: &str) -> String {
        json!({
            "machine_name": "TestGCS",
            "encryption_key": "1234567890",
            "link_layer": "udp",
            "configuration_file": store,
            "aes_encryption": false,
            "rsa_encryption": true,
            "port": TEST_MASTER_PORT,
            "timing": timing(),
            "drivers": [{
                "name": "WIFI",
                "instance": "WIFI",
                "ip": "127.0.0",
                "simplified": false,
                "password": "skylinkfct",
                "mavlink_port": 14550,
                "pairing": {"channel": "36", "bandwidth": "1", "tx_power": "7"},
                "connection": {"channel": "16", "bandwidth": "0", "tx_power": "20"}
            }]
        })
        .to_string()
    }

    fn slave_config(store: &str, machine_name: &str) -> String {
        json!({
            "machine_name": machine_name,
            "encryption_key": "1234567890",
            "link_layer": "udp",
            "configuration_file": store,
            "aes_encryption": false,
            "rsa_encryption": true,
            "ethernet_device": "eth0",
            "port": 0,
            "remote_port": TEST_MASTER_PORT,
            "timing": timing(),
            "drivers": [{
                "name": "WIFI",
                "instance": "WIFI",
                "ip": "127.0.0",
                "simplified": false,
                "password": "skylinkfct",
                "pairing": {"channel": "36", "bandwidth": "1", "tx_power": "7"}
            }]
        })
        .to_string()
    }

    type StatusLog = Arc<Mutex<Vec<ConnectionStatus>>>;

    fn status_collector() -> (crate::manager::StatusCallback, StatusLog) {
        let log: StatusLog = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let callback: crate::manager::StatusCallback = Arc::new(move |status| {
            sink.lock().unwrap().push(status);
        });
        (callback, log)
    }

    fn wait_for_code(log: &StatusLog, code: StatusCode, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if log.lock().unwrap().iter().any(|s| s.code == code) {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    fn wait_until<F: Fn() -> bool>(timeout: Duration, predicate: F) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(50));
        }
        false
    }

    fn assert_subsequence(log: &StatusLog, expected: &[StatusCode]) {
        let seen: Vec<StatusCode> = log.lock().unwrap().iter().map(|s| s.code).collect();
        let mut it = seen.iter();
        for code in expected {
            assert!(
                it.any(|c| c == code),
                "status {:?} missing or out of order; got {:?}",
                code,
                seen
            );
        }
    }

    #[test]
    fn test_full_pairing_simulation() {
        let _ = env_logger::builder().is_test(true).try_init();

        let master_store = temp_file("gcs");
        let slave_store = temp_file("vehicle");

        // ---- scenario: fresh pair + connect ----
        let master = MasterManager::new(&master_config(&master_store)).unwrap();
        let (cb, master_log) = status_collector();
        master.register_status_callback(cb);
        let connected_list_changes = Arc::new(Mutex::new(0usize));
        {
            let counter = Arc::clone(&connected_list_changes);
            master.register_connected_list_changed_callback(Arc::new(move || {
                *counter.lock().unwrap() += 1;
            }));
        }
        let connected_names = Arc::new(Mutex::new(Vec::<String>::new()));
        {
            let names = Arc::clone(&connected_names);
            master.register_connected_callback(Arc::new(move |name| {
                names.lock().unwrap().push(name.to_string());
            }));
        }
        master.start().unwrap();

        let slave = SlaveManager::new(&slave_config(&slave_store, "TestVehicle")).unwrap();
        let (cb, slave_log) = status_collector();
        slave.register_status_callback(cb);
        slave.start().unwrap();

        // wait for link detection on both sides before pairing
        assert!(wait_for_code(&master_log, StatusCode::DriverConnected, Duration::from_secs(10)));
        assert!(wait_for_code(&slave_log, StatusCode::DriverConnected, Duration::from_secs(10)));

        master.enter_pairing_mode();
        slave.enter_pairing_mode();

        assert!(
            wait_until(Duration::from_secs(15), || {
                master.get_pairing_list().contains(&"TestVehicle".to_string())
            }),
            "master never saw the slave's broadcast"
        );

        master.pair_to("TestVehicle", false);

        assert!(
            wait_for_code(&master_log, StatusCode::Connected, Duration::from_secs(30)),
            "master never reached CONNECTED: {:?}",
            master_log.lock().unwrap()
        );
        assert!(
            wait_for_code(&slave_log, StatusCode::Connected, Duration::from_secs(10)),
            "slave never reached CONNECTED: {:?}",
            slave_log.lock().unwrap()
        );

        assert_subsequence(
            &master_log,
            &[
                StatusCode::DriverConnected,
                StatusCode::ConfigureForPairing,
                StatusCode::Pairing,
                StatusCode::ConfigureForConnecting,
                StatusCode::Connecting,
                StatusCode::Connected,
            ],
        );
        assert_subsequence(
            &slave_log,
            &[
                StatusCode::DriverConnected,
                StatusCode::ConfigureForPairing,
                StatusCode::PairingIdle,
                StatusCode::Connected,
            ],
        );

        assert_eq!(master.get_connected_list(), vec!["TestVehicle".to_string()]);
        assert_eq!(master.get_paired_list(), vec!["TestVehicle".to_string()]);
        assert_eq!(*connected_names.lock().unwrap(), vec!["TestVehicle".to_string()]);
        assert!(*connected_list_changes.lock().unwrap() > 0);
        assert!(master.get_paired_autoconnect("TestVehicle"));
        assert_eq!(master.get_last_connected(), "TestVehicle");
        assert_eq!(master.get_active_mavlink_ports("TestVehicle"), vec![14550]);
        let (ip, instance, _bandwidth) = master.get_best_ip_for_download("TestVehicle").unwrap();
        assert_eq!(ip, "127.0.0.1");
        assert_eq!(instance, "WIFI");

        // ---- scenario: reconfigure while connected ----
        master
            .reconfigure(
                &json!({"drivers": [{"instance": "WIFI", "channel": "48", "tx_power": "23"}]})
                    .to_string(),
            )
            .unwrap();

        assert!(
            wait_for_code(&master_log, StatusCode::Reconfigured, Duration::from_secs(30)),
            "master never reconfigured: {:?}",
            master_log.lock().unwrap()
        );
        assert!(wait_for_code(&slave_log, StatusCode::Reconfigured, Duration::from_secs(10)));
        assert!(!master.get_connected_list().is_empty());

        // ---- scenario: autoconnect after restart ----
        master.stop();
        slave.stop();
        drop(master);
        drop(slave);

        let master = MasterManager::new(&master_config(&master_store)).unwrap();
        let (cb, master_log) = status_collector();
        master.register_status_callback(cb);
        master.start().unwrap();

        let slave = SlaveManager::new(&slave_config(&slave_store, "TestVehicle")).unwrap();
        let (cb, slave_log) = status_collector();
        slave.register_status_callback(cb);
        slave.start().unwrap();

        // no enter_pairing_mode on either side
        assert!(
            wait_for_code(&master_log, StatusCode::Connected, Duration::from_secs(30)),
            "autoconnect failed on master: {:?}",
            master_log.lock().unwrap()
        );
        assert!(wait_for_code(&slave_log, StatusCode::Connected, Duration::from_secs(10)));
        assert_eq!(master.get_connected_list(), vec!["TestVehicle".to_string()]);

        // ---- scenario: second slave appears, then goes silent ----
        let slave_b_store = temp_file("vehicle-b");
        let slave_b = SlaveManager::new(&slave_config(&slave_b_store, "TestVehicleB")).unwrap();
        let (cb, slave_b_log) = status_collector();
        slave_b.register_status_callback(cb);
        slave_b.start().unwrap();

        master.enter_pairing_mode();
        slave_b.enter_pairing_mode();
        assert!(wait_until(Duration::from_secs(15), || {
            master.get_pairing_list().contains(&"TestVehicleB".to_string())
        }));
        master.pair_to("TestVehicleB", false);
        assert!(
            wait_for_code(&slave_b_log, StatusCode::Connected, Duration::from_secs(30)),
            "second slave never connected: {:?}",
            slave_b_log.lock().unwrap()
        );
        assert!(wait_until(Duration::from_secs(10), || master.get_connected_list().len() == 2));

        // silence one vehicle; it must be pruned while the other stays
        slave_b.stop();
        assert!(
            wait_until(Duration::from_secs(10), || {
                master.get_connected_list() == vec!["TestVehicle".to_string()]
            }),
            "silent slave was not pruned: {:?}",
            master.get_connected_list()
        );
        assert!(wait_for_code(&master_log, StatusCode::Disconnected, Duration::from_secs(2)));

        // the surviving link keeps its status flowing
        thread::sleep(Duration::from_millis(500));
        assert_eq!(master.get_connected_list(), vec!["TestVehicle".to_string()]);

        master.stop();
        slave.stop();

        for path in [&master_store, &slave_store, &slave_b_store] {
            let _ = std::fs::remove_file(path);
        }
    }

    #[test]
    fn test_unpair_removes_record() {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = temp_file("unpair");
        // exercise the paired bookkeeping without a live peer; an ephemeral
        // port keeps this independent from the simulation test
        let config = master_config(&store).replace(
            &format!("\"port\":{}", TEST_MASTER_PORT),
            "\"port\":0",
        );
        let master = MasterManager::new(&config).unwrap();
        let changes = Arc::new(Mutex::new(0usize));
        {
            let counter = Arc::clone(&changes);
            master.register_paired_list_changed_callback(Arc::new(move || {
                *counter.lock().unwrap() += 1;
            }));
        }
        master.start().unwrap();
        assert!(master.get_paired_list().is_empty());
        master.unpair_from("Nobody");
        assert_eq!(*changes.lock().unwrap(), 0);
        master.stop();
        let _ = std::fs::remove_file(&store);
    }
}
