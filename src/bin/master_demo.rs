// src/bin/master_demo.rs
// Interactive master demo: assemble a configuration from the drivers named
// on the command line, then drive the manager from stdin.

use pairlink::{ConnectionStatus, MasterManager};
use serde_json::json;
use std::collections::BTreeSet;
use std::io::BufRead;
use std::sync::{Arc, Mutex};

fn driver_config(name: &str) -> Option<serde_json::Value> {
    match name {
        "wifi" => Some(json!({
            "name": "WIFI",
            "ip": "10.41.0",
            "ip_status": true,
            "simplified": true,
            "autopair": true,
            "mavlink": false
        })),
        "usbc" => Some(json!({
            "name": "USB-C",
            "ip": "10.41.1",
            "ip_status": true,
            "simplified": true,
            "autopair": true,
            "mavlink": false
        })),
        "zerotier" => Some(json!({
            "name": "ZeroTier",
            "ip": "10.147.17",
            "ip_status": true,
            "mavlink": true
        })),
        _ => None,
    }
}

fn display_help() {
    println!("l  - display lists");
    println!("p  - enter pairing mode");
    println!("sp - stop pairing");
    println!("sc - stop connecting");
    println!("pN - pair to N");
    println!("cN - connect to N");
    println!("dN - disconnect from N");
    println!("uN - unpair from N");
    println!("x  - exit");
}

fn display_lists(manager: &MasterManager, vehicles: &Mutex<Vec<String>>) {
    let pairing = manager.get_pairing_list();
    let paired = manager.get_paired_list();
    let connected = manager.get_connected_list();

    let mut all: BTreeSet<String> = BTreeSet::new();
    all.extend(pairing.iter().cloned());
    all.extend(paired.iter().cloned());
    *vehicles.lock().unwrap() = all.iter().cloned().collect();

    let separator = "*".repeat(1 + 20 + 4 * 12);
    println!("{}", separator);
    println!(
        "{:>1}{:>20}{:>12}{:>12}{:>12}{:>12}",
        "N", "Vehicle", "Pairing", "Paired", "Connecting", "Connected"
    );
    for (i, name) in all.iter().enumerate() {
        let is_connected = connected.contains(name);
        let connecting = !is_connected && manager.get_paired_autoconnect(name);
        let yes_no = |b: bool| if b { "YES" } else { "NO" };
        let mut line = format!(
            "{:>1}{:>20}{:>12}{:>12}{:>12}{:>12}",
            i,
            name,
            yes_no(pairing.contains(name)),
            yes_no(paired.contains(name)),
            yes_no(connecting),
            yes_no(is_connected),
        );
        if is_connected {
            line += &format!(" ({})", manager.get_connected_instances(name).join(", "));
        }
        println!("{}", line);
    }
    println!("{}", separator);
}

fn vehicle_at(vehicles: &Mutex<Vec<String>>, digit: char) -> Option<String> {
    let index = digit.to_digit(10)? as usize;
    vehicles.lock().unwrap().get(index).cloned()
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let all = args.iter().any(|a| a == "all");
    let mut drivers = Vec::new();
    for name in ["wifi", "usbc", "zerotier"] {
        if all || args.iter().any(|a| a == name) {
            drivers.push(driver_config(name).unwrap());
        }
    }
    if drivers.is_empty() {
        eprintln!("No drivers were specified. Specify one or more of [all, wifi, usbc, zerotier]");
        std::process::exit(1);
    }

    let config = json!({
        "machine_name": "DemoGCS",
        "encryption_key": "1234567890",
        "link_layer": "udp",
        "configuration_file": "pairing-cm.json",
        "aes_encryption": false,
        "rsa_encryption": true,
        "drivers": drivers
    })
    .to_string();

    let manager = match MasterManager::new(&config) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Could not initialize connection manager: {}", e);
            std::process::exit(1);
        }
    };
    let manager = Arc::new(manager);
    let vehicles = Arc::new(Mutex::new(Vec::<String>::new()));

    {
        let m = Arc::clone(&manager);
        let v = Arc::clone(&vehicles);
        manager.register_pairing_list_changed_callback(Arc::new(move || {
            println!("***** pairing list changed");
            display_lists(&m, &v);
        }));
    }
    {
        let m = Arc::clone(&manager);
        let v = Arc::clone(&vehicles);
        manager.register_paired_list_changed_callback(Arc::new(move || {
            println!("***** paired list changed");
            display_lists(&m, &v);
        }));
    }
    {
        let m = Arc::clone(&manager);
        let v = Arc::clone(&vehicles);
        manager.register_connected_list_changed_callback(Arc::new(move || {
            println!("***** connected list changed");
            display_lists(&m, &v);
        }));
    }
    manager.register_telemetry_callback(Arc::new(|instance, data| {
        println!("***** {} telemetry data:\n{}", instance, data);
    }));
    manager.register_status_callback(Arc::new(|status: ConnectionStatus| {
        println!("***** Status = {} {}", status.code.value(), status.context);
    }));

    if let Err(e) = manager.start() {
        eprintln!("Could not start connection manager: {}", e);
        std::process::exit(1);
    }

    display_help();

    let stdin = std::io::stdin();
    for line in stdin.lock().lines() {
        let input = match line {
            Ok(l) => l.trim().to_string(),
            Err(_) => break,
        };
        let mut chars = input.chars();
        match chars.next() {
            Some('x') => break,
            Some('l') => display_lists(&manager, &vehicles),
            Some('p') => match chars.next() {
                Some(digit) => {
                    manager.enter_pairing_mode();
                    if let Some(name) = vehicle_at(&vehicles, digit) {
                        manager.pair_to(&name, false);
                    }
                }
                None => manager.enter_pairing_mode(),
            },
            Some('s') => match chars.next() {
                Some('p') => manager.stop_pairing(),
                Some('c') => manager.stop_connecting(),
                _ => {}
            },
            Some('c') => {
                if let Some(name) = chars.next().and_then(|d| vehicle_at(&vehicles, d)) {
                    manager.connect_to(&name);
                }
            }
            Some('d') => {
                if let Some(name) = chars.next().and_then(|d| vehicle_at(&vehicles, d)) {
                    manager.disconnect_from(&name);
                }
            }
            Some('u') => {
                if let Some(name) = chars.next().and_then(|d| vehicle_at(&vehicles, d)) {
                    manager.unpair_from(&name);
                }
            }
            Some('h') | Some('?') => display_help(),
            _ => {}
        }
    }

    manager.stop();
}
