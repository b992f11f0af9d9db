// src/store.rs
// Persistent pairing store: peer identities, key material, autoconnect
// flags. One JSON file, rewritten atomically on every mutation.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::crypto::RsaKeys;

/// One paired peer. `drivers` maps a driver instance to its remote info
/// (at least `remote_ip`). Unknown fields round-trip untouched.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PairedRecord {
    pub name: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub autoconnect: bool,
    #[serde(default)]
    pub drivers: Map<String, Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl PairedRecord {
    pub fn remote_ip(&self, instance: &str) -> Option<String> {
        self.drivers
            .get(instance)?
            .get("remote_ip")?
            .as_str()
            .map(|s| s.to_string())
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct StoreData {
    #[serde(default)]
    machine_name: String,
    #[serde(default)]
    public_key: String,
    #[serde(default)]
    private_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    encryption_key: Option<String>,
    #[serde(default)]
    last_connected: String,
    #[serde(default)]
    paired: Vec<PairedRecord>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// The on-disk pairing database. All access is serialized through one mutex;
/// every mutating call writes the file before returning. I/O failures
/// degrade to in-memory operation with a warning.
pub struct PairingStore {
    path: PathBuf,
    data: Mutex<StoreData>,
}

impl PairingStore {
    /// Load the store, creating it (and a fresh RSA identity) when the file
    /// or the key material is missing. Returns the store and our keys.
    pub fn load_or_create(path: &Path, machine_name: &str) -> Result<(Self, RsaKeys), String> {
        let mut data = match std::fs::read_to_string(path) {
            Ok(text) => match serde_json::from_str::<StoreData>(&text) {
                Ok(data) => data,
                Err(e) => {
                    log::warn!("pairing file {} unreadable, starting fresh: {}", path.display(), e);
                    StoreData::default()
                }
            },
            Err(_) => StoreData::default(),
        };

        data.machine_name = machine_name.to_string();

        let (keys, generated) = if data.private_key.is_empty() {
            (RsaKeys::generate()?, true)
        } else {
            match RsaKeys::from_private_pem(&data.private_key) {
                Ok(keys) => (keys, false),
                Err(e) => {
                    log::warn!("stored private key invalid, regenerating: {}", e);
                    (RsaKeys::generate()?, true)
                }
            }
        };

        if generated {
            data.private_key = keys.private_key_pem()?;
            data.public_key = keys.public_key_pem()?;
        }

        let store = Self { path: path.to_path_buf(), data: Mutex::new(data) };
        store.save(&store.data.lock().unwrap());
        Ok((store, keys))
    }

    pub fn paired_names(&self) -> Vec<String> {
        self.data.lock().unwrap().paired.iter().map(|r| r.name.clone()).collect()
    }

    pub fn get(&self, name: &str) -> Option<PairedRecord> {
        self.data.lock().unwrap().paired.iter().find(|r| r.name == name).cloned()
    }

    pub fn is_paired(&self, name: &str) -> bool {
        self.data.lock().unwrap().paired.iter().any(|r| r.name == name)
    }

    /// Insert or replace the record for `record.name`. Re-pairing the same
    /// name always overwrites. Returns true when anything changed.
    pub fn add_or_replace(&self, record: PairedRecord) -> bool {
        let mut data = self.data.lock().unwrap();
        if let Some(existing) = data.paired.iter_mut().find(|r| r.name == record.name) {
            let new = serde_json::to_value(&record).unwrap_or_default();
            let old = serde_json::to_value(&existing).unwrap_or_default();
            if new == old {
                return false;
            }
            *existing = record;
        } else {
            data.paired.push(record);
        }
        self.save(&data);
        true
    }

    pub fn remove(&self, name: &str) -> bool {
        let mut data = self.data.lock().unwrap();
        let before = data.paired.len();
        data.paired.retain(|r| r.name != name);
        if data.paired.len() == before {
            return false;
        }
        self.save(&data);
        true
    }

    pub fn autoconnect(&self, name: &str) -> bool {
        self.get(name).map(|r| r.autoconnect).unwrap_or(false)
    }

    pub fn set_autoconnect(&self, name: &str, value: bool) -> bool {
        let mut data = self.data.lock().unwrap();
        let changed = match data.paired.iter_mut().find(|r| r.name == name) {
            Some(record) if record.autoconnect != value => {
                record.autoconnect = value;
                true
            }
            _ => false,
        };
        if changed {
            self.save(&data);
        }
        changed
    }

    pub fn set_instance_remote_ip(&self, name: &str, instance: &str, ip: &str) {
        let mut data = self.data.lock().unwrap();
        let record = match data.paired.iter_mut().find(|r| r.name == name) {
            Some(r) => r,
            None => return,
        };
        let entry = record
            .drivers
            .entry(instance.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if entry.get("remote_ip").and_then(|v| v.as_str()) == Some(ip) {
            return;
        }
        if let Some(obj) = entry.as_object_mut() {
            obj.insert("remote_ip".to_string(), Value::String(ip.to_string()));
        }
        self.save(&data);
    }

    pub fn last_connected(&self) -> String {
        self.data.lock().unwrap().last_connected.clone()
    }

    pub fn set_last_connected(&self, name: &str) {
        let mut data = self.data.lock().unwrap();
        if data.last_connected == name {
            return;
        }
        data.last_connected = name.to_string();
        self.save(&data);
    }

    pub fn public_key_pem(&self) -> String {
        self.data.lock().unwrap().public_key.clone()
    }

    /// Write-temp + rename so readers never observe a half-written file.
    fn save(&self, data: &StoreData) {
        let text = match serde_json::to_string_pretty(data) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("cannot serialize pairing data: {}", e);
                return;
            }
        };
        let tmp = self.path.with_extension("tmp");
        let result = std::fs::write(&tmp, &text).and_then(|_| std::fs::rename(&tmp, &self.path));
        if let Err(e) = result {
            log::warn!(
                "cannot persist pairing data to {}, continuing in memory: {}",
                self.path.display(),
                e
            );
        }
    }
}
