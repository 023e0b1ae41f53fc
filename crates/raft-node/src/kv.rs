//! # kv
//!
//! why: a small replicated key-value map to drive and demonstrate a node
//! relations: implements app::StateMachine
//! what: KvStore with json `{key, val}` put commands

use crate::app::StateMachine;
use crate::error::StateMachineError;
use crate::pipeline::CommitBatch;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Serialize, Deserialize)]
struct KvCommand {
    key: String,
    val: String,
}

#[derive(Debug, Default)]
pub struct KvStore {
    map: RwLock<HashMap<String, String>>,
}

impl KvStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// command bytes that set `key` to `val` once committed
    pub fn encode_put(key: &str, val: &str) -> Vec<u8> {
        let command = KvCommand { key: key.to_string(), val: val.to_string() };
        // a struct of two strings always serializes
        serde_json::to_vec(&command).unwrap_or_default()
    }

    pub fn lookup(&self, key: &str) -> Option<String> {
        self.map.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.read().is_empty()
    }
}

impl StateMachine for KvStore {
    fn apply(&self, batch: &CommitBatch) -> Result<(), StateMachineError> {
        let commands = batch
            .data
            .iter()
            .map(|raw| serde_json::from_slice::<KvCommand>(raw).map_err(|e| StateMachineError::Decode(e.to_string())))
            .collect::<Result<Vec<_>, _>>()?;
        let mut map = self.map.write();
        for command in commands {
            map.insert(command.key, command.val);
        }
        Ok(())
    }

    fn snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        Ok(serde_json::to_vec(&*self.map.read())?)
    }

    fn restore(&self, data: &[u8]) -> Result<(), StateMachineError> {
        let restored: HashMap<String, String> = serde_json::from_slice(data)?;
        *self.map.write() = restored;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_restores_into_a_fresh_store() {
        let store = KvStore::new();
        store.map.write().insert("foo".into(), "bar".into());
        let image = store.snapshot().unwrap();

        let other = KvStore::new();
        other.map.write().insert("stale".into(), "x".into());
        other.restore(&image).unwrap();
        assert_eq!(other.lookup("foo").as_deref(), Some("bar"));
        assert_eq!(other.lookup("stale"), None);
    }

    #[test]
    fn put_commands_are_json() {
        let raw = KvStore::encode_put("k", "v");
        assert_eq!(raw, br#"{"key":"k","val":"v"}"#.to_vec());
    }
}
