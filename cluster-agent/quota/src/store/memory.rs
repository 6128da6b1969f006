use super::Store;
use crate::{Error, Result};
use parking_lot::Mutex;
use std::{collections::HashMap, time::Duration};
use tokio::time::Instant;

/// A process-local store, for single-replica deployments and tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

#[derive(Debug)]
struct Entry {
    value: Value,
    expires: Option<Instant>,
}

#[derive(Debug)]
enum Value {
    String(String),
    Sorted(Vec<(i64, String)>),
}

// === impl MemoryStore ===

impl MemoryStore {
    fn with_live<T>(&self, key: &str, f: impl FnOnce(Option<&mut Entry>) -> T) -> T {
        let mut entries = self.entries.lock();
        f(live(&mut entries, key))
    }

    fn insert(&self, key: &str, value: String, ttl: Option<Duration>) {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::string(value, ttl));
    }
}

/// The entry at `key`, evicting it first if it has expired.
fn live<'e>(entries: &'e mut HashMap<String, Entry>, key: &str) -> Option<&'e mut Entry> {
    let now = Instant::now();
    if entries
        .get(key)
        .and_then(|e| e.expires)
        .is_some_and(|at| at <= now)
    {
        entries.remove(key);
    }
    entries.get_mut(key)
}

// === impl Entry ===

impl Entry {
    fn string(value: String, ttl: Option<Duration>) -> Self {
        Self {
            value: Value::String(value),
            expires: ttl.map(|ttl| Instant::now() + ttl),
        }
    }
}

fn wrong_type(key: &str) -> Error {
    Error::Store(format!("{key} holds the wrong kind of value"))
}

#[async_trait::async_trait]
impl Store for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            None => Ok(None),
            Some(Value::String(v)) => Ok(Some(v.clone())),
            Some(Value::Sorted(_)) => Err(wrong_type(key)),
        })
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        self.insert(key, value.to_string(), None);
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        self.insert(key, value.to_string(), Some(ttl));
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock();
        if live(&mut entries, key).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry::string(value.to_string(), Some(ttl)));
        Ok(true)
    }

    async fn compare_and_delete(&self, key: &str, value: &str) -> Result<bool> {
        let mut entries = self.entries.lock();
        let matches = matches!(
            live(&mut entries, key).map(|e| &e.value),
            Some(Value::String(v)) if v == value
        );
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn zadd(&self, key: &str, member: &str, score: i64) -> Result<()> {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Sorted(Vec::new()),
            expires: None,
        });
        match &mut entry.value {
            Value::Sorted(members) => {
                members.retain(|(_, m)| m != member);
                members.push((score, member.to_string()));
                members.sort();
                Ok(())
            }
            Value::String(_) => Err(wrong_type(key)),
        }
    }

    async fn zremove_below(&self, key: &str, bound: i64) -> Result<()> {
        self.with_live(key, |entry| match entry.map(|e| &mut e.value) {
            None => Ok(()),
            Some(Value::Sorted(members)) => {
                members.retain(|(score, _)| *score >= bound);
                Ok(())
            }
            Some(Value::String(_)) => Err(wrong_type(key)),
        })
    }

    async fn zcard(&self, key: &str) -> Result<u64> {
        self.with_live(key, |entry| match entry.map(|e| &e.value) {
            None => Ok(0),
            Some(Value::Sorted(members)) => Ok(members.len() as u64),
            Some(Value::String(_)) => Err(wrong_type(key)),
        })
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        self.with_live(key, |entry| {
            if let Some(entry) = entry {
                entry.expires = Some(Instant::now() + ttl);
            }
        });
        Ok(())
    }
}
