//! In-process store
//!
//! Mirrors the Redis semantics the components rely on: emptied lists and
//! sets disappear, missing keys read as empty, and each key holds one kind
//! of value.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};

use crate::{Store, StoreError};

#[derive(Debug, Clone)]
enum Entry {
    List(VecDeque<String>),
    Set(HashSet<String>),
    Scalar(String),
}

/// Store backed by a map behind a mutex
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn wrong_type(key: &str) -> StoreError {
    StoreError::WrongType(key.to_string())
}

/// Resolve Redis-style inclusive indices against a list length
fn clamp_range(len: usize, start: isize, stop: isize) -> Option<(usize, usize)> {
    let len = len as isize;
    let start = if start < 0 { (len + start).max(0) } else { start };
    let stop = if stop < 0 { len + stop } else { stop.min(len - 1) };

    if len == 0 || start > stop || start >= len {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl Store for MemoryStore {
    async fn push_right(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::List(VecDeque::new()))
        {
            Entry::List(list) => {
                list.push_back(value.to_string());
                Ok(())
            }
            _ => Err(wrong_type(key)),
        }
    }

    async fn pop_left(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();
        let (value, now_empty) = match entries.get_mut(key) {
            None => return Ok(None),
            Some(Entry::List(list)) => (list.pop_front(), list.is_empty()),
            Some(_) => return Err(wrong_type(key)),
        };
        if now_empty {
            entries.remove(key);
        }
        Ok(value)
    }

    async fn range(&self, key: &str, start: isize, stop: isize) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::List(list)) => Ok(match clamp_range(list.len(), start, stop) {
                Some((from, to)) => list.range(from..=to).cloned().collect(),
                None => Vec::new(),
            }),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn length(&self, key: &str) -> Result<usize, StoreError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(0),
            Some(Entry::List(list)) => Ok(list.len()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn rename(&self, from: &str, to: &str) -> Result<(), StoreError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .remove(from)
            .ok_or_else(|| StoreError::NoSuchKey(from.to_string()))?;
        entries.insert(to.to_string(), entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }

    async fn pop_right_push_left(&self, from: &str, to: &str) -> Result<Option<String>, StoreError> {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get(to) {
            if !matches!(entry, Entry::List(_)) {
                return Err(wrong_type(to));
            }
        }

        let (value, now_empty) = match entries.get_mut(from) {
            None => return Ok(None),
            Some(Entry::List(list)) => (list.pop_back(), list.is_empty()),
            Some(_) => return Err(wrong_type(from)),
        };
        if now_empty {
            entries.remove(from);
        }

        if let Some(value) = &value {
            if let Entry::List(list) = entries
                .entry(to.to_string())
                .or_insert_with(|| Entry::List(VecDeque::new()))
            {
                list.push_front(value.clone());
            }
        }
        Ok(value)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let mut entries = self.entries.lock();
        match entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Set(HashSet::new()))
        {
            Entry::Set(set) => Ok(set.insert(member.to_string())),
            _ => Err(wrong_type(key)),
        }
    }

    async fn set_is_member(&self, key: &str, member: &str) -> Result<bool, StoreError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(false),
            Some(Entry::Set(set)) => Ok(set.contains(member)),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(Vec::new()),
            Some(Entry::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let entries = self.entries.lock();
        match entries.get(key) {
            None => Ok(None),
            Some(Entry::Scalar(value)) => Ok(Some(value.clone())),
            Some(_) => Err(wrong_type(key)),
        }
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .insert(key.to_string(), Entry::Scalar(value.to_string()));
        Ok(())
    }

    async fn incr(&self, key: &str) -> Result<i64, StoreError> {
        let mut entries = self.entries.lock();
        let entry = entries
            .entry(key.to_string())
            .or_insert_with(|| Entry::Scalar("0".to_string()));

        match entry {
            Entry::Scalar(value) => {
                let next = value
                    .parse::<i64>()
                    .map_err(|_| wrong_type(key))?
                    + 1;
                *value = next.to_string();
                Ok(next)
            }
            _ => Err(wrong_type(key)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_fifo_and_cleanup() {
        let store = MemoryStore::new();
        store.push_right("q", "a").await.unwrap();
        store.push_right("q", "b").await.unwrap();
        assert_eq!(store.length("q").await.unwrap(), 2);

        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("a"));
        assert_eq!(store.pop_left("q").await.unwrap().as_deref(), Some("b"));
        assert_eq!(store.pop_left("q").await.unwrap(), None);

        // Emptied lists disappear, so the key can be reused as a set
        assert!(store.set_add("q", "x").await.unwrap());
    }

    #[tokio::test]
    async fn test_range_indices() {
        let store = MemoryStore::new();
        for v in ["a", "b", "c", "d"] {
            store.push_right("q", v).await.unwrap();
        }

        assert_eq!(store.range("q", 0, -1).await.unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(store.range("q", 1, 2).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.range("q", -2, -1).await.unwrap(), vec!["c", "d"]);
        assert_eq!(store.range("q", 2, 100).await.unwrap(), vec!["c", "d"]);
        assert!(store.range("q", 3, 1).await.unwrap().is_empty());
        assert!(store.range("missing", 0, -1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rename_and_rotate() {
        let store = MemoryStore::new();
        store.push_right("live", "1").await.unwrap();
        store.push_right("live", "2").await.unwrap();

        store.rename("live", "aside").await.unwrap();
        assert_eq!(store.length("live").await.unwrap(), 0);
        assert!(matches!(
            store.rename("live", "aside").await,
            Err(StoreError::NoSuchKey(_))
        ));

        store.push_right("live", "3").await.unwrap();
        while store.pop_right_push_left("aside", "live").await.unwrap().is_some() {}

        assert_eq!(store.range("live", 0, -1).await.unwrap(), vec!["1", "2", "3"]);
        assert_eq!(store.length("aside").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sets_and_scalars() {
        let store = MemoryStore::new();
        assert!(store.set_add("pool", "1.2.3.4:80").await.unwrap());
        assert!(!store.set_add("pool", "1.2.3.4:80").await.unwrap());
        assert!(store.set_is_member("pool", "1.2.3.4:80").await.unwrap());
        assert_eq!(store.set_members("pool").await.unwrap().len(), 1);

        assert_eq!(store.incr("count").await.unwrap(), 1);
        assert_eq!(store.incr("count").await.unwrap(), 2);
        assert_eq!(store.get("count").await.unwrap().as_deref(), Some("2"));

        store.set("gauge", "abc").await.unwrap();
        assert!(matches!(store.incr("gauge").await, Err(StoreError::WrongType(_))));
        assert!(matches!(store.length("pool").await, Err(StoreError::WrongType(_))));

        store.delete("pool").await.unwrap();
        assert!(!store.set_is_member("pool", "1.2.3.4:80").await.unwrap());
    }
}
