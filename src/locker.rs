//! Name-keyed mutual exclusion.
//!
//! Serializes multi-step operations on the same read-write layer name while
//! letting different names proceed in parallel.

use std::{
    collections::HashMap,
    sync::{Arc, Condvar, Mutex},
};

#[derive(Debug, Default)]
struct NameLock {
    held: Mutex<bool>,
    released: Condvar,
}

#[derive(Debug)]
struct Entry {
    lock: Arc<NameLock>,
    // holders plus waiters
    users: usize,
}

/// A set of locks keyed by name, created on demand.
#[derive(Debug, Default)]
pub struct Locker {
    entries: Mutex<HashMap<String, Entry>>,
}

/// Holds the lock for one name until dropped.
#[derive(Debug)]
#[must_use = "the name is unlocked when the guard is dropped"]
pub struct NameGuard<'a> {
    locker: &'a Locker,
    name: String,
    lock: Arc<NameLock>,
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until `name` is free, then take it.
    pub fn lock(&self, name: &str) -> NameGuard<'_> {
        let lock = {
            let mut entries = self.entries.lock().expect("locker poisoned");
            let entry = entries.entry(name.to_string()).or_insert_with(|| Entry {
                lock: Arc::default(),
                users: 0,
            });
            entry.users += 1;
            Arc::clone(&entry.lock)
        };

        let mut held = lock.held.lock().expect("name lock poisoned");
        while *held {
            held = lock.released.wait(held).expect("name lock poisoned");
        }
        *held = true;
        drop(held);

        NameGuard {
            locker: self,
            name: name.to_string(),
            lock,
        }
    }

    /// Number of names currently held or waited on.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("locker poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for NameGuard<'_> {
    fn drop(&mut self) {
        {
            let mut held = self.lock.held.lock().expect("name lock poisoned");
            *held = false;
        }
        self.lock.released.notify_one();

        let mut entries = self.locker.entries.lock().expect("locker poisoned");
        if let Some(entry) = entries.get_mut(&self.name) {
            entry.users -= 1;
            if entry.users == 0 {
                entries.remove(&self.name);
            }
        }
    }
}
