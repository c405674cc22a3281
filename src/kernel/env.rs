//! Process-wide key/value environment (`GETENV` / `SETENV`).

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::types::{Error, Result};

#[derive(Debug, Default)]
pub struct Env {
    vars: RwLock<HashMap<String, String>>,
}

impl Env {
    pub fn new(initial: HashMap<String, String>) -> Self {
        Self {
            vars: RwLock::new(initial),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.vars.read().get(key).cloned()
    }

    /// Set a key once. Overwriting an existing key is an error.
    pub fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut vars = self.vars.write();
        if vars.contains_key(key) {
            return Err(Error::validation(format!("env key already set: {}", key)));
        }
        vars.insert(key.to_string(), value.to_string());
        Ok(())
    }
}
