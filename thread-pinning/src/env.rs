//! Process-wide key/value settings layered over the OS environment.
//!
//! Values set through [`Environ::set`] shadow the environment snapshot taken
//! when the store was created; [`Environ::unset`] removes the override and
//! makes the snapshot value visible again. The OS environment itself is never
//! modified.

use std::{
    collections::HashMap,
    env,
    sync::{LazyLock, PoisonError, RwLock},
};

/// Values accepted as "enabled", compared case-insensitively.
const ENABLED_VALUES: [&str; 4] = ["yes", "on", "1", "true"];

static GLOBAL: LazyLock<Environ> = LazyLock::new(Environ::from_os);

/// Returns true if `value`, trimmed, is one of `yes`, `on`, `1` or `true`
/// (any case).
pub fn is_enabled_value(value: &str) -> bool {
    let value = value.trim();
    ENABLED_VALUES
        .iter()
        .any(|enabled| enabled.eq_ignore_ascii_case(value))
}

#[derive(Debug, Default)]
pub struct Environ {
    snapshot: HashMap<String, String>,
    overrides: RwLock<HashMap<String, String>>,
}

impl Environ {
    /// Store shared by the whole process, snapshotting the OS environment on
    /// first use.
    pub fn global() -> &'static Environ {
        &GLOBAL
    }

    /// Snapshot of the current OS environment. Variables that are not valid
    /// unicode are left out.
    pub fn from_os() -> Self {
        Self::from_vars(env::vars_os().filter_map(|(key, value)| {
            Some((key.into_string().ok()?, value.into_string().ok()?))
        }))
    }

    /// Store whose underlying environment is `vars` instead of the OS one.
    pub fn from_vars<K, V>(vars: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            snapshot: vars
                .into_iter()
                .map(|(key, value)| (key.into(), value.into()))
                .filter(|(key, _)| !key.is_empty())
                .collect(),
            overrides: RwLock::default(),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        if key.is_empty() {
            return None;
        }
        let overrides = self.overrides.read().unwrap_or_else(PoisonError::into_inner);
        overrides
            .get(key)
            .or_else(|| self.snapshot.get(key))
            .cloned()
    }

    /// Overrides `key`. Empty keys are ignored.
    pub fn set(&self, key: &str, value: impl Into<String>) {
        if key.is_empty() {
            return;
        }
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string(), value.into());
    }

    /// Drops the override of `key`, if any.
    pub fn unset(&self, key: &str) {
        self.overrides
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// True if `key` is set to an enabled value, see [`is_enabled_value`].
    pub fn is_enabled(&self, key: &str) -> bool {
        self.get(key).is_some_and(|value| is_enabled_value(&value))
    }
}
