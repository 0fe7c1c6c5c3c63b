//! Serialised access to the `BATCHWISE_*` environment in unit tests.
//!
//! [`scrubbed_env`] takes a process-wide lock, stashes every `BATCHWISE_*`
//! variable and removes it, so each test starts from the built-in defaults.
//! Dropping the guard wipes whatever the test set and puts the stash back.

use std::sync::{Mutex, MutexGuard};

use once_cell::sync::Lazy;

const PREFIX: &str = "BATCHWISE_";

static ENV_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

fn batchwise_vars() -> Vec<(String, String)> {
    std::env::vars()
        .filter(|(key, _)| key.starts_with(PREFIX))
        .collect()
}

pub(crate) struct ScrubbedEnv {
    _lock: MutexGuard<'static, ()>,
    stashed: Vec<(String, String)>,
}

pub(crate) fn scrubbed_env() -> ScrubbedEnv {
    let lock = ENV_LOCK
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    let stashed = batchwise_vars();
    for (key, _) in &stashed {
        std::env::remove_var(key);
    }
    ScrubbedEnv {
        _lock: lock,
        stashed,
    }
}

impl ScrubbedEnv {
    pub(crate) fn set(&mut self, key: &str, value: &str) {
        debug_assert!(key.starts_with(PREFIX), "{key} is outside the scrubbed set");
        std::env::set_var(key, value);
    }

    pub(crate) fn unset(&mut self, key: &str) {
        std::env::remove_var(key);
    }
}

impl Drop for ScrubbedEnv {
    fn drop(&mut self) {
        for (key, _) in batchwise_vars() {
            std::env::remove_var(key);
        }
        for (key, value) in self.stashed.drain(..) {
            std::env::set_var(key, value);
        }
    }
}
