// Environment reset between invocations.
use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::sync::{Mutex, PoisonError};

use log::{debug, warn};
use once_cell::sync::Lazy;

/// Restores the environment to its baseline and applies `next` on top.
///
/// Called synchronously right before every invocation.
pub trait EnvironmentReset: Send + Sync {
    fn reset(&self, next: &HashMap<String, String>);
}

#[derive(Default)]
struct AppliedEnvironment {
    // Value each applied key had before we first overwrote it.
    originals: HashMap<String, Option<OsString>>,
}

impl AppliedEnvironment {
    fn restore(&mut self) {
        for (key, original) in self.originals.drain() {
            match original {
                Some(value) => env::set_var(&key, value),
                None => env::remove_var(&key),
            }
        }
    }

    fn apply(&mut self, next: &HashMap<String, String>) {
        for (key, value) in next {
            if !is_settable(key, value) {
                warn!("Skipping environment variable {:?}: not representable", key);
                continue;
            }
            self.originals
                .entry(key.clone())
                .or_insert_with(|| env::var_os(key));
            env::set_var(key, value);
        }
    }
}

// set_var panics on these.
fn is_settable(key: &str, value: &str) -> bool {
    !key.is_empty() && !key.contains('=') && !key.contains('\0') && !value.contains('\0')
}

static APPLIED: Lazy<Mutex<AppliedEnvironment>> = Lazy::new(Default::default);

/// The real process environment, shared by every evaluator in the process.
///
/// All access goes through one mutex so a reset is never interleaved with
/// another reset. Handlers running concurrently still see whichever set was
/// applied last.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl EnvironmentReset for ProcessEnvironment {
    fn reset(&self, next: &HashMap<String, String>) {
        let mut applied = APPLIED.lock().unwrap_or_else(PoisonError::into_inner);
        applied.restore();
        applied.apply(next);
        debug!("Applied {} environment variable(s)", next.len());
    }
}
