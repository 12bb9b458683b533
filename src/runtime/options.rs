use log::warn;
use serde::{Deserialize, Serialize};

use crate::dex::LoadOptions;

pub const PAGE_SIZE: usize = 4096;

/// Tunables for one runtime instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeOptions {
    /// How long a suspend or checkpoint requester waits for a barrier, in ms.
    pub suspend_timeout: u64,
    /// Spin/yield rounds before the barrier wait starts sleeping.
    pub suspend_backoff_spins: u32,
    pub verify_checksum: bool,
    pub protected_stack_size: usize,
    pub reserved_stack_size: usize,
    pub tlab_size: usize,
    /// Report stack roots with their dex register numbers.
    pub precise_roots: bool,
    /// Deoptimize compiled frames on the exception path so listeners see them interpreted.
    pub force_interpret_on_exception: bool,
    pub interpreter_cache_size: usize,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        RuntimeOptions {
            suspend_timeout: 10_000,
            suspend_backoff_spins: 64,
            verify_checksum: true,
            protected_stack_size: 2 * PAGE_SIZE,
            reserved_stack_size: 2 * PAGE_SIZE,
            tlab_size: 32 * 1024,
            precise_roots: true,
            force_interpret_on_exception: false,
            interpreter_cache_size: 256,
        }
    }
}

fn parse_bool(v: &str) -> Option<bool> {
    match v {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

impl RuntimeOptions {
    /// Defaults overlaid with `DEXCORE_*` environment variables.
    pub fn from_env() -> RuntimeOptions {
        RuntimeOptions::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as `from_env`, reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> RuntimeOptions
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut opts = RuntimeOptions::default();
        if let Some(v) = lookup("DEXCORE_SUSPEND_TIMEOUT_MS") {
            match v.parse::<u64>() {
                Ok(ms) => opts.suspend_timeout = ms,
                Err(_) => warn!("ignoring DEXCORE_SUSPEND_TIMEOUT_MS={:?}", v),
            }
        }
        if let Some(v) = lookup("DEXCORE_VERIFY_CHECKSUM") {
            match parse_bool(&v) {
                Some(b) => opts.verify_checksum = b,
                None => warn!("ignoring DEXCORE_VERIFY_CHECKSUM={:?}", v),
            }
        }
        if let Some(v) = lookup("DEXCORE_TLAB_SIZE") {
            match v.parse::<usize>() {
                Ok(n) if n > 0 => opts.tlab_size = n,
                _ => warn!("ignoring DEXCORE_TLAB_SIZE={:?}", v),
            }
        }
        if let Some(v) = lookup("DEXCORE_PRECISE_ROOTS") {
            match parse_bool(&v) {
                Some(b) => opts.precise_roots = b,
                None => warn!("ignoring DEXCORE_PRECISE_ROOTS={:?}", v),
            }
        }
        opts
    }

    pub fn load_options(&self) -> LoadOptions {
        LoadOptions { verify_checksum: self.verify_checksum, ..LoadOptions::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn env_overrides_layer_over_defaults() {
        let env: HashMap<&str, &str> = [
            ("DEXCORE_SUSPEND_TIMEOUT_MS", "250"),
            ("DEXCORE_VERIFY_CHECKSUM", "0"),
            ("DEXCORE_TLAB_SIZE", "not a number"),
        ]
        .into_iter()
        .collect();
        let opts = RuntimeOptions::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(opts.suspend_timeout, 250);
        assert!(!opts.verify_checksum);
        assert_eq!(opts.tlab_size, RuntimeOptions::default().tlab_size);
        assert!(opts.precise_roots);
        assert!(!opts.load_options().verify_checksum);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let opts: RuntimeOptions = serde_json::from_str(r#"{ "tlab_size": 4096, "precise_roots": false }"#).unwrap();
        assert_eq!(opts.tlab_size, 4096);
        assert!(!opts.precise_roots);
        assert_eq!(opts.suspend_timeout, RuntimeOptions::default().suspend_timeout);

        let text = serde_json::to_string(&opts).unwrap();
        assert_eq!(serde_json::from_str::<RuntimeOptions>(&text).unwrap(), opts);
    }
}
