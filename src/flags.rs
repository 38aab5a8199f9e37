use std::collections::HashSet;
use std::sync::{Arc, RwLock};

pub const SIGNAL_GATE: &str = "signal_gate";
pub const PROFIT_ROUTER: &str = "profit_router";

/// Runtime on/off switches for pipeline modules. Written only by the
/// commander; read by the modules once per message.
#[derive(Debug, Clone, Default)]
pub struct ModuleFlags {
    disabled: Arc<RwLock<HashSet<String>>>,
}

impl ModuleFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_enabled(&self, module: &str) -> bool {
        match self.disabled.read() {
            Ok(set) => !set.contains(module),
            // A poisoned lock means a writer panicked mid-update; fail closed.
            Err(_) => false,
        }
    }

    /// Set the flag and return the previous value.
    pub fn set(&self, module: &str, enabled: bool) -> bool {
        let mut set = match self.disabled.write() {
            Ok(set) => set,
            Err(poisoned) => poisoned.into_inner(),
        };
        let was_enabled = !set.contains(module);
        if enabled {
            set.remove(module);
        } else {
            set.insert(module.to_string());
        }
        was_enabled
    }
}
