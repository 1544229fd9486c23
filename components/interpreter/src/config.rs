//! Runtime tuning knobs
//!
//! Every field has a default, so a configuration file only needs to name
//! the values it changes.

use serde::{Deserialize, Serialize};

/// Thresholds and limits of one VM instance.
///
/// # Examples
///
/// ```
/// use interpreter::RuntimeConfig;
///
/// let config = RuntimeConfig::default();
/// assert!(config.jit);
/// assert_eq!(config.call_threshold, 100);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Promote hot regions to native code
    pub jit: bool,
    /// Calls before a function region is compiled
    pub call_threshold: u64,
    /// Back-edges before a loop region is compiled
    pub loop_threshold: u64,
    /// Guard failures before a region is recompiled without speculation
    pub max_deopts: u32,
    /// Callees a call-site cache keeps before going megamorphic (1 to 4)
    pub ic_polymorphic_limit: usize,
    /// Largest region, in instructions, the JIT accepts
    pub max_region_size: usize,
    /// Deepest call stack before `RecursionError`
    pub max_call_depth: usize,
    /// Deepest nesting of native frames; deeper calls are interpreted
    pub max_native_depth: usize,
    /// Capacity of the value stack
    pub stack_slots: usize,
}

/// Upper bound of [`RuntimeConfig::ic_polymorphic_limit`]
pub const MAX_POLYMORPHIC_ENTRIES: usize = 4;

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit: true,
            call_threshold: 100,
            loop_threshold: 1000,
            max_deopts: 4,
            ic_polymorphic_limit: MAX_POLYMORPHIC_ENTRIES,
            max_region_size: 2000,
            max_call_depth: 10_000,
            max_native_depth: 256,
            stack_slots: 1 << 18,
        }
    }
}

impl RuntimeConfig {
    /// Defaults with the JIT switched off
    pub fn interpreted() -> Self {
        Self {
            jit: false,
            ..Self::default()
        }
    }

    /// Clamp fields into their supported ranges
    pub fn normalized(mut self) -> Self {
        self.ic_polymorphic_limit = self.ic_polymorphic_limit.clamp(1, MAX_POLYMORPHIC_ENTRIES);
        self.call_threshold = self.call_threshold.max(1);
        self.loop_threshold = self.loop_threshold.max(1);
        self.max_call_depth = self.max_call_depth.max(1);
        self.stack_slots = self.stack_slots.max(16);
        self
    }
}
