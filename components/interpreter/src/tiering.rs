//! Tiering controller
//!
//! Tracks every region through
//! Cold → Profiling → Compiling → Compiled → Deoptimized → Profiling.
//! Counting lives in the profile records; the controller only decides.

use std::collections::HashMap;
use std::rc::Rc;

use core_types::{RegionId, RegionKind};
use tracing::{debug, warn};

use crate::backend::{CompileRefusal, CompiledCode, SpeculationLevel};
use crate::config::RuntimeConfig;

/// Observable state of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Never executed
    Cold,
    /// Interpreted while collecting feedback
    Profiling,
    /// Being compiled
    Compiling,
    /// Native code installed
    Compiled,
    /// Native code retired after a guard failure
    Deoptimized,
}

#[derive(Debug)]
enum RegionState {
    Cold,
    Profiling,
    Compiling,
    Compiled(Rc<dyn CompiledCode>),
    Deoptimized,
}

#[derive(Debug)]
struct RegionRecord {
    state: RegionState,
    refused: bool,
    deopts: u32,
}

impl Default for RegionRecord {
    fn default() -> Self {
        Self {
            state: RegionState::Cold,
            refused: false,
            deopts: 0,
        }
    }
}

/// Counts of tier transitions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    /// Successful compilations
    pub compilations: u64,
    /// Refused compilations
    pub refusals: u64,
    /// Guard failures
    pub deopts: u64,
}

/// Per-VM promotion state machine
#[derive(Debug)]
pub struct TieringController {
    regions: HashMap<RegionId, RegionRecord>,
    call_threshold: u64,
    loop_threshold: u64,
    max_deopts: u32,
    stats: TierStats,
}

impl TieringController {
    /// Controller with the thresholds of `config`
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            regions: HashMap::new(),
            call_threshold: config.call_threshold,
            loop_threshold: config.loop_threshold,
            max_deopts: config.max_deopts,
            stats: TierStats::default(),
        }
    }

    /// Report a region counter; true when the region should be compiled now.
    ///
    /// On true the region is `Compiling` and the caller must follow up with
    /// [`install`](Self::install) or [`refuse`](Self::refuse).
    pub fn observe(&mut self, region: RegionId, count: u64) -> bool {
        let threshold = match region.kind {
            RegionKind::Function => self.call_threshold,
            RegionKind::Loop { .. } => self.loop_threshold,
        };
        let record = self.regions.entry(region).or_default();
        if record.refused {
            return false;
        }
        match record.state {
            RegionState::Cold | RegionState::Deoptimized => record.state = RegionState::Profiling,
            RegionState::Compiling | RegionState::Compiled(_) => return false,
            RegionState::Profiling => {}
        }
        if count > threshold {
            record.state = RegionState::Compiling;
            return true;
        }
        false
    }

    /// Speculation allowed for the next compilation of a region
    pub fn speculation(&self, region: RegionId) -> SpeculationLevel {
        match self.regions.get(&region) {
            Some(record) if record.deopts >= self.max_deopts => SpeculationLevel::Generic,
            _ => SpeculationLevel::Speculative,
        }
    }

    /// Make compiled code the region's dispatch target
    pub fn install(&mut self, region: RegionId, entry: Rc<dyn CompiledCode>) {
        debug!(%region, speculation = ?entry.speculation(), bytes = entry.code_size(), "region compiled");
        self.stats.compilations += 1;
        self.regions.entry(region).or_default().state = RegionState::Compiled(entry);
    }

    /// Keep a region interpreted for good
    pub fn refuse(&mut self, region: RegionId, reason: &CompileRefusal) {
        match reason {
            CompileRefusal::RegionTooLarge { .. } | CompileRefusal::NoStaticLayout(_) => {
                debug!(%region, %reason, "compilation refused")
            }
            _ => warn!(%region, %reason, "compilation refused"),
        }
        self.stats.refusals += 1;
        let record = self.regions.entry(region).or_default();
        record.refused = true;
        record.state = RegionState::Profiling;
    }

    /// Dispatch target of a region, read once per entry
    pub fn compiled(&self, region: RegionId) -> Option<Rc<dyn CompiledCode>> {
        match self.regions.get(&region) {
            Some(RegionRecord {
                state: RegionState::Compiled(entry),
                ..
            }) => Some(Rc::clone(entry)),
            _ => None,
        }
    }

    /// Whether `code` is still the code dispatched for its region
    pub fn is_installed(&self, code: &Rc<dyn CompiledCode>) -> bool {
        matches!(
            self.regions.get(&code.region()),
            Some(RegionRecord { state: RegionState::Compiled(installed), .. }) if same_code(installed, code)
        )
    }

    /// Record a guard failure in `failing`; returns the retired code.
    ///
    /// Frames can outlive the entry they started in. A guard failing in
    /// code that is no longer installed leaves the region alone.
    pub fn deoptimize(
        &mut self,
        region: RegionId,
        failing: &Rc<dyn CompiledCode>,
    ) -> Option<Rc<dyn CompiledCode>> {
        let record = self.regions.get_mut(&region)?;
        match &record.state {
            RegionState::Compiled(installed) if same_code(installed, failing) => {}
            _ => return None,
        }
        let RegionState::Compiled(entry) =
            std::mem::replace(&mut record.state, RegionState::Deoptimized)
        else {
            return None;
        };
        record.deopts += 1;
        self.stats.deopts += 1;
        if record.deopts == self.max_deopts {
            warn!(%region, deopts = record.deopts, "deoptimization limit reached, next compilation is generic");
        } else {
            debug!(%region, deopts = record.deopts, "region deoptimized");
        }
        Some(entry)
    }

    /// Observable state of a region
    pub fn tier(&self, region: RegionId) -> Tier {
        match self.regions.get(&region).map(|r| &r.state) {
            None | Some(RegionState::Cold) => Tier::Cold,
            Some(RegionState::Profiling) => Tier::Profiling,
            Some(RegionState::Compiling) => Tier::Compiling,
            Some(RegionState::Compiled(_)) => Tier::Compiled,
            Some(RegionState::Deoptimized) => Tier::Deoptimized,
        }
    }

    /// Whether the back end refused the region
    pub fn is_refused(&self, region: RegionId) -> bool {
        self.regions.get(&region).is_some_and(|r| r.refused)
    }

    /// Guard failures of a region so far
    pub fn deopt_count(&self, region: RegionId) -> u32 {
        self.regions.get(&region).map_or(0, |r| r.deopts)
    }

    /// Transition counts
    pub fn stats(&self) -> TierStats {
        self.stats
    }
}

fn same_code(a: &Rc<dyn CompiledCode>, b: &Rc<dyn CompiledCode>) -> bool {
    Rc::as_ptr(a).cast::<()>() == Rc::as_ptr(b).cast::<()>()
}
