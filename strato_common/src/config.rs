//! Residency tracker tuning parameters.

/// Default cap on distinct resident separate-heap mappings.
pub const MAX_RESIDENT_MAPS: usize = 0x8000;

/// Default number of whole mappings reclaimed per eviction pass.
pub const EVICT_BATCH: usize = 4;

/// Configuration for the heap residency tracker.
///
/// # Example
///
/// ```ignore
/// use strato_common::TrackerConfig;
///
/// // Aggressive eviction for a memory-constrained host.
/// let config = TrackerConfig {
///     max_resident_maps: 0x1000,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Maximum number of distinct resident mappings before fault-in must
    /// evict. Counted per original map call, not per region: a mapping
    /// split into several regions occupies one slot while any piece of it
    /// is resident.
    ///
    /// Default: `0x8000`
    pub max_resident_maps: usize,

    /// Number of whole mappings reclaimed per eviction pass. Fault-in
    /// re-checks the cap after each pass, so the resident count settles at
    /// most this far below the cap.
    ///
    /// Default: `4`
    pub evict_batch: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_resident_maps: MAX_RESIDENT_MAPS,
            evict_batch: EVICT_BATCH,
        }
    }
}

impl TrackerConfig {
    /// Validate the configuration.
    ///
    /// The batch must be non-zero (a pass must make progress) and must not
    /// exceed the cap (a pass must never be asked to evict more mappings
    /// than can be resident).
    pub fn validate(&self) -> Result<(), String> {
        if self.evict_batch == 0 {
            return Err("evict_batch must be at least 1".to_string());
        }
        if self.max_resident_maps < self.evict_batch {
            return Err(format!(
                "max_resident_maps ({}) must be at least evict_batch ({})",
                self.max_resident_maps, self.evict_batch
            ));
        }
        Ok(())
    }
}
