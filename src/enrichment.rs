//! Interval-gated caching for expensive per-track stages.
//!
//! Clustering and text reading are too slow to run on every track every
//! frame. Each stage has its own refresh interval `N`: a cached value is
//! recomputed when none exists yet or when at least `N` frames have passed
//! since the last refresh, and returned unchanged otherwise.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tracker::TrackId;

/// Per-track enrichment stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentStage {
    Clustering,
    TextReading,
}

impl fmt::Display for EnrichmentStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnrichmentStage::Clustering => write!(f, "clustering"),
            EnrichmentStage::TextReading => write!(f, "text_reading"),
        }
    }
}

/// Result of an enrichment stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnrichmentValue {
    Cluster(u32),
    Text(String),
}

impl EnrichmentValue {
    pub fn as_cluster(&self) -> Option<u32> {
        match self {
            EnrichmentValue::Cluster(id) => Some(*id),
            EnrichmentValue::Text(_) => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            EnrichmentValue::Text(text) => Some(text),
            EnrichmentValue::Cluster(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: EnrichmentValue,
    refreshed_at: u64,
}

/// Refresh intervals, in frames. Zero is treated as one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct EnrichmentIntervals {
    pub clustering: u64,
    pub text_reading: u64,
}

impl Default for EnrichmentIntervals {
    fn default() -> Self {
        Self {
            clustering: 5,
            text_reading: 30,
        }
    }
}

impl EnrichmentIntervals {
    pub fn for_stage(&self, stage: EnrichmentStage) -> u64 {
        let interval = match stage {
            EnrichmentStage::Clustering => self.clustering,
            EnrichmentStage::TextReading => self.text_reading,
        };
        interval.max(1)
    }
}

/// Counters exposed for telemetry and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub refreshes: u64,
    pub hits: u64,
}

/// Cache of enrichment results keyed by track identity and stage.
#[derive(Debug, Default)]
pub struct EnrichmentCache {
    intervals: EnrichmentIntervals,
    entries: HashMap<(TrackId, EnrichmentStage), CacheEntry>,
    stats: CacheStats,
}

impl EnrichmentCache {
    pub fn new(intervals: EnrichmentIntervals) -> Self {
        Self {
            intervals,
            entries: HashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Return the cached value for `(track, stage)`, running `compute` first
    /// if the entry is missing or at least one interval old.
    ///
    /// A failing `compute` leaves the previous entry untouched.
    pub fn maybe_refresh<F, E>(
        &mut self,
        track: TrackId,
        frame_index: u64,
        stage: EnrichmentStage,
        compute: F,
    ) -> Result<EnrichmentValue, E>
    where
        F: FnOnce() -> Result<EnrichmentValue, E>,
    {
        let interval = self.intervals.for_stage(stage);
        let key = (track, stage);

        if let Some(entry) = self.entries.get(&key) {
            if frame_index.saturating_sub(entry.refreshed_at) < interval {
                self.stats.hits += 1;
                return Ok(entry.value.clone());
            }
        }

        let value = compute()?;
        self.stats.refreshes += 1;
        self.entries.insert(
            key,
            CacheEntry {
                value: value.clone(),
                refreshed_at: frame_index,
            },
        );
        Ok(value)
    }

    /// Cached value without refreshing.
    pub fn peek(&self, track: TrackId, stage: EnrichmentStage) -> Option<&EnrichmentValue> {
        self.entries.get(&(track, stage)).map(|e| &e.value)
    }

    /// Frame of the last refresh for `(track, stage)`.
    pub fn last_refresh(&self, track: TrackId, stage: EnrichmentStage) -> Option<u64> {
        self.entries.get(&(track, stage)).map(|e| e.refreshed_at)
    }

    /// Drop every entry belonging to a destroyed track.
    pub fn evict(&mut self, track: TrackId) {
        self.entries.retain(|(id, _), _| *id != track);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}
