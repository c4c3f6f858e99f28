// src/zone_tracker.rs
//
// Per-zone occupancy tracking with two-stage hysteresis:
//
//   1. Debounce: a person's inside/outside classification must repeat for
//      `min_dwell_frames` consecutive frames before it is trusted at all.
//      Single-frame flicker from the detector never reaches dwell state.
//
//   2. Dwell gating: a trusted "inside" must persist for `min_dwell_time_secs`
//      before an entry is counted, and a trusted "outside" must persist for
//      `exit_grace_secs` before the matching exit is confirmed. A person who
//      briefly drops the inside test re-enters the Inside phase without any
//      event, which suppresses the spurious exit/re-entry pairs a single
//      missed frame would otherwise produce.
//
// Counting is not this module's concern: the tracker reports which person ids
// produced a confirmed entry or exit this frame, and the store applies them to
// counters, history, and the event sink as one unit.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::geometry;
use crate::types::{secs_between, PersonId, Point, ZoneTrackingConfig};

/// Debounce buffer for one person against one zone.
#[derive(Debug, Clone)]
struct DebounceBuffer {
    inside: bool,
    consecutive: u32,
    last_update: DateTime<Utc>,
}

/// Dwell phase once a person has a trusted inside classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DwellPhase {
    Inside,
    /// Failed the inside test; waiting out the grace window.
    Exiting,
}

#[derive(Debug, Clone)]
struct DwellRecord {
    entry_time: DateTime<Utc>,
    last_seen: DateTime<Utc>,
    counted: bool,
    exit_time: Option<DateTime<Utc>>,
    phase: DwellPhase,
}

enum DwellOutcome {
    None,
    /// Dwell time requirement met for the first time; count the entry.
    QualifiedEntry,
    /// Grace window elapsed; the record is retired. `counted` says whether
    /// the person produced an entry event that needs a matching exit.
    ConfirmedExit { counted: bool },
}

/// Confirmed transitions from one frame of updates.
#[derive(Debug, Default)]
pub struct ZoneUpdate {
    pub entries: Vec<PersonId>,
    pub exits: Vec<PersonId>,
}

/// Live dwell figures for a zone, reported by `get_zone_stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct DwellStats {
    pub active: usize,
    pub qualified: usize,
    pub avg_dwell_secs: f64,
    pub max_dwell_secs: f64,
}

pub struct ZoneOccupancyTracker {
    config: ZoneTrackingConfig,
    debounce: HashMap<PersonId, DebounceBuffer>,
    dwell: HashMap<PersonId, DwellRecord>,
    inside: HashSet<PersonId>,
}

impl ZoneOccupancyTracker {
    pub fn new(config: ZoneTrackingConfig) -> Self {
        Self {
            config,
            debounce: HashMap::new(),
            dwell: HashMap::new(),
            inside: HashSet::new(),
        }
    }

    /// Process one frame of detections against the zone rectangle.
    ///
    /// Persons absent from `detections` but still carrying a dwell record are
    /// driven through the stable-outside path so their records retire
    /// deterministically once the grace window elapses.
    pub fn update(
        &mut self,
        top_left: [i32; 2],
        bottom_right: [i32; 2],
        detections: &[(PersonId, Point)],
        now: DateTime<Utc>,
    ) -> ZoneUpdate {
        let mut update = ZoneUpdate::default();
        let mut current_inside = HashSet::new();

        for (id, position) in detections {
            let is_inside =
                geometry::in_padded_rect(*position, top_left, bottom_right, self.config.zone_padding);

            // Unstable classifications never touch dwell state.
            let Some(stable_inside) = self.debounce_classify(id, is_inside, now) else {
                continue;
            };
            if stable_inside {
                current_inside.insert(id.clone());
            }

            match self.update_dwell(id, stable_inside, now) {
                DwellOutcome::QualifiedEntry => update.entries.push(id.clone()),
                DwellOutcome::ConfirmedExit { counted: true } => update.exits.push(id.clone()),
                DwellOutcome::ConfirmedExit { counted: false } | DwellOutcome::None => {}
            }
        }

        // People who left the frame entirely: run their dwell record through
        // the outside path using last known state.
        let active: HashSet<&PersonId> = detections.iter().map(|(id, _)| id).collect();
        let departed: Vec<PersonId> = self
            .dwell
            .keys()
            .filter(|id| !active.contains(id))
            .cloned()
            .collect();
        for id in departed {
            if let DwellOutcome::ConfirmedExit { counted: true } = self.update_dwell(&id, false, now)
            {
                update.exits.push(id);
            }
        }

        // Occupancy reflects presence, not counted visits.
        self.inside = current_inside;
        update
    }

    /// Returns `Some(classification)` only once the classification has held
    /// for `min_dwell_frames` consecutive frames.
    fn debounce_classify(
        &mut self,
        id: &PersonId,
        is_inside: bool,
        now: DateTime<Utc>,
    ) -> Option<bool> {
        match self.debounce.get_mut(id) {
            None => {
                self.debounce.insert(
                    id.clone(),
                    DebounceBuffer {
                        inside: is_inside,
                        consecutive: 1,
                        last_update: now,
                    },
                );
                None
            }
            Some(buffer) if buffer.inside != is_inside => {
                buffer.inside = is_inside;
                buffer.consecutive = 1;
                buffer.last_update = now;
                None
            }
            Some(buffer) => {
                buffer.consecutive += 1;
                buffer.last_update = now;
                (buffer.consecutive >= self.config.min_dwell_frames).then_some(is_inside)
            }
        }
    }

    fn update_dwell(&mut self, id: &PersonId, inside: bool, now: DateTime<Utc>) -> DwellOutcome {
        let Some(record) = self.dwell.get_mut(id) else {
            if inside {
                self.dwell.insert(
                    id.clone(),
                    DwellRecord {
                        entry_time: now,
                        last_seen: now,
                        counted: false,
                        exit_time: None,
                        phase: DwellPhase::Inside,
                    },
                );
            }
            return DwellOutcome::None;
        };

        if inside {
            if record.phase == DwellPhase::Exiting {
                // Came back within the grace window: cancel the exit.
                debug!(person = %id, "re-entered during grace window, exit cancelled");
                record.phase = DwellPhase::Inside;
                record.exit_time = None;
                record.last_seen = now;
                return DwellOutcome::None;
            }

            record.last_seen = now;
            let dwell = secs_between(record.entry_time, now);
            if !record.counted && dwell >= self.config.min_dwell_time_secs {
                record.counted = true;
                return DwellOutcome::QualifiedEntry;
            }
            DwellOutcome::None
        } else {
            match record.phase {
                DwellPhase::Inside => {
                    record.phase = DwellPhase::Exiting;
                    record.exit_time = Some(now);
                    DwellOutcome::None
                }
                DwellPhase::Exiting => {
                    let exit_time = record.exit_time.unwrap_or(record.last_seen);
                    if secs_between(exit_time, now) >= self.config.exit_grace_secs {
                        let counted = record.counted;
                        self.dwell.remove(id);
                        DwellOutcome::ConfirmedExit { counted }
                    } else {
                        DwellOutcome::None
                    }
                }
            }
        }
    }

    pub fn inside_ids(&self) -> &HashSet<PersonId> {
        &self.inside
    }

    pub fn dwell_stats(&self, now: DateTime<Utc>) -> DwellStats {
        let mut stats = DwellStats::default();
        let mut dwell_times = Vec::new();
        for record in self.dwell.values() {
            if record.phase == DwellPhase::Inside {
                stats.active += 1;
                if record.counted {
                    stats.qualified += 1;
                }
                dwell_times.push(secs_between(record.entry_time, now));
            }
        }
        if !dwell_times.is_empty() {
            stats.avg_dwell_secs = dwell_times.iter().sum::<f64>() / dwell_times.len() as f64;
            stats.max_dwell_secs = dwell_times.iter().cloned().fold(0.0, f64::max);
        }
        stats
    }

    /// Drop everything; used by reset and by create-or-update replacement.
    pub fn clear(&mut self) {
        self.debounce.clear();
        self.dwell.clear();
        self.inside.clear();
    }

    /// Remove entries not touched recently. Returns how many were dropped.
    pub fn sweep_stale(
        &mut self,
        now: DateTime<Utc>,
        debounce_stale_secs: f64,
        track_stale_secs: f64,
    ) -> usize {
        let before = self.debounce.len() + self.dwell.len();
        self.debounce
            .retain(|_, buffer| secs_between(buffer.last_update, now) <= debounce_stale_secs);
        self.dwell.retain(|_, record| {
            let last_active = record.exit_time.unwrap_or(record.last_seen);
            secs_between(last_active, now) <= track_stale_secs
        });
        let kept: HashSet<PersonId> = self.debounce.keys().cloned().collect();
        self.inside.retain(|id| kept.contains(id));
        before - (self.debounce.len() + self.dwell.len())
    }

    #[cfg(test)]
    fn tracking_len(&self) -> (usize, usize) {
        (self.debounce.len(), self.dwell.len())
    }
}
