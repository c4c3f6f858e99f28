// src/store.rs
//
// Single owner of all camera/zone/line state. Every mutating entry point and
// every snapshot read runs under one exclusive lock; no I/O happens while it
// is held. `update_counts` is the per-frame entry point called concurrently
// by camera worker threads; it returns the confirmed events so the caller
// can forward them to the sink and schedule persistence after release.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::events::CounterEvent;
use crate::geometry;
use crate::line_tracker::LineCrossingTracker;
use crate::types::{
    push_history, secs_between, Config, CounterAction, Detection, FrameConfig, HistoryEntry,
    LineRecord, PersonId, Point, PositionMethod, ZoneRecord,
};
use crate::zone_tracker::{DwellStats, ZoneOccupancyTracker};

/// Shortest admissible line segment, in pixels. Anything shorter is noise to
/// the side test and almost certainly a misdrawn line.
pub const MIN_LINE_LENGTH: f64 = 10.0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid zone geometry for '{zone}': {reason}")]
    InvalidZoneGeometry { zone: String, reason: String },
    #[error("invalid line geometry for '{line}': {reason}")]
    InvalidLineGeometry { line: String, reason: String },
    #[error("unknown camera '{0}'")]
    UnknownCamera(String),
    #[error("unknown zone '{zone}' on camera '{camera}'")]
    UnknownZone { camera: String, zone: String },
    #[error("unknown line '{line}' on camera '{camera}'")]
    UnknownLine { camera: String, line: String },
}

/// Configuration and counters as serialized to disk: camera id to its zones
/// and lines. Tracking state is never persisted; it is rebuilt empty on load.
pub type PersistedState = BTreeMap<String, CameraRecord>;

#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct CameraRecord {
    #[serde(default)]
    pub zones: BTreeMap<String, ZoneRecord>,
    #[serde(default)]
    pub lines: BTreeMap<String, LineRecord>,
}

struct ZoneState {
    record: ZoneRecord,
    tracker: ZoneOccupancyTracker,
}

struct LineState {
    record: LineRecord,
    tracker: LineCrossingTracker,
}

#[derive(Default)]
struct CameraState {
    zones: HashMap<String, ZoneState>,
    lines: HashMap<String, LineState>,
}

struct StoreInner {
    cameras: HashMap<String, CameraState>,
    active_camera: Option<String>,
    last_sweep: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ZoneStats {
    pub in_count: u64,
    pub out_count: u64,
    pub current_occupancy: usize,
    pub inside_ids: Vec<PersonId>,
    pub dwell: DwellStats,
    pub top_left: [i32; 2],
    pub bottom_right: [i32; 2],
}

#[derive(Debug, Clone, Serialize)]
pub struct LineStats {
    pub in_count: u64,
    pub out_count: u64,
    pub start: [i32; 2],
    pub end: [i32; 2],
    pub active_tracks: usize,
    pub cooldowns_pending: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ZoneCounts {
    pub in_count: u64,
    pub out_count: u64,
    pub occupancy: usize,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct LineCounts {
    pub in_count: u64,
    pub out_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CameraSummary {
    pub camera_id: String,
    pub zones: BTreeMap<String, ZoneCounts>,
    pub lines: BTreeMap<String, LineCounts>,
}

pub struct CounterStore {
    config: Config,
    inner: Mutex<StoreInner>,
}

impl CounterStore {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            inner: Mutex::new(StoreInner {
                cameras: HashMap::new(),
                active_camera: None,
                last_sweep: None,
            }),
        }
    }

    /// Process one camera frame. Zones and lines are updated as one atomic
    /// unit under the lock; the returned events are for the caller to forward
    /// once the lock is gone.
    pub fn update_counts(
        &self,
        camera_id: &str,
        detections: &[Detection],
        method: PositionMethod,
        now: DateTime<Utc>,
    ) -> Vec<CounterEvent> {
        // Malformed entries are dropped individually; the rest of the frame
        // still counts.
        let mut positioned: Vec<(PersonId, Point)> = Vec::with_capacity(detections.len());
        for detection in detections {
            let position = geometry::person_position(&detection.shape, method);
            if !position.is_finite() {
                warn!(camera = camera_id, person = %detection.id, "dropping detection with non-finite position");
                continue;
            }
            positioned.push((detection.id.clone(), position));
        }

        let mut events = Vec::new();
        let mut inner = self.inner.lock();

        let camera = inner.cameras.entry(camera_id.to_string()).or_insert_with(|| {
            info!(camera = camera_id, "initializing state for new camera");
            CameraState::default()
        });

        for (zone_name, zone) in camera.zones.iter_mut() {
            let update = zone.tracker.update(
                zone.record.top_left,
                zone.record.bottom_right,
                &positioned,
                now,
            );

            for id in update.entries {
                zone.record.in_count += 1;
                push_history(
                    &mut zone.record.history,
                    HistoryEntry {
                        id: id.clone(),
                        action: CounterAction::Entered,
                        time: now,
                    },
                    self.config.zones.max_history,
                );
                events.push(CounterEvent::Zone {
                    camera_id: camera_id.to_string(),
                    zone: zone_name.clone(),
                    person_id: id,
                    action: CounterAction::Entered,
                    time: now,
                });
            }
            for id in update.exits {
                zone.record.out_count += 1;
                push_history(
                    &mut zone.record.history,
                    HistoryEntry {
                        id: id.clone(),
                        action: CounterAction::Exited,
                        time: now,
                    },
                    self.config.zones.max_history,
                );
                events.push(CounterEvent::Zone {
                    camera_id: camera_id.to_string(),
                    zone: zone_name.clone(),
                    person_id: id,
                    action: CounterAction::Exited,
                    time: now,
                });
            }

            zone.record.inside_ids = zone.tracker.inside_ids().iter().cloned().collect();
        }

        for (line_name, line) in camera.lines.iter_mut() {
            let crossings =
                line.tracker
                    .update(line.record.start, line.record.end, &positioned, now);
            for crossing in crossings {
                match crossing.direction {
                    CounterAction::In => line.record.in_count += 1,
                    CounterAction::Out => line.record.out_count += 1,
                    _ => unreachable!("line tracker only emits In/Out"),
                }
                push_history(
                    &mut line.record.history,
                    HistoryEntry {
                        id: crossing.id.clone(),
                        action: crossing.direction,
                        time: now,
                    },
                    self.config.lines.max_history,
                );
                events.push(CounterEvent::Line {
                    camera_id: camera_id.to_string(),
                    line: line_name.clone(),
                    person_id: crossing.id,
                    action: crossing.direction,
                    time: now,
                });
            }
        }

        events
    }

    pub fn create_or_update_zone(
        &self,
        camera_id: &str,
        zone: &str,
        top_left: [i32; 2],
        bottom_right: [i32; 2],
    ) -> Result<(), StoreError> {
        validate_zone(&self.config.frame, zone, top_left, bottom_right)?;

        let mut inner = self.inner.lock();
        let camera = inner.cameras.entry(camera_id.to_string()).or_default();
        camera.zones.insert(
            zone.to_string(),
            ZoneState {
                record: ZoneRecord::new(top_left, bottom_right),
                tracker: ZoneOccupancyTracker::new(self.config.zones.clone()),
            },
        );
        info!(camera = camera_id, zone, "zone created/updated");
        Ok(())
    }

    pub fn delete_zone(&self, camera_id: &str, zone: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let camera = inner
            .cameras
            .get_mut(camera_id)
            .ok_or_else(|| StoreError::UnknownCamera(camera_id.to_string()))?;
        camera.zones.remove(zone).ok_or_else(|| StoreError::UnknownZone {
            camera: camera_id.to_string(),
            zone: zone.to_string(),
        })?;
        info!(camera = camera_id, zone, "zone deleted");
        Ok(())
    }

    /// Zero counts and history and clear tracking state; geometry survives.
    pub fn reset_zone_counts(&self, camera_id: &str, zone: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let state = inner
            .cameras
            .get_mut(camera_id)
            .and_then(|camera| camera.zones.get_mut(zone))
            .ok_or_else(|| StoreError::UnknownZone {
                camera: camera_id.to_string(),
                zone: zone.to_string(),
            })?;
        state.record.in_count = 0;
        state.record.out_count = 0;
        state.record.inside_ids.clear();
        state.record.history.clear();
        state.tracker.clear();
        info!(camera = camera_id, zone, "zone counts reset");
        Ok(())
    }

    pub fn create_or_update_line(
        &self,
        camera_id: &str,
        line: &str,
        start: [i32; 2],
        end: [i32; 2],
    ) -> Result<(), StoreError> {
        validate_line(&self.config.frame, line, start, end)?;

        let mut inner = self.inner.lock();
        let camera = inner.cameras.entry(camera_id.to_string()).or_default();
        camera.lines.insert(
            line.to_string(),
            LineState {
                record: LineRecord::new(start, end),
                tracker: LineCrossingTracker::new(self.config.lines.clone()),
            },
        );
        info!(camera = camera_id, line, "line created/updated");
        Ok(())
    }

    pub fn delete_line(&self, camera_id: &str, line: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let camera = inner
            .cameras
            .get_mut(camera_id)
            .ok_or_else(|| StoreError::UnknownCamera(camera_id.to_string()))?;
        camera.lines.remove(line).ok_or_else(|| StoreError::UnknownLine {
            camera: camera_id.to_string(),
            line: line.to_string(),
        })?;
        info!(camera = camera_id, line, "line deleted");
        Ok(())
    }

    pub fn reset_line_counts(&self, camera_id: &str, line: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let state = inner
            .cameras
            .get_mut(camera_id)
            .and_then(|camera| camera.lines.get_mut(line))
            .ok_or_else(|| StoreError::UnknownLine {
                camera: camera_id.to_string(),
                line: line.to_string(),
            })?;
        state.record.in_count = 0;
        state.record.out_count = 0;
        state.record.history.clear();
        state.tracker.clear();
        info!(camera = camera_id, line, "line counts reset");
        Ok(())
    }

    pub fn set_active_camera(&self, camera_id: &str) -> bool {
        let mut inner = self.inner.lock();
        if inner.cameras.contains_key(camera_id) {
            inner.active_camera = Some(camera_id.to_string());
            info!(camera = camera_id, "active camera set");
            true
        } else {
            warn!(camera = camera_id, "cannot activate unknown camera");
            false
        }
    }

    pub fn active_camera(&self) -> Option<String> {
        self.inner.lock().active_camera.clone()
    }

    pub fn get_zone_stats(&self, camera_id: &str, zone: &str, now: DateTime<Utc>) -> Option<ZoneStats> {
        let inner = self.inner.lock();
        let state = inner.cameras.get(camera_id)?.zones.get(zone)?;
        Some(ZoneStats {
            in_count: state.record.in_count,
            out_count: state.record.out_count,
            current_occupancy: state.tracker.inside_ids().len(),
            inside_ids: state.tracker.inside_ids().iter().cloned().collect(),
            dwell: state.tracker.dwell_stats(now),
            top_left: state.record.top_left,
            bottom_right: state.record.bottom_right,
        })
    }

    pub fn get_line_stats(&self, camera_id: &str, line: &str) -> Option<LineStats> {
        let inner = self.inner.lock();
        let state = inner.cameras.get(camera_id)?.lines.get(line)?;
        Some(LineStats {
            in_count: state.record.in_count,
            out_count: state.record.out_count,
            start: state.record.start,
            end: state.record.end,
            active_tracks: state.tracker.active_tracks(),
            cooldowns_pending: state.tracker.cooldowns_pending(),
        })
    }

    pub fn get_camera_summary(&self, camera_id: &str) -> Option<CameraSummary> {
        let inner = self.inner.lock();
        let camera = inner.cameras.get(camera_id)?;
        Some(CameraSummary {
            camera_id: camera_id.to_string(),
            zones: camera
                .zones
                .iter()
                .map(|(name, state)| {
                    (
                        name.clone(),
                        ZoneCounts {
                            in_count: state.record.in_count,
                            out_count: state.record.out_count,
                            occupancy: state.tracker.inside_ids().len(),
                        },
                    )
                })
                .collect(),
            lines: camera
                .lines
                .iter()
                .map(|(name, state)| {
                    (
                        name.clone(),
                        LineCounts {
                            in_count: state.record.in_count,
                            out_count: state.record.out_count,
                        },
                    )
                })
                .collect(),
        })
    }

    pub fn camera_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.lock().cameras.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Staleness sweep, rate limited to the configured interval. Returns
    /// whether a sweep actually ran.
    pub fn maybe_sweep(&self, now: DateTime<Utc>) -> bool {
        let mut inner = self.inner.lock();
        if let Some(last) = inner.last_sweep {
            if secs_between(last, now) < self.config.cleanup.sweep_interval_secs {
                return false;
            }
        }
        inner.last_sweep = Some(now);

        let cleanup = &self.config.cleanup;
        let mut removed = 0usize;
        for camera in inner.cameras.values_mut() {
            for zone in camera.zones.values_mut() {
                removed += zone.tracker.sweep_stale(
                    now,
                    cleanup.debounce_stale_secs,
                    cleanup.track_stale_secs,
                );
            }
            for line in camera.lines.values_mut() {
                removed += line.tracker.sweep_stale(now, cleanup.track_stale_secs);
            }
        }
        if removed > 0 {
            debug!(removed, "staleness sweep dropped tracking entries");
        }
        true
    }

    /// Snapshot of configuration and counters for persistence.
    pub fn export_state(&self) -> PersistedState {
        let inner = self.inner.lock();
        inner
            .cameras
            .iter()
            .map(|(camera_id, camera)| {
                (
                    camera_id.clone(),
                    CameraRecord {
                        zones: camera
                            .zones
                            .iter()
                            .map(|(name, state)| (name.clone(), state.record.clone()))
                            .collect(),
                        lines: camera
                            .lines
                            .iter()
                            .map(|(name, state)| (name.clone(), state.record.clone()))
                            .collect(),
                    },
                )
            })
            .collect()
    }

    /// Restore configuration and cumulative counts. All tracking state starts
    /// empty; occupancy is derived and cannot outlive a restart.
    pub fn load_state(&self, state: PersistedState) {
        let mut inner = self.inner.lock();
        inner.cameras.clear();
        for (camera_id, record) in state {
            let mut camera = CameraState::default();
            for (name, mut zone_record) in record.zones {
                zone_record.inside_ids.clear();
                camera.zones.insert(
                    name,
                    ZoneState {
                        record: zone_record,
                        tracker: ZoneOccupancyTracker::new(self.config.zones.clone()),
                    },
                );
            }
            for (name, line_record) in record.lines {
                camera.lines.insert(
                    name,
                    LineState {
                        record: line_record,
                        tracker: LineCrossingTracker::new(self.config.lines.clone()),
                    },
                );
            }
            inner.cameras.insert(camera_id, camera);
        }
        if inner.active_camera.is_none() {
            inner.active_camera = inner.cameras.keys().min().cloned();
        }
        info!(cameras = inner.cameras.len(), "restored persisted counter state");
    }
}

fn validate_zone(
    frame: &FrameConfig,
    zone: &str,
    top_left: [i32; 2],
    bottom_right: [i32; 2],
) -> Result<(), StoreError> {
    let fail = |reason: &str| StoreError::InvalidZoneGeometry {
        zone: zone.to_string(),
        reason: reason.to_string(),
    };
    if top_left[0] < 0 || top_left[1] < 0 {
        return Err(fail("top_left must be non-negative"));
    }
    if top_left[0] >= bottom_right[0] || top_left[1] >= bottom_right[1] {
        return Err(fail("top_left must be componentwise less than bottom_right"));
    }
    if bottom_right[0] > frame.width || bottom_right[1] > frame.height {
        return Err(fail("rectangle exceeds frame bounds"));
    }
    Ok(())
}

fn validate_line(
    frame: &FrameConfig,
    line: &str,
    start: [i32; 2],
    end: [i32; 2],
) -> Result<(), StoreError> {
    let fail = |reason: &str| StoreError::InvalidLineGeometry {
        line: line.to_string(),
        reason: reason.to_string(),
    };
    for p in [start, end] {
        if p[0] < 0 || p[1] < 0 {
            return Err(fail("endpoints must be non-negative"));
        }
        if p[0] > frame.width || p[1] > frame.height {
            return Err(fail("endpoint exceeds frame bounds"));
        }
    }
    if geometry::segment_length(start, end) < MIN_LINE_LENGTH {
        return Err(fail("segment shorter than minimum length"));
    }
    Ok(())
}
