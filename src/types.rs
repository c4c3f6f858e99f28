use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub frame: FrameConfig,
    pub zones: ZoneTrackingConfig,
    pub lines: LineTrackingConfig,
    pub cleanup: CleanupConfig,
    pub persistence: PersistenceConfig,
    pub feed: FeedConfig,
    pub logging: LoggingConfig,
}

/// Pixel dimensions of the frames the detector collaborator delivers.
/// Zone and line geometry is validated against these bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameConfig {
    pub width: i32,
    pub height: i32,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneTrackingConfig {
    /// Pixels the occupancy test rectangle is shrunk inward on each side.
    /// If the padding collapses the rectangle, the unpadded rectangle is used.
    pub zone_padding: i32,
    /// Consecutive consistent inside/outside classifications required before
    /// a person's state is trusted. Below this, frames are treated as noise.
    pub min_dwell_frames: u32,
    /// Seconds a person must remain stable-inside before an entry is counted.
    pub min_dwell_time_secs: f64,
    /// Seconds of stable-outside tolerated before an exit is confirmed.
    /// Re-entering within this window cancels the exit.
    pub exit_grace_secs: f64,
    /// Maximum retained history entries per zone; oldest dropped first.
    pub max_history: usize,
}

impl Default for ZoneTrackingConfig {
    fn default() -> Self {
        Self {
            zone_padding: 30,
            min_dwell_frames: 3,
            min_dwell_time_secs: 1.0,
            exit_grace_secs: 1.0,
            max_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineTrackingConfig {
    /// Pixels the segment's bounding box is expanded on all sides for the
    /// proximity gate. People outside this box never interact with the line.
    pub proximity_padding: f32,
    /// Frames a person must hold one side before a flip counts as a crossing.
    pub state_confirmation_frames: u32,
    /// Displacement (px) below which a stable track's frame is skipped as noise.
    pub min_movement_threshold: f32,
    /// Seconds after a counted crossing during which the same person is ignored.
    pub crossing_cooldown_secs: f64,
    /// Maximum retained history entries per line; oldest dropped first.
    pub max_history: usize,
}

impl Default for LineTrackingConfig {
    fn default() -> Self {
        Self {
            proximity_padding: 50.0,
            state_confirmation_frames: 3,
            min_movement_threshold: 5.0,
            crossing_cooldown_secs: 2.0,
            max_history: 1000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Minimum seconds between staleness sweeps.
    pub sweep_interval_secs: f64,
    /// Debounce buffers not updated for this long are dropped.
    pub debounce_stale_secs: f64,
    /// Dwell records and line tracks not seen for this long are dropped.
    pub track_stale_secs: f64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 300.0,
            debounce_stale_secs: 30.0,
            track_stale_secs: 120.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    pub state_path: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_path: "counter_state.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    /// How a position is derived from a detection bounding box.
    pub position_method: PositionMethod,
    /// Seconds between periodic count summaries pushed to the log.
    pub counts_push_interval_secs: f64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            position_method: PositionMethod::BottomCenter,
            counts_push_interval_secs: 5.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Tracking identifier assigned by the upstream detector. Numeric from tracker
/// output, string when an external system injects synthetic detections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PersonId {
    Num(i64),
    Text(String),
}

impl fmt::Display for PersonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{n}"),
            Self::Text(s) => write!(f, "{s}"),
        }
    }
}

impl From<i64> for PersonId {
    fn from(n: i64) -> Self {
        Self::Num(n)
    }
}

impl From<&str> for PersonId {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// One person detection within a frame, as delivered by the detector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Detection {
    pub id: PersonId,
    #[serde(flatten)]
    pub shape: DetectionShape,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionShape {
    /// Full bounding box: x1, y1, x2, y2.
    Bbox([f32; 4]),
    /// Pre-extracted position: x, y.
    Point([f32; 2]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMethod {
    Center,
    BottomCenter,
}

/// One frame's worth of detections for a single camera, as read off the feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FrameMessage {
    pub camera_id: String,
    /// Raw values so one malformed entry can be dropped without losing the frame.
    pub detections: Vec<serde_json::Value>,
}

/// Confirmed transition kinds. Entered/Exited belong to zones, In/Out to lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterAction {
    Entered,
    Exited,
    In,
    Out,
}

impl CounterAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Entered => "Entered",
            Self::Exited => "Exited",
            Self::In => "In",
            Self::Out => "Out",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub id: PersonId,
    pub action: CounterAction,
    pub time: DateTime<Utc>,
}

/// Persisted per-zone record: geometry plus cumulative counts and history.
/// `inside_ids` is derived occupancy and is rebuilt empty on reload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneRecord {
    pub top_left: [i32; 2],
    pub bottom_right: [i32; 2],
    pub in_count: u64,
    pub out_count: u64,
    #[serde(default)]
    pub inside_ids: Vec<PersonId>,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
}

impl ZoneRecord {
    pub fn new(top_left: [i32; 2], bottom_right: [i32; 2]) -> Self {
        Self {
            top_left,
            bottom_right,
            in_count: 0,
            out_count: 0,
            inside_ids: Vec::new(),
            history: VecDeque::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineRecord {
    pub start: [i32; 2],
    pub end: [i32; 2],
    pub in_count: u64,
    pub out_count: u64,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
}

impl LineRecord {
    pub fn new(start: [i32; 2], end: [i32; 2]) -> Self {
        Self {
            start,
            end,
            in_count: 0,
            out_count: 0,
            history: VecDeque::new(),
        }
    }
}

/// Append to a bounded history, dropping the oldest entry when full.
pub fn push_history(history: &mut VecDeque<HistoryEntry>, entry: HistoryEntry, cap: usize) {
    if cap == 0 {
        return;
    }
    while history.len() >= cap {
        history.pop_front();
    }
    history.push_back(entry);
}

/// Elapsed seconds between two timestamps, as the update paths measure dwell.
pub fn secs_between(earlier: DateTime<Utc>, later: DateTime<Utc>) -> f64 {
    (later - earlier).num_milliseconds() as f64 / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn person_id_accepts_numbers_and_strings() {
        let n: PersonId = serde_json::from_str("42").unwrap();
        assert_eq!(n, PersonId::Num(42));
        let s: PersonId = serde_json::from_str("\"track-7\"").unwrap();
        assert_eq!(s, PersonId::Text("track-7".to_string()));
    }

    #[test]
    fn detection_deserializes_both_shapes() {
        let d: Detection =
            serde_json::from_str(r#"{"id":1,"bbox":[10.0,20.0,30.0,40.0]}"#).unwrap();
        assert!(matches!(d.shape, DetectionShape::Bbox(_)));
        let d: Detection = serde_json::from_str(r#"{"id":"p1","point":[5.0,6.0]}"#).unwrap();
        assert!(matches!(d.shape, DetectionShape::Point(_)));
    }

    #[test]
    fn history_cap_drops_oldest_first() {
        let mut h = VecDeque::new();
        let t = Utc::now();
        for i in 0..5 {
            push_history(
                &mut h,
                HistoryEntry {
                    id: PersonId::Num(i),
                    action: CounterAction::Entered,
                    time: t,
                },
                3,
            );
        }
        assert_eq!(h.len(), 3);
        assert_eq!(h.front().unwrap().id, PersonId::Num(2));
        assert_eq!(h.back().unwrap().id, PersonId::Num(4));
    }

    #[test]
    fn secs_between_is_signed_milliseconds() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::milliseconds(1500);
        assert!((secs_between(t0, t1) - 1.5).abs() < 1e-9);
    }
}
