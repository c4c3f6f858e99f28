// src/line_tracker.rs
//
// Per-line crossing detection with two gates in front of the side test:
//
//   1. Proximity: a person only interacts with the line while inside the
//      segment's padded bounding box. Leaving the box drops the track, so a
//      returning person must re-qualify from scratch.
//
//   2. Stability: a side must be held for `state_confirmation_frames` before
//      a flip counts. A flip on an unstable track is tracking jitter and
//      resets the track instead of counting.
//
// A counted crossing puts the person into a cooldown map and deletes the
// track; until the cooldown expires every detection for that person is
// ignored, which kills back-and-forth double counting from id jitter.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use tracing::debug;

use crate::geometry;
use crate::types::{CounterAction, LineTrackingConfig, PersonId, Point};

#[derive(Debug, Clone)]
struct LineTrack {
    position: Point,
    side: i32,
    frames_on_side: u32,
    stable: bool,
    last_seen: DateTime<Utc>,
}

/// A confirmed crossing. Direction comes from the sign of the side the
/// person landed on: `+1` is In, `-1` is Out.
#[derive(Debug, Clone, PartialEq)]
pub struct Crossing {
    pub id: PersonId,
    pub direction: CounterAction,
}

pub struct LineCrossingTracker {
    config: LineTrackingConfig,
    tracks: HashMap<PersonId, LineTrack>,
    cooldowns: HashMap<PersonId, DateTime<Utc>>,
}

impl LineCrossingTracker {
    pub fn new(config: LineTrackingConfig) -> Self {
        Self {
            config,
            tracks: HashMap::new(),
            cooldowns: HashMap::new(),
        }
    }

    pub fn update(
        &mut self,
        start: [i32; 2],
        end: [i32; 2],
        detections: &[(PersonId, Point)],
        now: DateTime<Utc>,
    ) -> Vec<Crossing> {
        let line_start = Point::new(start[0] as f32, start[1] as f32);
        let line_end = Point::new(end[0] as f32, end[1] as f32);
        let mut crossings = Vec::new();

        // Tracks for people no longer detected are dropped outright; their
        // side state is meaningless once the id disappears.
        let active: HashSet<&PersonId> = detections.iter().map(|(id, _)| id).collect();
        self.tracks.retain(|id, _| active.contains(id));

        // Purge expired cooldowns before the skip check below.
        self.cooldowns.retain(|_, expiry| now < *expiry);

        for (id, position) in detections {
            if self.cooldowns.contains_key(id) {
                continue;
            }

            if !geometry::near_segment(*position, line_start, line_end, self.config.proximity_padding)
            {
                // Left the qualifying box: must re-confirm on return.
                self.tracks.remove(id);
                continue;
            }

            let side = geometry::side_of_line(*position, line_start, line_end);
            if side == 0 {
                // Exactly collinear: unusable this frame, keep prior state.
                continue;
            }

            let Some(track) = self.tracks.get_mut(id) else {
                self.tracks.insert(
                    id.clone(),
                    LineTrack {
                        position: *position,
                        side,
                        frames_on_side: 1,
                        stable: false,
                        last_seen: now,
                    },
                );
                continue;
            };

            let displacement = geometry::distance(*position, track.position);
            if track.stable && displacement < self.config.min_movement_threshold {
                // Sub-threshold wiggle on a settled track is noise.
                continue;
            }

            if side != track.side {
                if track.stable {
                    let direction = if side > 0 {
                        CounterAction::In
                    } else {
                        CounterAction::Out
                    };
                    debug!(person = %id, ?direction, "line crossing confirmed");
                    crossings.push(Crossing {
                        id: id.clone(),
                        direction,
                    });
                    self.cooldowns.insert(
                        id.clone(),
                        now + chrono::Duration::milliseconds(
                            (self.config.crossing_cooldown_secs * 1000.0) as i64,
                        ),
                    );
                    // Full re-confirmation required before the next crossing.
                    self.tracks.remove(id);
                    continue;
                }
                // Side flip before confirmation: jitter, start over.
                track.side = side;
                track.frames_on_side = 1;
                track.stable = false;
            } else {
                track.frames_on_side += 1;
                if !track.stable && track.frames_on_side >= self.config.state_confirmation_frames {
                    track.stable = true;
                }
            }

            track.position = *position;
            track.last_seen = now;
        }

        crossings
    }

    pub fn clear(&mut self) {
        self.tracks.clear();
        self.cooldowns.clear();
    }

    /// Drop tracks not seen recently and cooldowns that have lapsed.
    pub fn sweep_stale(&mut self, now: DateTime<Utc>, track_stale_secs: f64) -> usize {
        let before = self.tracks.len() + self.cooldowns.len();
        self.tracks
            .retain(|_, track| crate::types::secs_between(track.last_seen, now) <= track_stale_secs);
        self.cooldowns.retain(|_, expiry| now < *expiry);
        before - (self.tracks.len() + self.cooldowns.len())
    }

    pub fn active_tracks(&self) -> usize {
        self.tracks.len()
    }

    pub fn cooldowns_pending(&self) -> usize {
        self.cooldowns.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    // Vertical line down the middle of a 640x480 frame.
    const START: [i32; 2] = [320, 0];
    const END: [i32; 2] = [320, 480];

    fn tracker() -> LineCrossingTracker {
        LineCrossingTracker::new(LineTrackingConfig::default())
    }

    fn t0() -> DateTime<Utc> {
        "2026-01-15T12:00:00Z".parse().unwrap()
    }

    fn det(id: i64, x: f32, y: f32) -> (PersonId, Point) {
        (PersonId::Num(id), Point::new(x, y))
    }

    /// Scenario C: three stable frames on side -1, then a flip to +1 counts
    /// exactly one crossing with direction derived from the new side.
    #[test]
    fn stable_flip_counts_once() {
        let mut tracker = tracker();
        // Right of a downward vertical line is side -1.
        for i in 0..3 {
            let crossings = tracker.update(
                START,
                END,
                &[det(2, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
            assert!(crossings.is_empty());
        }
        let crossings = tracker.update(
            START,
            END,
            &[det(2, 290.0, 240.0)],
            t0() + Duration::milliseconds(99),
        );
        assert_eq!(
            crossings,
            vec![Crossing {
                id: PersonId::Num(2),
                direction: CounterAction::In,
            }]
        );
        assert_eq!(tracker.active_tracks(), 0);
        assert_eq!(tracker.cooldowns_pending(), 1);
    }

    #[test]
    fn cooldown_blocks_immediate_return_crossing() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker.update(
                START,
                END,
                &[det(2, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
        }
        let first = tracker.update(
            START,
            END,
            &[det(2, 290.0, 240.0)],
            t0() + Duration::milliseconds(99),
        );
        assert_eq!(first.len(), 1);

        // Bounce back and forth within the 2 s cooldown: nothing counts,
        // no track state accumulates either.
        for i in 4..40 {
            let x = if i % 2 == 0 { 350.0 } else { 290.0 };
            let crossings = tracker.update(
                START,
                END,
                &[det(2, x, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
            assert!(crossings.is_empty());
        }

        // After expiry the person must fully re-confirm before counting.
        let after = t0() + Duration::seconds(3);
        for i in 0..3 {
            let crossings = tracker.update(
                START,
                END,
                &[det(2, 290.0, 240.0)],
                after + Duration::milliseconds(i * 33),
            );
            assert!(crossings.is_empty());
        }
        assert_eq!(tracker.cooldowns_pending(), 0);
        let crossings = tracker.update(
            START,
            END,
            &[det(2, 350.0, 240.0)],
            after + Duration::milliseconds(99),
        );
        assert_eq!(crossings.len(), 1);
        assert_eq!(crossings[0].direction, CounterAction::Out);
    }

    #[test]
    fn unstable_flip_is_jitter_not_crossing() {
        let mut tracker = tracker();
        // Two frames on one side (below state_confirmation_frames=3), flip.
        tracker.update(START, END, &[det(3, 350.0, 240.0)], t0());
        tracker.update(
            START,
            END,
            &[det(3, 351.0, 240.0)],
            t0() + Duration::milliseconds(33),
        );
        let crossings = tracker.update(
            START,
            END,
            &[det(3, 290.0, 240.0)],
            t0() + Duration::milliseconds(66),
        );
        assert!(crossings.is_empty());
        // The flip reset the track, so another two frames still cannot count.
        let crossings = tracker.update(
            START,
            END,
            &[det(3, 350.0, 240.0)],
            t0() + Duration::milliseconds(99),
        );
        assert!(crossings.is_empty());
        assert_eq!(tracker.active_tracks(), 1);
    }

    #[test]
    fn far_traffic_never_qualifies() {
        let mut tracker = tracker();
        // Crosses the infinite extension's x but is 60px past the padded box
        // off the end of the segment.
        for i in 0..5 {
            let x = if i < 3 { 350.0 } else { 290.0 };
            let crossings = tracker.update(
                START,
                END,
                &[det(4, x, 590.0)],
                t0() + Duration::milliseconds(i * 33),
            );
            assert!(crossings.is_empty());
        }
        assert_eq!(tracker.active_tracks(), 0);
    }

    #[test]
    fn leaving_proximity_box_drops_track() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker.update(
                START,
                END,
                &[det(5, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
        }
        assert_eq!(tracker.active_tracks(), 1);
        // Wanders out of the padded box: state must not survive.
        tracker.update(
            START,
            END,
            &[det(5, 500.0, 240.0)],
            t0() + Duration::milliseconds(99),
        );
        assert_eq!(tracker.active_tracks(), 0);
        // Returning and flipping immediately is therefore not a crossing.
        let crossings = tracker.update(
            START,
            END,
            &[det(5, 290.0, 240.0)],
            t0() + Duration::milliseconds(132),
        );
        assert!(crossings.is_empty());
    }

    #[test]
    fn sub_threshold_wiggle_on_stable_track_is_skipped() {
        let mut tracker = tracker();
        for i in 0..4 {
            tracker.update(
                START,
                END,
                &[det(6, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
        }
        // 3px moves are below min_movement_threshold=5 once stable.
        for i in 4..10 {
            let crossings = tracker.update(
                START,
                END,
                &[det(6, 352.0, 241.0)],
                t0() + Duration::milliseconds(i * 33),
            );
            assert!(crossings.is_empty());
        }
        assert_eq!(tracker.active_tracks(), 1);
    }

    #[test]
    fn collinear_point_skips_frame_only() {
        let mut tracker = tracker();
        tracker.update(START, END, &[det(7, 350.0, 240.0)], t0());
        // Exactly on the line: no side, state untouched.
        tracker.update(
            START,
            END,
            &[det(7, 320.0, 240.0)],
            t0() + Duration::milliseconds(33),
        );
        assert_eq!(tracker.active_tracks(), 1);
        // Continue on the original side; confirmation resumes from frame 1.
        for i in 2..4 {
            tracker.update(
                START,
                END,
                &[det(7, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
        }
        let crossings = tracker.update(
            START,
            END,
            &[det(7, 290.0, 240.0)],
            t0() + Duration::milliseconds(132),
        );
        assert_eq!(crossings.len(), 1);
    }

    #[test]
    fn vanished_person_loses_track_state() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker.update(
                START,
                END,
                &[det(8, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
        }
        tracker.update(START, END, &[], t0() + Duration::milliseconds(99));
        assert_eq!(tracker.active_tracks(), 0);
    }

    #[test]
    fn sweep_purges_lapsed_cooldowns() {
        let mut tracker = tracker();
        for i in 0..3 {
            tracker.update(
                START,
                END,
                &[det(9, 350.0, 240.0)],
                t0() + Duration::milliseconds(i * 33),
            );
        }
        tracker.update(
            START,
            END,
            &[det(9, 290.0, 240.0)],
            t0() + Duration::milliseconds(99),
        );
        assert_eq!(tracker.cooldowns_pending(), 1);
        let removed = tracker.sweep_stale(t0() + Duration::seconds(300), 120.0);
        assert_eq!(removed, 1);
        assert_eq!(tracker.cooldowns_pending(), 0);
    }
}
