//! Temporal event detection over the tracked object stream.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::events::event::{Event, EventKind, Severity};
use crate::events::zone::Zone;
use crate::tracker::{Track, TrackId};

/// Thresholds for event detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Frame rate used to convert frames to seconds
    pub fps: u32,
    /// Dwell time inside a zone before a `dwell` event fires
    pub dwell_seconds: f64,
    /// Minimum frames between repeated dwell/proximity events for one subject
    pub cooldown_frames: u64,
    /// Consecutive frames inside a zone before entry is confirmed
    pub zone_entry_frames: u32,
    /// Distance under which two tracks raise `proximity`; disabled when `None`
    pub proximity_distance: Option<f64>,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            dwell_seconds: 3.0,
            cooldown_frames: 60,
            zone_entry_frames: 1,
            proximity_distance: None,
        }
    }
}

impl EventConfig {
    /// Dwell threshold in frames, at least one.
    pub fn dwell_frames(&self) -> u64 {
        (self.dwell_seconds * self.fps.max(1) as f64).round().max(1.0) as u64
    }

    fn frames_to_seconds(&self, frames: u64) -> f64 {
        frames as f64 / self.fps.max(1) as f64
    }
}

/// Live `(track, zone)` membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneMembership {
    pub entered_at_frame: u64,
    pub last_dwell_frame: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct PendingEntry {
    first_frame: u64,
    streak: u32,
}

type MembershipKey = (TrackId, String);

/// Per `(track, zone)` outside/inside state machine plus pairwise proximity.
///
/// `zone_entry` and `zone_exit` are never suppressed, so they alternate
/// strictly per pair. `dwell` and `proximity` are throttled by the cooldown.
/// Proximity cooldown is tracked per unordered pair of track ids.
#[derive(Debug, Default)]
pub struct EventStateMachine {
    config: EventConfig,
    memberships: BTreeMap<MembershipKey, ZoneMembership>,
    pending: HashMap<MembershipKey, PendingEntry>,
    proximity_last: HashMap<(TrackId, TrackId), u64>,
}

impl EventStateMachine {
    pub fn new(config: EventConfig) -> Self {
        Self {
            config,
            ..Default::default()
        }
    }

    pub fn config(&self) -> &EventConfig {
        &self.config
    }

    /// Advance one frame. `tracks` are the tracks visible on `frame`.
    pub fn step(&mut self, tracks: &[Track], zones: &[Zone], frame: u64) -> Vec<Event> {
        let mut events = Vec::new();

        let mut ordered: Vec<&Track> = tracks.iter().collect();
        ordered.sort_by_key(|t| t.id);

        for track in &ordered {
            let point = track.anchor();
            for zone in zones {
                let key = (track.id, zone.name.clone());
                if zone.contains(&point) {
                    self.on_inside(key, frame, &mut events);
                } else {
                    self.on_outside(key, frame, &mut events);
                }
            }
        }

        if let Some(threshold) = self.config.proximity_distance {
            self.check_proximity(&ordered, threshold, frame, &mut events);
        }

        events
    }

    /// Force-exit every zone held by a destroyed track.
    pub fn retire(&mut self, track_id: TrackId, frame: u64) -> Vec<Event> {
        let held: Vec<MembershipKey> = self
            .memberships
            .keys()
            .filter(|(id, _)| *id == track_id)
            .cloned()
            .collect();

        let mut events = Vec::with_capacity(held.len());
        for key in held {
            if let Some(membership) = self.memberships.remove(&key) {
                debug!(track_id, zone = %key.1, frame, "forced zone exit");
                events.push(self.exit_event(&key, membership, frame).detail("forced", true));
            }
        }

        self.pending.retain(|(id, _), _| *id != track_id);
        self.proximity_last
            .retain(|(a, b), _| *a != track_id && *b != track_id);
        events
    }

    /// Number of tracks currently inside `zone`.
    pub fn occupancy(&self, zone: &str) -> usize {
        self.memberships.keys().filter(|(_, name)| name == zone).count()
    }

    pub fn membership(&self, track_id: TrackId, zone: &str) -> Option<ZoneMembership> {
        self.memberships
            .get(&(track_id, zone.to_string()))
            .copied()
    }

    fn on_inside(&mut self, key: MembershipKey, frame: u64, events: &mut Vec<Event>) {
        if !self.memberships.contains_key(&key) {
            let pending = self.pending.entry(key.clone()).or_insert(PendingEntry {
                first_frame: frame,
                streak: 0,
            });
            pending.streak += 1;
            if pending.streak < self.config.zone_entry_frames.max(1) {
                return;
            }

            let entered_at_frame = pending.first_frame;
            self.pending.remove(&key);
            self.memberships.insert(
                key.clone(),
                ZoneMembership {
                    entered_at_frame,
                    last_dwell_frame: None,
                },
            );
            events.push(
                Event::new(frame, EventKind::ZoneEntry, key.0, Severity::Info)
                    .detail("zone", key.1.as_str()),
            );
        }

        self.check_dwell(&key, frame, events);
    }

    fn on_outside(&mut self, key: MembershipKey, frame: u64, events: &mut Vec<Event>) {
        self.pending.remove(&key);
        if let Some(membership) = self.memberships.remove(&key) {
            events.push(self.exit_event(&key, membership, frame));
        }
    }

    fn check_dwell(&mut self, key: &MembershipKey, frame: u64, events: &mut Vec<Event>) {
        let dwell_frames = self.config.dwell_frames();
        let cooldown = self.config.cooldown_frames;
        let Some(membership) = self.memberships.get_mut(key) else {
            return;
        };

        let elapsed = frame.saturating_sub(membership.entered_at_frame);
        if elapsed < dwell_frames {
            return;
        }
        if let Some(last) = membership.last_dwell_frame {
            if frame.saturating_sub(last) < cooldown {
                return;
            }
        }
        membership.last_dwell_frame = Some(frame);

        let severity = if elapsed >= dwell_frames.saturating_mul(2) {
            Severity::Critical
        } else {
            Severity::Warning
        };
        let dwell_seconds = self.config.frames_to_seconds(elapsed);
        events.push(
            Event::new(frame, EventKind::Dwell, key.0, severity)
                .detail("zone", key.1.as_str())
                .detail("dwell_seconds", dwell_seconds)
                .detail("threshold_seconds", self.config.dwell_seconds),
        );
    }

    fn check_proximity(
        &mut self,
        tracks: &[&Track],
        threshold: f64,
        frame: u64,
        events: &mut Vec<Event>,
    ) {
        for (i, a) in tracks.iter().enumerate() {
            for b in &tracks[i + 1..] {
                let distance = a.anchor().distance(&b.anchor());
                if distance >= threshold {
                    continue;
                }
                let pair = (a.id.min(b.id), a.id.max(b.id));
                if let Some(last) = self.proximity_last.get(&pair) {
                    if frame.saturating_sub(*last) < self.config.cooldown_frames {
                        continue;
                    }
                }
                self.proximity_last.insert(pair, frame);
                events.push(
                    Event::new(frame, EventKind::Proximity, pair.0, Severity::Warning)
                        .detail("other_id", pair.1)
                        .detail("distance", distance),
                );
            }
        }
    }

    fn exit_event(&self, key: &MembershipKey, membership: ZoneMembership, frame: u64) -> Event {
        let inside_frames = frame.saturating_sub(membership.entered_at_frame);
        Event::new(frame, EventKind::ZoneExit, key.0, Severity::Info)
            .detail("zone", key.1.as_str())
            .detail("dwell_seconds", self.config.frames_to_seconds(inside_frames))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::{Detection, Point};

    fn track_at(id: TrackId, x: f64, y: f64) -> Track {
        let mut track = Track::spawn(id, Detection::new(0.0, 0.0, 1.0, 1.0, 0.9), 0);
        track.world_position = Some(Point::new(x, y));
        track
    }

    fn gate() -> Vec<Zone> {
        vec![Zone::rect("gate", 10.0, 10.0, 60.0, 60.0)]
    }

    #[test]
    fn test_entry_debounce() {
        let mut machine = EventStateMachine::new(EventConfig {
            zone_entry_frames: 3,
            ..Default::default()
        });
        let zones = gate();
        let inside = [track_at(1, 20.0, 20.0)];

        assert!(machine.step(&inside, &zones, 5).is_empty());
        assert!(machine.step(&inside, &zones, 6).is_empty());
        let events = machine.step(&inside, &zones, 7);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ZoneEntry);
        assert_eq!(machine.membership(1, "gate").unwrap().entered_at_frame, 5);
    }

    #[test]
    fn test_dwell_severity_escalates() {
        let mut machine = EventStateMachine::new(EventConfig {
            fps: 10,
            dwell_seconds: 1.0,
            cooldown_frames: 10,
            ..Default::default()
        });
        let zones = gate();
        let inside = [track_at(1, 20.0, 20.0)];

        let mut dwell = Vec::new();
        for frame in 0..=20 {
            dwell.extend(
                machine
                    .step(&inside, &zones, frame)
                    .into_iter()
                    .filter(|e| e.kind == EventKind::Dwell),
            );
        }
        let frames: Vec<u64> = dwell.iter().map(|e| e.frame).collect();
        assert_eq!(frames, vec![10, 20]);
        assert_eq!(dwell[0].severity, Severity::Warning);
        assert_eq!(dwell[1].severity, Severity::Critical);
    }

    #[test]
    fn test_retire_forces_exit() {
        let mut machine = EventStateMachine::new(EventConfig::default());
        let zones = gate();
        machine.step(&[track_at(3, 20.0, 20.0)], &zones, 0);
        assert_eq!(machine.occupancy("gate"), 1);

        let events = machine.retire(3, 12);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::ZoneExit);
        assert_eq!(events[0].details["forced"], true);
        assert_eq!(machine.occupancy("gate"), 0);
        assert!(machine.retire(3, 13).is_empty());
    }

    #[test]
    fn test_proximity_per_pair_cooldown() {
        let mut machine = EventStateMachine::new(EventConfig {
            cooldown_frames: 5,
            proximity_distance: Some(10.0),
            ..Default::default()
        });
        let close = [
            track_at(1, 0.0, 0.0),
            track_at(2, 3.0, 0.0),
            track_at(3, 0.0, 4.0),
        ];

        let first = machine.step(&close, &[], 0);
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|e| e.kind == EventKind::Proximity));
        assert_eq!(first[0].object_id, 1);
        assert_eq!(first[0].details["other_id"], 2);

        assert!(machine.step(&close, &[], 4).is_empty());
        assert_eq!(machine.step(&close, &[], 5).len(), 3);
    }

    #[test]
    fn test_far_tracks_raise_nothing() {
        let mut machine = EventStateMachine::new(EventConfig {
            proximity_distance: Some(10.0),
            ..Default::default()
        });
        let far = [track_at(1, 0.0, 0.0), track_at(2, 100.0, 0.0)];
        assert!(machine.step(&far, &[], 0).is_empty());
    }
}
