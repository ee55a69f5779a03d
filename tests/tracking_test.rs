use vidpipe_rs::enrichment::{EnrichmentCache, EnrichmentIntervals, EnrichmentStage, EnrichmentValue};
use vidpipe_rs::{Detection, IouTracker, TrackerConfig};

#[test]
fn test_basic_tracking() {
    let mut tracker = IouTracker::new(TrackerConfig::default());

    // Frame 1: One detection
    let tracks1 = tracker.update(vec![Detection::new(100.0, 100.0, 200.0, 200.0, 0.9)]);
    assert_eq!(tracks1.len(), 1);
    let id1 = tracks1[0].id;

    // Frame 2: Same object moved slightly
    let tracks2 = tracker.update(vec![Detection::new(105.0, 105.0, 205.0, 205.0, 0.9)]);
    assert_eq!(tracks2.len(), 1);
    assert_eq!(tracks2[0].id, id1);

    // Frame 3: Object disappears; the track is kept but not reported
    let tracks3 = tracker.update(vec![]);
    assert!(tracks3.is_empty());
    assert_eq!(tracker.live_tracks()[0].miss_count, 1);

    // Frame 4: Object reappears within the miss tolerance
    let tracks4 = tracker.update(vec![Detection::new(110.0, 110.0, 210.0, 210.0, 0.9)]);
    assert_eq!(tracks4.len(), 1);
    assert_eq!(tracks4[0].id, id1);
    assert_eq!(tracks4[0].miss_count, 0);
}

#[test]
fn test_small_shift_is_one_continuous_track() {
    let mut tracker = IouTracker::new(TrackerConfig::default());
    let a = tracker.update_frame(1, vec![Detection::new(0.0, 0.0, 10.0, 10.0, 0.9)]);
    let b = tracker.update_frame(2, vec![Detection::new(1.0, 1.0, 11.0, 11.0, 0.9)]);

    assert_eq!(a[0].id, b[0].id);
    assert_eq!(tracker.live_tracks().len(), 1);
    assert_eq!(b[0].last_seen_frame, 2);
}

#[test]
fn test_identity_survives_gap_up_to_tolerance() {
    let config = TrackerConfig {
        max_missing_frames: 5,
        ..Default::default()
    };
    let mut tracker = IouTracker::new(config);
    let det = || Detection::new(50.0, 50.0, 90.0, 90.0, 0.9);

    let id = tracker.update(vec![det()])[0].id;
    for _ in 0..5 {
        assert!(tracker.update(vec![]).is_empty());
    }
    assert_eq!(tracker.update(vec![det()])[0].id, id);
}

#[test]
fn test_ids_are_never_reused() {
    let config = TrackerConfig {
        max_missing_frames: 2,
        ..Default::default()
    };
    let mut tracker = IouTracker::new(config);
    let det = || Detection::new(50.0, 50.0, 90.0, 90.0, 0.9);

    let first = tracker.update(vec![det()])[0].id;
    for _ in 0..3 {
        tracker.update(vec![]);
    }
    let removed = tracker.drain_removed();
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].id, first);

    let second = tracker.update(vec![det()])[0].id;
    assert!(second > first);
}

#[test]
fn test_ties_prefer_lower_track_id() {
    let mut tracker = IouTracker::new(TrackerConfig::default());
    let same = || Detection::new(0.0, 0.0, 20.0, 20.0, 0.9);

    let spawned = tracker.update(vec![same(), same()]);
    assert_eq!(spawned.iter().map(|t| t.id).collect::<Vec<_>>(), vec![1, 2]);

    let next = tracker.update(vec![same()]);
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].id, 1);
}

#[test]
fn test_identity_assignment_is_reproducible() {
    let frames: Vec<Vec<Detection>> = (0..30)
        .map(|i| {
            let x = i as f32 * 2.0;
            let mut dets = vec![Detection::new(x, 0.0, x + 30.0, 30.0, 0.9)];
            if i % 7 != 3 {
                dets.push(Detection::new(200.0 - x, 100.0, 230.0 - x, 130.0, 0.8));
            }
            dets
        })
        .collect();

    let run = || {
        let mut tracker = IouTracker::new(TrackerConfig::default());
        frames
            .iter()
            .map(|dets| {
                tracker
                    .update(dets.clone())
                    .iter()
                    .map(|t| t.id)
                    .collect::<Vec<_>>()
            })
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}

#[test]
fn test_enrichment_refreshes_follow_tracks() {
    let mut tracker = IouTracker::new(TrackerConfig::default());
    let mut cache = EnrichmentCache::new(EnrichmentIntervals {
        clustering: 4,
        text_reading: 10,
    });

    let mut refreshed = Vec::new();
    for frame in 0..12u64 {
        let x = frame as f32;
        let tracks = tracker.update_frame(frame, vec![Detection::new(x, 0.0, x + 40.0, 40.0, 0.9)]);
        for track in &tracks {
            cache
                .maybe_refresh(track.id, frame, EnrichmentStage::Clustering, || {
                    refreshed.push(frame);
                    Ok::<_, std::convert::Infallible>(EnrichmentValue::Cluster(0))
                })
                .unwrap();
        }
    }
    assert_eq!(refreshed, vec![0, 4, 8]);
}
