use super::*;
use chrono::{DateTime, Duration, TimeZone, Utc};

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 7, 0, 0).unwrap()
}

fn at(seconds: i64) -> DateTime<Utc> {
    base_time() + Duration::seconds(seconds)
}

fn sample(lat: f64, lon: f64, seconds: u64, accuracy: f64) -> LocationSample {
    LocationSample::new(lat, lon, at(seconds as i64), seconds * 1000)
        .unwrap()
        .with_accuracy(accuracy)
}

fn engine() -> MetricsEngine {
    MetricsEngine::new(MetricsConfig::default(), base_time())
}

#[test]
fn straight_line_distance_and_duration() {
    let mut engine = engine();

    let first = engine.accept(&sample(37.0000, -122.0000, 0, 3.0)).unwrap();
    assert_eq!(first.gps_quality, GpsQuality::Excellent);
    assert_eq!(first.distance_m, 0.0);

    let second = engine.accept(&sample(37.0005, -122.0000, 5, 4.0)).unwrap();
    assert_eq!(second.gps_quality, GpsQuality::Excellent);
    assert!(
        (55.0..56.2).contains(&second.distance_m),
        "0.0005 deg of latitude is roughly 55.5m, got {}",
        second.distance_m
    );
    assert_eq!(second.elapsed_ms, 5000);
    assert_eq!(second.accepted_samples, 2);
}

#[test]
fn rejects_samples_above_accuracy_ceiling() {
    let mut engine = engine();
    engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();
    let before = engine.snapshot(at(5));

    let err = engine
        .accept(&sample(37.0005, -122.0, 5, 35.0))
        .unwrap_err();
    assert!(matches!(err, SampleRejected::AccuracyExceeded { .. }));

    let after = engine.snapshot(at(5));
    assert_eq!(before, after, "rejected sample must leave totals untouched");
}

#[test]
fn accepts_samples_at_the_ceiling_exactly() {
    let mut engine = engine();
    let snap = engine.accept(&sample(37.0, -122.0, 0, 20.0)).unwrap();
    assert_eq!(snap.gps_quality, GpsQuality::Fair);
}

#[test]
fn rejects_out_of_order_timestamps() {
    let mut engine = engine();
    engine.accept(&sample(37.0, -122.0, 10, 3.0)).unwrap();

    let equal = engine.accept(&sample(37.0001, -122.0, 10, 3.0)).unwrap_err();
    assert!(matches!(equal, SampleRejected::OutOfOrder { .. }));

    let older = engine.accept(&sample(37.0001, -122.0, 5, 3.0)).unwrap_err();
    assert!(matches!(older, SampleRejected::OutOfOrder { .. }));
}

#[test]
fn rejects_out_of_range_coordinates() {
    assert!(matches!(
        LocationSample::new(91.0, 0.0, base_time(), 0),
        Err(SampleRejected::CoordinatesOutOfRange { .. })
    ));
    assert!(matches!(
        LocationSample::new(0.0, -181.0, base_time(), 0),
        Err(SampleRejected::CoordinatesOutOfRange { .. })
    ));
    assert!(LocationSample::new(-90.0, 180.0, base_time(), 0).is_ok());
}

#[test]
fn distance_is_monotonically_non_decreasing() {
    let mut engine = engine();
    let mut previous = 0.0;
    for step in 0..40u64 {
        let lat = 37.0 + step as f64 * 0.00004;
        let snap = engine.accept(&sample(lat, -122.0, step * 3, 5.0)).unwrap();
        assert!(snap.distance_m >= previous);
        previous = snap.distance_m;
    }
    assert!(previous > 100.0);
}

#[test]
fn implausible_jump_adds_no_distance_but_moves_last_position() {
    let mut engine = engine();
    engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();

    // A full degree of latitude in five seconds is far beyond plausible.
    let jumped = engine.accept(&sample(38.0, -122.0, 5, 3.0)).unwrap();
    assert_eq!(jumped.distance_m, 0.0);
    assert_eq!(jumped.accepted_samples, 2);

    // The next step is measured from the jump target, not the origin.
    let resumed = engine.accept(&sample(38.0001, -122.0, 10, 3.0)).unwrap();
    assert!(
        (10.0..13.0).contains(&resumed.distance_m),
        "expected ~11m from the jump point, got {}",
        resumed.distance_m
    );
}

#[test]
fn instantaneous_values_need_two_window_samples() {
    let mut engine = engine();

    let one = engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();
    assert_eq!(one.instant_pace_s_per_km, None);
    assert_eq!(one.instant_speed_mps, None);

    let two = engine.accept(&sample(37.0005, -122.0, 5, 3.0)).unwrap();
    let speed = two.instant_speed_mps.unwrap();
    assert!((10.0..12.0).contains(&speed), "55.5m over 5s, got {speed}");
    let pace = two.instant_pace_s_per_km.unwrap();
    assert!((85.0..100.0).contains(&pace));
}

#[test]
fn window_prunes_stale_samples() {
    let mut engine = engine();
    engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();
    engine.accept(&sample(37.0005, -122.0, 5, 3.0)).unwrap();

    // 40s later both earlier samples have left the 30s window.
    let late = engine.accept(&sample(37.0010, -122.0, 45, 3.0)).unwrap();
    assert_eq!(late.instant_speed_mps, None);
}

#[test]
fn quality_degrades_to_signal_lost_after_timeout() {
    let mut engine = engine();
    let accepted = engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();
    assert_eq!(accepted.gps_quality, GpsQuality::Excellent);

    let fresh = engine.snapshot(at(10));
    assert_eq!(fresh.gps_quality, GpsQuality::Excellent);

    let stale = engine.snapshot(at(16));
    assert_eq!(stale.gps_quality, GpsQuality::SignalLost);
    assert_eq!(stale.instant_speed_mps, None);
}

#[test]
fn quality_buckets_match_accuracy_ranges() {
    assert_eq!(GpsQuality::from_accuracy(3.0), GpsQuality::Excellent);
    assert_eq!(GpsQuality::from_accuracy(5.0), GpsQuality::Excellent);
    assert_eq!(GpsQuality::from_accuracy(8.0), GpsQuality::Good);
    assert_eq!(GpsQuality::from_accuracy(15.0), GpsQuality::Fair);
    assert_eq!(GpsQuality::from_accuracy(50.0), GpsQuality::Poor);
    assert_eq!(GpsQuality::from_accuracy(80.0), GpsQuality::SignalLost);
    assert!(GpsQuality::Poor.is_degraded());
    assert!(GpsQuality::SignalLost.is_degraded());
    assert!(!GpsQuality::Fair.is_degraded());
}

#[test]
fn pause_freezes_elapsed_time() {
    let mut engine = engine();
    engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();

    engine.pause(at(10));
    let paused = engine.snapshot(at(60));
    assert_eq!(paused.elapsed_ms, 10_000);

    engine.resume(at(60));
    let resumed = engine.snapshot(at(70));
    assert_eq!(resumed.elapsed_ms, 20_000);
}

#[test]
fn elevation_gain_and_loss_accumulate_separately() {
    let mut engine = engine();
    engine
        .accept(&sample(37.0000, -122.0, 0, 3.0).with_altitude(100.0))
        .unwrap();
    engine
        .accept(&sample(37.0001, -122.0, 5, 3.0).with_altitude(106.0))
        .unwrap();
    engine
        .accept(&sample(37.0002, -122.0, 10, 3.0).with_altitude(104.0))
        .unwrap();
    let snap = engine
        .accept(&sample(37.0003, -122.0, 15, 3.0).with_altitude(109.0))
        .unwrap();

    assert_eq!(snap.elevation_gain_m, 11.0);
    assert_eq!(snap.elevation_loss_m, 2.0);
}

#[test]
fn calories_grow_with_movement() {
    let mut engine = engine();
    let mut snap = engine.accept(&sample(37.0, -122.0, 0, 3.0)).unwrap();
    assert_eq!(snap.calories_kcal, 0.0);

    for step in 1..=60u64 {
        let lat = 37.0 + step as f64 * 0.00025;
        snap = engine.accept(&sample(lat, -122.0, step * 10, 3.0)).unwrap();
    }
    // Ten minutes at roughly 10km/h should land in the ballpark of 100kcal
    // for the default 70kg runner.
    assert!(
        (60.0..160.0).contains(&snap.calories_kcal),
        "got {}",
        snap.calories_kcal
    );
}

#[test]
fn missing_accuracy_is_accepted_at_the_ceiling() {
    let mut engine = engine();
    let sample = LocationSample::new(37.0, -122.0, base_time(), 0).unwrap();
    let snap = engine.accept(&sample).unwrap();
    assert_eq!(snap.gps_quality, GpsQuality::Fair);
}

#[test]
fn restore_continues_distance_from_snapshot() {
    let mut original = engine();
    let mut tail = Vec::new();
    for step in 0..5u64 {
        let s = sample(37.0 + step as f64 * 0.0001, -122.0, step * 5, 3.0);
        original.accept(&s).unwrap();
        tail.push(s);
    }
    let parked = original.snapshot(at(20));

    let mut restored = MetricsEngine::restore(
        MetricsConfig::default(),
        &parked,
        parked.elapsed_ms,
        &tail,
    );
    restored.resume(at(22));

    let continued = restored
        .accept(&sample(37.0005, -122.0, 25, 3.0))
        .unwrap();
    assert!(continued.distance_m > parked.distance_m);
    assert_eq!(continued.accepted_samples, 6);
    assert!(continued.instant_speed_mps.is_some());
}
