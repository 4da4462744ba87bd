use ndarray::Array2;
use std::f64::consts::PI;
use std::thread;
use std::time::Duration;
use streamcore::math::{FftHelper, StatsHelper};
use streamcore::transport::{
    channel_transport, ChunkSender, PlaybackConfig, PlaybackEmitter, Recording,
};
use streamcore::{
    AcquisitionLoop, AcquisitionState, Channels, Chunk, CloseReason, FilterSpec, StreamConfig,
    StreamError, StreamHandle, StreamInfo,
};

/// Rows `start..start + rows` of a ramp where sample `i` on channel `c`
/// holds `i + 10_000 * c`, stamped at `i / rate`.
fn ramp(start: usize, rows: usize, channels: usize, rate: f64) -> Chunk {
    let samples =
        Array2::from_shape_fn((rows, channels), |(i, c)| ((start + i) + 10_000 * c) as f32);
    let timestamps = (start..start + rows).map(|i| i as f64 / rate).collect();
    Chunk::new(samples, timestamps).unwrap()
}

fn channel_stream(
    channels: usize,
    rate: f64,
    config: StreamConfig,
) -> (ChunkSender, AcquisitionLoop, StreamHandle) {
    let info = StreamInfo::with_channel_count("test", channels, rate);
    let (sender, transport) = channel_transport(info);
    let acquisition = AcquisitionLoop::named("test", transport, config).unwrap();
    let handle = acquisition.handle();
    (sender, acquisition, handle)
}

fn step_n(acquisition: &mut AcquisitionLoop, n: usize) {
    for _ in 0..n {
        acquisition.step().unwrap();
    }
}

#[test]
fn overwritten_samples_are_excluded_from_full_read() {
    let config = StreamConfig {
        buffer_seconds: 10.0,
        ..Default::default()
    };
    let (sender, mut acquisition, handle) = channel_stream(2, 100.0, config);
    for start in [0, 500, 1000] {
        sender.send(ramp(start, 500, 2, 100.0)).unwrap();
    }
    step_n(&mut acquisition, 4);

    let snapshot = handle.read(1000, &Channels::All).unwrap();
    assert_eq!(snapshot.len(), 1000);
    assert_eq!(snapshot.first_index, 500);
    assert_eq!(snapshot.samples[[0, 0]], 500.0);
    assert_eq!(snapshot.samples[[999, 0]], 1499.0);
    assert_eq!(snapshot.samples[[999, 1]], 11_499.0);
    assert!((snapshot.timestamps[0] - 5.0).abs() < 1e-9);

    let more = handle.read(1001, &Channels::All).unwrap();
    assert_eq!(more.len(), 1000);
}

#[test]
fn looped_playback_yields_continuous_time() {
    let rate = 100.0;
    let samples = Array2::from_shape_fn((1000, 2), |(i, c)| (i + c) as f32);
    let recording = Recording::new(samples, rate, vec!["C3".into(), "C4".into()]).unwrap();
    let playback = PlaybackConfig {
        chunk_size: 37,
        n_repeat: Some(2),
        realtime: false,
        start_time: Some(1_000.0),
        ..Default::default()
    };
    let emitter = PlaybackEmitter::new(recording, playback).unwrap();
    let mut acquisition = AcquisitionLoop::new(emitter, StreamConfig::default()).unwrap();
    let mut handle = acquisition.handle();

    let mut timestamps = Vec::new();
    while acquisition.step().unwrap() != AcquisitionState::Closed {
        let snapshot = handle.read_new(&Channels::labels(["C4"])).unwrap();
        assert_eq!(snapshot.missed, 0);
        timestamps.extend(snapshot.timestamps);
    }

    assert_eq!(timestamps.len(), 2000);
    assert!(timestamps.windows(2).all(|pair| pair[1] > pair[0]));
    let span = timestamps[1999] - timestamps[0] + 1.0 / rate;
    assert!((span - 20.0).abs() < 1e-6);
    assert_eq!(handle.status().close_reason, Some(CloseReason::EndOfStream));
    assert!(matches!(
        handle.read(1, &Channels::All),
        Err(StreamError::Closed(CloseReason::EndOfStream))
    ));
}

#[test]
fn concurrent_reader_never_sees_time_go_backwards() {
    let config = StreamConfig {
        buffer_seconds: 2.0,
        pull_timeout_ms: 5,
        ..Default::default()
    };
    let (sender, acquisition, handle) = channel_stream(3, 100.0, config);
    let worker = acquisition.spawn().unwrap();

    let producer = thread::spawn(move || {
        let mut start = 0;
        for round in 0..200 {
            let rows = 1 + (round * 7) % 23;
            sender.send(ramp(start, rows, 3, 100.0)).unwrap();
            if round > 0 && round % 17 == 0 {
                // stale chunk, must be dropped
                sender.send(ramp(start / 2, 3, 3, 100.0)).unwrap();
            }
            start += rows;
            if round % 10 == 0 {
                thread::sleep(Duration::from_millis(1));
            }
        }
        sender.finish();
        start
    });

    let mut reader = handle.clone();
    let mut seen = Vec::new();
    while !reader.is_closed() {
        match reader.read_new(&Channels::Indices(vec![2])) {
            Ok(snapshot) => seen.extend(snapshot.timestamps),
            Err(StreamError::Closed(_)) => break,
            Err(other) => panic!("unexpected read error: {}", other),
        }
    }

    let written = producer.join().unwrap();
    assert_eq!(worker.join().unwrap(), Ok(CloseReason::EndOfStream));
    assert_eq!(StatsHelper::max_regression(&seen), 0.0);
    assert!(seen.windows(2).all(|pair| pair[1] > pair[0]));

    let metrics = handle.metrics();
    assert_eq!(metrics.samples_written, written as u64);
    assert_eq!(metrics.dropped_out_of_order, 11);
}

#[test]
fn silence_after_running_closes_with_timeout() {
    let config = StreamConfig {
        silence_timeout_ms: 30,
        pull_timeout_ms: 5,
        ..Default::default()
    };
    let (sender, acquisition, handle) = channel_stream(2, 100.0, config);
    sender.send(ramp(0, 10, 2, 100.0)).unwrap();

    let outcome = acquisition.run();
    assert!(matches!(outcome, Err(StreamError::AcquisitionTimeout(_))));
    assert_eq!(handle.state(), AcquisitionState::Closed);
    assert_eq!(
        handle.read(5, &Channels::All),
        Err(StreamError::Closed(CloseReason::Timeout))
    );
    assert!(handle.metrics().empty_pulls > 0);
    drop(sender);
}

#[test]
fn channel_layout_change_closes_every_handle() {
    let (sender, mut acquisition, handle) = channel_stream(2, 100.0, StreamConfig::default());
    let other = handle.clone();
    sender.send(ramp(0, 10, 2, 100.0)).unwrap();
    sender.send(ramp(10, 10, 4, 100.0)).unwrap();
    acquisition.step().unwrap();
    acquisition.step().unwrap();
    assert_eq!(
        acquisition.step(),
        Err(StreamError::ChannelLayoutChanged {
            expected: 2,
            actual: 4
        })
    );
    for h in [&handle, &other] {
        assert_eq!(
            h.status().close_reason,
            Some(CloseReason::LayoutChanged {
                expected: 2,
                actual: 4
            })
        );
        assert!(h.read(1, &Channels::All).is_err());
    }
}

#[test]
fn non_finite_chunk_is_dropped_without_disturbing_filters() {
    let config = StreamConfig {
        filters: vec![FilterSpec::lowpass(10.0, 2)],
        ..Default::default()
    };
    let (sender, mut acquisition, handle) = channel_stream(2, 100.0, config);
    let clean = |start| ramp(start, 20, 2, 100.0);
    let mut poisoned = ramp(20, 20, 2, 100.0);
    poisoned.samples[[7, 1]] = f32::NAN;

    sender.send(clean(0)).unwrap();
    sender.send(poisoned).unwrap();
    sender.send(clean(20)).unwrap();
    step_n(&mut acquisition, 4);

    let metrics = handle.metrics();
    assert_eq!(metrics.rejected_non_finite, 1);
    assert_eq!(metrics.samples_written, 40);
    let snapshot = handle.read(40, &Channels::All).unwrap();
    assert!(snapshot.samples.iter().all(|v| v.is_finite()));

    // same two clean chunks through a fresh stream give identical output
    let config = StreamConfig {
        filters: vec![FilterSpec::lowpass(10.0, 2)],
        ..Default::default()
    };
    let (sender, mut reference, reference_handle) = channel_stream(2, 100.0, config);
    sender.send(clean(0)).unwrap();
    sender.send(clean(20)).unwrap();
    step_n(&mut reference, 3);
    let expected = reference_handle.read(40, &Channels::All).unwrap();
    assert_eq!(snapshot.samples, expected.samples);
}

#[test]
fn notch_removes_line_noise_from_live_stream() {
    let rate = 250.0;
    let config = StreamConfig {
        filters: vec![FilterSpec::notch(50.0, 30.0)],
        ..Default::default()
    };
    let (sender, mut acquisition, handle) = channel_stream(1, rate, config);
    let total = 1000;
    let signal: Vec<f32> = (0..total)
        .map(|i| {
            let t = i as f64 / rate;
            ((2.0 * PI * 7.0 * t).sin() + (2.0 * PI * 50.0 * t).sin()) as f32
        })
        .collect();

    let mut start = 0;
    let mut steps = 1;
    for rows in [13, 250, 1, 99, 137].iter().cycle() {
        if start >= total {
            break;
        }
        let rows = (*rows).min(total - start);
        let samples = Array2::from_shape_vec((rows, 1), signal[start..start + rows].to_vec()).unwrap();
        let timestamps = (start..start + rows).map(|i| i as f64 / rate).collect();
        sender.send(Chunk::new(samples, timestamps).unwrap()).unwrap();
        start += rows;
        steps += 1;
    }
    step_n(&mut acquisition, steps);

    let window = handle.read_seconds(2.0, &Channels::All).unwrap();
    assert_eq!(window.len(), 500);
    let filtered = window.column(0).to_vec();
    let mut fft = FftHelper::new(500);
    let line = fft.band_power(&filtered, rate, 49.0, 51.0);
    let rhythm = fft.band_power(&filtered, rate, 6.0, 8.0);
    assert!(line < 1e-3, "line power {}", line);
    assert!((rhythm - 0.5).abs() < 0.05, "rhythm power {}", rhythm);
}

#[test]
fn unstable_filter_is_refused_at_the_handle() {
    let (sender, mut acquisition, handle) = channel_stream(2, 100.0, StreamConfig::default());
    sender.send(ramp(0, 5, 2, 100.0)).unwrap();
    step_n(&mut acquisition, 2);

    assert!(matches!(
        handle.add_filter(FilterSpec::notch(50.0, 30.0)),
        Err(StreamError::UnstableFilter(_))
    ));
    assert!(matches!(
        handle.add_filter(FilterSpec::notch(10.0, 30.0).with_sampling_rate(250.0)),
        Err(StreamError::InvalidFilter(_))
    ));
    step_n(&mut acquisition, 1);
    assert!(handle.filters().is_empty());
    assert_eq!(handle.metrics().changes_applied, 0);
}

#[test]
fn resize_shrinks_the_window_at_the_next_boundary() {
    let (sender, mut acquisition, handle) = channel_stream(2, 100.0, StreamConfig::default());
    sender.send(ramp(0, 800, 2, 100.0)).unwrap();
    step_n(&mut acquisition, 2);

    let ticket = handle.resize_buffer(5.0).unwrap();
    assert_eq!(handle.read(1000, &Channels::All).unwrap().len(), 800);
    step_n(&mut acquisition, 1);
    assert!(handle.is_applied(&ticket));

    let snapshot = handle.read(1000, &Channels::All).unwrap();
    assert_eq!(snapshot.len(), 500);
    assert_eq!(snapshot.first_index, 300);
    assert_eq!(snapshot.samples[[0, 0]], 300.0);
}

#[test]
fn remove_filter_stops_filtering_at_next_chunk() {
    let (sender, mut acquisition, handle) = channel_stream(1, 100.0, StreamConfig::default());
    sender.send(ramp(0, 10, 1, 100.0)).unwrap();
    step_n(&mut acquisition, 2);

    let added = handle.add_filter(FilterSpec::highpass(5.0, 2)).unwrap();
    sender.send(ramp(10, 10, 1, 100.0)).unwrap();
    step_n(&mut acquisition, 1);
    let id = added.filter.unwrap();
    assert_eq!(handle.filters()[0].0, id);

    handle.remove_filter(id).unwrap();
    sender.send(ramp(20, 10, 1, 100.0)).unwrap();
    step_n(&mut acquisition, 1);
    assert!(handle.filters().is_empty());

    let snapshot = handle.read(30, &Channels::All).unwrap();
    let column = snapshot.column(0);
    // untouched before the add and after the removal
    assert_eq!(column[5], 5.0);
    assert_eq!(column[25], 25.0);
    assert_ne!(column[15], 15.0);
}

#[tokio::test]
async fn wait_applied_resolves_once_change_is_live() {
    let config = StreamConfig {
        pull_timeout_ms: 5,
        ..Default::default()
    };
    let (sender, acquisition, handle) = channel_stream(2, 250.0, config);
    sender.send(ramp(0, 25, 2, 250.0)).unwrap();
    let worker = acquisition.spawn().unwrap();

    handle.wait_until_running().await.unwrap();
    let ticket = handle.add_filter(FilterSpec::notch(60.0, 20.0)).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle.wait_applied(&ticket))
        .await
        .unwrap()
        .unwrap();
    assert!(handle.is_applied(&ticket));
    assert_eq!(handle.filters().len(), 1);

    let second = handle.reset_filters().unwrap();
    assert!(second.id > ticket.id);
    tokio::time::timeout(Duration::from_secs(5), handle.wait_applied(&second))
        .await
        .unwrap()
        .unwrap();

    handle.close();
    assert_eq!(worker.join().unwrap(), Ok(CloseReason::Requested));
    drop(sender);
}

#[tokio::test]
async fn wait_applied_reports_close_before_application() {
    let (sender, mut acquisition, handle) = channel_stream(2, 100.0, StreamConfig::default());
    sender.send(ramp(0, 5, 2, 100.0)).unwrap();
    step_n(&mut acquisition, 2);

    let ticket = handle.reset_filters().unwrap();
    handle.close();
    acquisition.step().unwrap();
    assert_eq!(
        handle.wait_applied(&ticket).await,
        Err(StreamError::Closed(CloseReason::Requested))
    );
}
