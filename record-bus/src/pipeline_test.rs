use std::time::Instant;

use super::*;
use crate::mock::{MockBackend, MockOptions, WriterCall};

fn config() -> PipelineConfig {
    PipelineConfig {
        poll_interval: Duration::from_millis(5),
        ..PipelineConfig::default()
    }
}

fn setup(options: MockOptions) -> (Arc<MockBackend>, Pipeline) {
    let backend = Arc::new(MockBackend::new(options));
    let pipeline = Pipeline::new(backend.clone(), config());
    (backend, pipeline)
}

fn grant(with_audio: bool) -> CaptureGrant {
    let grant = CaptureGrant::new(CaptureTarget::new(":0.0"));
    if with_audio {
        grant.with_audio(AudioTarget {
            device: "default".to_string(),
        })
    } else {
        grant
    }
}

fn output() -> PathBuf {
    std::env::temp_dir().join("record-bus-pipeline-test.mp4")
}

fn wait_for(timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

#[test]
fn test_video_only_recording() {
    let (backend, pipeline) = setup(MockOptions::default());
    let recording = pipeline.start(grant(false), false, &output()).unwrap();
    assert!(!recording.has_audio());
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));
    assert!(wait_for(Duration::from_secs(1), || backend.writer().writes() > 0));

    let report = recording.stop().unwrap().wait();
    assert!(report.container_started);
    assert_eq!(report.tracks.len(), 1);
    assert!(!report.has_audio());
    assert!(report.muxer.written > 0);
    assert!(report.release_errors.is_empty());
    assert_eq!(
        backend.log(),
        vec!["detach capture", "release video encoder", "finalize container"]
    );
}

#[test]
fn test_recording_with_audio_releases_in_order() {
    let (backend, pipeline) = setup(MockOptions::default());
    let recording = pipeline.start(grant(true), true, &output()).unwrap();
    assert!(recording.has_audio());
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));
    assert_eq!(recording.tracks().len(), 2);
    std::thread::sleep(Duration::from_millis(30));

    let report = recording.stop().unwrap().wait();
    assert!(report.has_audio());
    assert!(report.audio.is_some_and(|s| s.written > 0));
    assert!(report.video.is_some_and(|s| s.written > 0));
    assert_eq!(
        backend.log(),
        vec![
            "detach capture",
            "release video encoder",
            "release audio source",
            "release audio encoder",
            "finalize container",
        ]
    );
    assert_eq!(
        backend.writer().count(|c| *c == WriterCall::Finish),
        1
    );
}

#[test]
fn test_audio_requires_permission() {
    let (_backend, pipeline) = setup(MockOptions::default());
    let recording = pipeline.start(grant(false), true, &output()).unwrap();
    assert!(!recording.has_audio());
    let report = recording.stop().unwrap().wait();
    assert!(!report.has_audio());
}

#[test]
fn test_unavailable_audio_source_records_video_only() {
    let (backend, pipeline) = setup(MockOptions {
        audio_source_unavailable: true,
        ..MockOptions::default()
    });
    let recording = pipeline.start(grant(true), true, &output()).unwrap();
    assert!(!recording.has_audio());
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));

    let report = recording.stop().unwrap().wait();
    assert_eq!(report.tracks.len(), 1);
    assert!(!backend.log().iter().any(|e| e.contains("audio")));
}

#[test]
fn test_failing_audio_source_degrades_to_video_only() {
    let (backend, pipeline) = setup(MockOptions {
        audio_source_fails_after: Some(0),
        audio_format_delay: Duration::from_secs(10),
        ..MockOptions::default()
    });
    let recording = pipeline.start(grant(true), true, &output()).unwrap();
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));
    assert_eq!(recording.tracks().len(), 1);
    assert!(wait_for(Duration::from_secs(1), || backend.writer().writes() > 0));

    let report = recording.stop().unwrap().wait();
    assert!(report.container_started);
    assert!(!report.has_audio());
    assert!(backend.log().contains(&"release audio source".to_string()));
}

#[test]
fn test_video_configuration_failure_aborts() {
    let (backend, pipeline) = setup(MockOptions {
        video_configure_fails: true,
        ..MockOptions::default()
    });
    let err = pipeline.start(grant(true), true, &output()).err().unwrap();
    assert!(matches!(
        err,
        RecordError::Configuration {
            role: TrackRole::Video,
            ..
        }
    ));
    assert_eq!(backend.log(), vec!["release video encoder"]);
    assert!(backend.writer().calls().is_empty());
}

#[test]
fn test_container_failure_releases_everything_in_order() {
    let (backend, pipeline) = setup(MockOptions {
        container_open_fails: true,
        ..MockOptions::default()
    });
    let err = pipeline.start(grant(true), true, &output()).err().unwrap();
    assert!(matches!(err, RecordError::Container(_)));
    assert_eq!(
        backend.log(),
        vec![
            "release video encoder",
            "release audio source",
            "release audio encoder",
        ]
    );
}

#[test]
fn test_revoked_grant_is_rejected() {
    let (backend, pipeline) = setup(MockOptions::default());
    let grant = grant(false);
    grant.revoker().revoke();
    assert!(matches!(
        pipeline.start(grant, false, &output()),
        Err(RecordError::GrantRevoked)
    ));
    assert!(backend.log().is_empty());
}

#[test]
fn test_release_failures_do_not_skip_later_steps() {
    let (backend, pipeline) = setup(MockOptions {
        capture_detach_fails: true,
        video_release_fails: true,
        ..MockOptions::default()
    });
    let recording = pipeline.start(grant(false), false, &output()).unwrap();
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));

    let report = recording.stop().unwrap().wait();
    assert_eq!(report.release_errors.len(), 2);
    assert_eq!(
        backend.log(),
        vec!["detach capture", "release video encoder", "finalize container"]
    );
}

#[test]
fn test_stop_does_not_block_the_caller() {
    let (_backend, pipeline) = setup(MockOptions::default());
    let recording = pipeline.start(grant(true), true, &output()).unwrap();

    let begin = Instant::now();
    let handle = recording.stop().unwrap();
    assert!(begin.elapsed() < Duration::from_millis(100));

    let report = handle.wait();
    assert!(report.release_errors.is_empty());
}

#[test]
fn test_events_report_tracks_and_stop() {
    let (_backend, pipeline) = setup(MockOptions::default());
    let mut events = pipeline.subscribe();
    let recording = pipeline.start(grant(true), true, &output()).unwrap();
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));
    recording.stop().unwrap().wait();

    let mut ready = Vec::new();
    let mut stopped = false;
    while let Ok(event) = events.try_recv() {
        match event {
            PipelineEvent::TrackReady(track) => ready.push(track.role()),
            PipelineEvent::Stopped(report) => stopped = report.container_started,
        }
    }
    ready.sort_by_key(|r| r.as_str());
    assert_eq!(ready, vec![TrackRole::Audio, TrackRole::Video]);
    assert!(stopped);
}

#[test]
fn test_dropping_a_recording_tears_it_down() {
    let (backend, pipeline) = setup(MockOptions::default());
    let recording = pipeline.start(grant(false), false, &output()).unwrap();
    assert!(wait_for(Duration::from_secs(1), || recording.muxer_state()
        == MuxerState::Started));
    drop(recording);
    assert_eq!(
        backend.log(),
        vec!["detach capture", "release video encoder", "finalize container"]
    );
}
