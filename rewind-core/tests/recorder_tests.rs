//! Integration tests for the recorder run loop
//!
//! Kept in their own binary: they deliver real signals to the process.

mod mocks;

use mocks::{video_unit, wait_until, MemoryMuxer, ScriptedSource};
use rewind_core::config::ReplayConfig;
use rewind_core::output::OutputTemplate;
use rewind_core::trigger::{request_save, Trigger, TriggerKind, TriggerOptions};
use rewind_core::types::StreamParams;
use rewind_core::Recorder;
use std::time::Duration;
use tempfile::TempDir;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_interrupt_during_save_stops_recorder() {
    let dir = TempDir::new().unwrap();
    let output = dir.path().join("Replay_%H%M%S.mp4");
    let config = ReplayConfig::default()
        .with_retention(10)
        .with_output(OutputTemplate::new(output.to_string_lossy()).unwrap());

    let muxer = MemoryMuxer::new().with_open_delay(Duration::from_millis(500));
    let recorded = muxer.recorded();
    let mut recorder = Recorder::new(&config, Box::new(muxer));
    let video = ScriptedSource::new(
        StreamParams::video("h264", 640, 360, 30),
        (0..30).map(|pts| video_unit(pts, pts % 10 == 0)),
    );
    recorder.add_stream(Box::new(video)).unwrap();
    let buffer = recorder.buffers()[0].clone();
    assert!(wait_until(|| buffer.len() == 30));

    let options = TriggerOptions {
        kind: TriggerKind::Socket,
        socket_path: dir.path().join("trigger.sock"),
        ..TriggerOptions::default()
    };
    let trigger = Trigger::open(&options).unwrap();

    let driver = {
        let recorded = recorded.clone();
        async move {
            request_save(&options.socket_path).await.unwrap();
            // Interrupt while the muxer is still opening the file
            while recorded.lock().path.is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            // SAFETY: raise has no preconditions; the recorder owns a SIGINT
            // stream by now, so the default action is not taken.
            unsafe {
                libc::raise(libc::SIGINT);
            }
        }
    };

    let (result, ()) = tokio::time::timeout(Duration::from_secs(10), async {
        tokio::join!(recorder.run(trigger), driver)
    })
    .await
    .expect("recorder must stop on an interrupt received mid-save");

    result.unwrap();
    assert!(recorder.workers().is_empty());
    let recorded = recorded.lock();
    assert!(recorded.closed, "the save in flight completes first");
    assert_eq!(recorded.units.len(), 30);
}
