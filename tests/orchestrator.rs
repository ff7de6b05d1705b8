//! Playback orchestration flows against in-memory device links

mod common;

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use echocast::orchestrator::{
    ConnectOutcome, Orchestrator, PlaybackState, PreparedAudio, ProgressEvent,
};
use tokio::sync::mpsc;

use common::{
    cast_device, collect_events, shared_link_state, temp_audio, test_config, FakeLink,
    SharedLinkState,
};

fn fake_orchestrator(dir: &Path, state: &SharedLinkState) -> Orchestrator {
    let mut orchestrator = Orchestrator::new(&test_config(dir)).unwrap();
    let shared = Arc::clone(state);
    orchestrator.set_link_factory(move |device| {
        Box::new(FakeLink {
            device_id: device.id.clone(),
            state: Arc::clone(&shared),
        })
    });
    orchestrator
}

#[tokio::test]
async fn play_without_device_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);

    let prep_ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&prep_ran);
    let (tx, mut rx) = mpsc::channel(16);
    let err = orchestrator
        .play(
            1,
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(PreparedAudio {
                    path: "unused.mp3".into(),
                    cleanup: false,
                })
            },
            tx,
        )
        .await
        .unwrap_err();

    assert_eq!(err.kind(), "connection");
    assert!(rx.try_recv().is_err(), "no progress without a device");
    assert!(!prep_ran.load(Ordering::SeqCst), "prep must not run");
}

#[tokio::test]
async fn playback_walks_prepare_connect_serve_play_complete() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(7, &cast_device("den"))
        .await
        .unwrap();

    let audio = temp_audio(dir.path());
    let prep_path = audio.clone();
    let (tx, rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                Ok(PreparedAudio {
                    path: prep_path,
                    cleanup: true,
                })
            },
            tx,
        )
        .await
        .unwrap();

    let events = collect_events(rx).await;
    assert!(matches!(events[0], ProgressEvent::Preparing));
    assert!(matches!(events[1], ProgressEvent::Connecting { .. }));
    assert!(matches!(events[2], ProgressEvent::Serving));
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Playing { .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::Complete)));

    assert!(!audio.exists(), "temp audio is removed after playback");
    assert_eq!(state.lock().unwrap().plays, 1);
    assert_eq!(orchestrator.status(7).await.state, PlaybackState::Complete);
}

#[tokio::test]
async fn local_play_skips_the_audio_server() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(7, &echocast::device::Device::local())
        .await
        .unwrap();

    let audio = temp_audio(dir.path());
    let (tx, rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                Ok(PreparedAudio {
                    path: audio,
                    cleanup: true,
                })
            },
            tx,
        )
        .await
        .unwrap();

    let events = collect_events(rx).await;
    assert!(
        !events.iter().any(|e| matches!(e, ProgressEvent::Serving)),
        "local playback never serves over HTTP, got {events:?}"
    );
    assert!(matches!(events[0], ProgressEvent::Preparing));
    assert!(matches!(events[1], ProgressEvent::Connecting { .. }));
    assert!(matches!(events.last(), Some(ProgressEvent::Complete)));
}

#[tokio::test]
async fn new_playback_supersedes_the_previous() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(7, &cast_device("den"))
        .await
        .unwrap();

    let (first_tx, first_rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(PreparedAudio {
                    path: "never.mp3".into(),
                    cleanup: false,
                })
            },
            first_tx,
        )
        .await
        .unwrap();

    // Let the first playback reach its prepare stage before replacing it.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let audio = temp_audio(dir.path());
    let (second_tx, second_rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                Ok(PreparedAudio {
                    path: audio,
                    cleanup: true,
                })
            },
            second_tx,
        )
        .await
        .unwrap();

    let first_events = collect_events(first_rx).await;
    assert!(
        matches!(first_events.as_slice(), [ProgressEvent::Preparing]),
        "superseded playback ends without a terminal event, got {first_events:?}"
    );

    let second_events = collect_events(second_rx).await;
    assert!(matches!(second_events.last(), Some(ProgressEvent::Complete)));
    assert_eq!(state.lock().unwrap().plays, 1);
}

#[tokio::test]
async fn connect_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(3, &cast_device("den"))
        .await
        .unwrap();

    assert_eq!(
        orchestrator.connect(3).await.unwrap(),
        ConnectOutcome::Connected
    );
    assert_eq!(
        orchestrator.connect(3).await.unwrap(),
        ConnectOutcome::AlreadyConnected
    );
    assert_eq!(state.lock().unwrap().connects, 1);

    assert!(orchestrator.disconnect(3).await);
    assert!(!orchestrator.disconnect(3).await, "second disconnect is a no-op");
}

#[tokio::test]
async fn connect_without_device_fails() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);

    let err = orchestrator.connect(3).await.unwrap_err();
    assert_eq!(err.kind(), "connection");
}

#[tokio::test]
async fn unreachable_device_surfaces_connection_error() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    state.lock().unwrap().fail_connect = true;
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(7, &cast_device("den"))
        .await
        .unwrap();

    let audio = temp_audio(dir.path());
    let prep_path = audio.clone();
    let (tx, rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                Ok(PreparedAudio {
                    path: prep_path,
                    cleanup: true,
                })
            },
            tx,
        )
        .await
        .unwrap();

    let events = collect_events(rx).await;
    match events.last() {
        Some(ProgressEvent::Error { kind, .. }) => assert_eq!(*kind, "connection"),
        other => panic!("expected connection error, got {other:?}"),
    }
    assert!(!audio.exists(), "temp audio is removed on failure too");
    assert_eq!(orchestrator.status(7).await.state, PlaybackState::Error);

    // The device stays selected and a later connect retries cleanly.
    assert!(orchestrator.selected_device(7).await.is_some());
    state.lock().unwrap().fail_connect = false;
    assert_eq!(
        orchestrator.connect(7).await.unwrap(),
        ConnectOutcome::Connected
    );
}

#[tokio::test]
async fn busy_device_reports_device_busy() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    state.lock().unwrap().busy_on_play = true;
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(7, &cast_device("den"))
        .await
        .unwrap();

    let audio = temp_audio(dir.path());
    let (tx, rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                Ok(PreparedAudio {
                    path: audio,
                    cleanup: true,
                })
            },
            tx,
        )
        .await
        .unwrap();

    let events = collect_events(rx).await;
    match events.last() {
        Some(ProgressEvent::Error { kind, .. }) => assert_eq!(*kind, "device_busy"),
        other => panic!("expected device busy error, got {other:?}"),
    }
}

#[tokio::test]
async fn selecting_a_new_device_drops_stale_links() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);

    orchestrator
        .select_device(3, &cast_device("den"))
        .await
        .unwrap();
    orchestrator.connect(3).await.unwrap();
    assert!(orchestrator.status(3).await.connected);

    orchestrator
        .select_device(3, &cast_device("kitchen"))
        .await
        .unwrap();
    assert_eq!(state.lock().unwrap().disconnects, 1);
    assert!(!orchestrator.status(3).await.connected);
}

#[tokio::test]
async fn device_selection_is_scoped_to_the_chat() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    let orchestrator = fake_orchestrator(dir.path(), &state);

    orchestrator
        .select_device(1, &cast_device("den"))
        .await
        .unwrap();
    orchestrator.connect(1).await.unwrap();

    // Another chat picking a different device leaves the first chat's
    // selection and link alone.
    orchestrator
        .select_device(2, &cast_device("kitchen"))
        .await
        .unwrap();
    assert_eq!(state.lock().unwrap().disconnects, 0);
    assert!(orchestrator.status(1).await.connected);
    assert_eq!(orchestrator.selected_device(1).await.unwrap().id, "den");
    assert_eq!(orchestrator.selected_device(2).await.unwrap().id, "kitchen");

    // A chat seen for the first time starts from the latest persisted pick.
    assert_eq!(orchestrator.selected_device(9).await.unwrap().id, "kitchen");
}

#[tokio::test]
async fn selection_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    {
        let orchestrator = Orchestrator::new(&test_config(dir.path())).unwrap();
        orchestrator
            .select_device(1, &cast_device("den"))
            .await
            .unwrap();
    }

    let orchestrator = Orchestrator::new(&test_config(dir.path())).unwrap();
    let device = orchestrator
        .selected_device(1)
        .await
        .expect("selection restored");
    assert_eq!(device.id, "den");
}

#[tokio::test]
async fn new_request_while_playing_stops_the_device() {
    let dir = tempfile::tempdir().unwrap();
    let state = shared_link_state();
    state.lock().unwrap().endless_play = true;
    let orchestrator = fake_orchestrator(dir.path(), &state);
    orchestrator
        .select_device(7, &cast_device("den"))
        .await
        .unwrap();

    let first_audio = temp_audio(dir.path());
    let (first_tx, mut first_rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                Ok(PreparedAudio {
                    path: first_audio,
                    cleanup: true,
                })
            },
            first_tx,
        )
        .await
        .unwrap();

    // Wait until the device actually reports playback before superseding.
    loop {
        match first_rx.recv().await {
            Some(ProgressEvent::Playing { .. }) => break,
            Some(_) => {}
            None => panic!("first playback ended before it started playing"),
        }
    }

    let second_audio = dir.path().join("second.mp3");
    std::fs::write(&second_audio, b"fake mp3 payload for tests").unwrap();
    let shared = Arc::clone(&state);
    let (second_tx, second_rx) = mpsc::channel(16);
    orchestrator
        .play(
            7,
            async move {
                // The superseded playback is already torn down by now; let
                // this one run to its natural end.
                shared.lock().unwrap().endless_play = false;
                Ok(PreparedAudio {
                    path: second_audio,
                    cleanup: true,
                })
            },
            second_tx,
        )
        .await
        .unwrap();

    let mut rest = Vec::new();
    while let Some(event) = first_rx.recv().await {
        rest.push(event);
    }
    assert!(
        !rest
            .iter()
            .any(|e| matches!(e, ProgressEvent::Complete | ProgressEvent::Error { .. })),
        "superseded playback must end without a terminal event, got {rest:?}"
    );

    let second_events = collect_events(second_rx).await;
    assert!(matches!(second_events.last(), Some(ProgressEvent::Complete)));

    let state = state.lock().unwrap();
    assert_eq!(state.stops, 1, "superseding mid-play stops the transport");
    assert_eq!(state.plays, 2);
}
