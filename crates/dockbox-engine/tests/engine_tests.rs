//! Engine lifecycle against the in-memory runtime.

mod common;

use bollard::models::{ContainerState, MountTypeEnum};
use common::{engine, MockRuntime};
use dockbox_core::{Bindings, Command, DockboxError, RunResult};

// =============================================================================
// Container creation
// =============================================================================

#[tokio::test]
async fn test_unknown_profile_makes_no_runtime_call() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();
    let calls_before = runtime.calls().len();

    let mut command = Command::new("echo hi");
    let err = engine
        .create_container("rust", &mut command, &Bindings::new(), &directory, None, &[])
        .await
        .unwrap_err();

    assert!(matches!(err, DockboxError::UnknownProfile(ref name) if name == "rust"));
    assert!(err.is_configuration());
    assert_eq!(runtime.calls().len(), calls_before);
    assert_eq!(command, Command::new("echo hi"));
}

#[tokio::test]
async fn test_create_builds_container_from_profile() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let mut bindings = Bindings::new();
    bindings.add_binding("/srv/tests:/tests").unwrap();
    let mut command = Command::new("python3 main.py");

    let id = engine
        .create_container(
            "python",
            &mut command,
            &bindings,
            &directory,
            None,
            &["PYTHONUNBUFFERED=1".to_string()],
        )
        .await
        .unwrap();

    assert_eq!(command.tokens(), ["/bin/sh", "-c", "python3 main.py"]);
    assert!(engine.tracker().lock().contains(&id));

    let state = runtime.state();
    let (created, body) = &state.bodies[0];
    assert_eq!(created, &id);
    assert_eq!(body.image.as_deref(), Some("python:3.12-alpine"));
    assert_eq!(body.user.as_deref(), Some("nobody"));
    assert_eq!(body.working_dir.as_deref(), Some("/sandbox"));
    assert_eq!(body.network_disabled, Some(true));
    assert_eq!(body.open_stdin, Some(false));
    assert_eq!(body.stdin_once, Some(false));
    assert_eq!(body.env, Some(vec!["PYTHONUNBUFFERED=1".to_string()]));

    let host = body.host_config.as_ref().unwrap();
    assert_eq!(host.cpu_count, Some(1));
    assert_eq!(host.memory, Some(128_000_000));
    assert_eq!(host.binds, Some(vec!["/srv/tests:/tests".to_string()]));

    let mount = &host.mounts.as_ref().unwrap()[0];
    assert_eq!(mount.source.as_deref(), Some(directory.name()));
    assert_eq!(mount.target.as_deref(), Some("/sandbox"));
    assert_eq!(mount.typ, Some(MountTypeEnum::VOLUME));
}

#[tokio::test]
async fn test_create_on_closed_directory_fails() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let mut directory = engine.open("/sandbox").await.unwrap();
    directory.close().await.unwrap();

    let err = engine
        .create_container(
            "python",
            &mut Command::new("ls"),
            &Bindings::new(),
            &directory,
            None,
            &[],
        )
        .await
        .unwrap_err();

    assert!(matches!(err, DockboxError::WorkingDirectoryClosed(_)));
    assert!(runtime.state().bodies.is_empty());
}

// =============================================================================
// Stdin
// =============================================================================

#[tokio::test]
async fn test_no_stdin_means_no_attach() {
    let runtime = MockRuntime::new();
    runtime.stdout("hello\n");
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "python",
            &mut Command::new("echo hello"),
            &Bindings::new(),
            &directory,
            Some(""),
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();
    let result = engine.get_result(&id).await.unwrap();

    let calls = runtime.calls();
    assert!(!calls.iter().any(|c| c.starts_with("attach:")));
    assert!(calls.contains(&format!("logs:{}", id)));
    assert_eq!(result.stdout, "hello\n");
}

#[tokio::test]
async fn test_stdin_attaches_before_start() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "python",
            &mut Command::new("python3 main.py"),
            &Bindings::new(),
            &directory,
            Some("1 2"),
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();

    let calls = runtime.calls();
    let attach = calls.iter().position(|c| c == &format!("attach:{}", id));
    let start = calls.iter().position(|c| c == &format!("start:{}", id));
    assert!(attach.unwrap() < start.unwrap());
    assert_eq!(runtime.state().stdin, b"1 2\n");
    let state = runtime.state();
    let body = &state.bodies[0].1;
    assert_eq!(body.open_stdin, Some(true));
    assert_eq!(body.attach_stdin, Some(true));
    assert_eq!(body.stdin_once, Some(true));
}

#[tokio::test]
async fn test_cat_round_trip_returns_stdin() {
    let runtime = MockRuntime::new();
    runtime.state().echo_stdin = true;
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "python",
            &mut Command::new("cat"),
            &Bindings::new(),
            &directory,
            Some("hello world"),
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();
    let result = engine.get_result(&id).await.unwrap();

    assert_eq!(runtime.state().stdin, b"hello world\n\x04");
    assert_eq!(result.stdout, "hello world\n");
    assert!(!result.timed_out);
}

// =============================================================================
// Start, stop and results
// =============================================================================

#[tokio::test]
async fn test_start_and_stop_are_idempotent() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();
    let id = engine
        .create_container(
            "gcc",
            &mut Command::new("sleep 1"),
            &Bindings::new(),
            &directory,
            None,
            &[],
        )
        .await
        .unwrap();

    engine.start_container(&id).await.unwrap();
    engine.start_container(&id).await.unwrap();
    engine.stop_container(&id).await.unwrap();
    engine.stop_container(&id).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_timeout_stops_container_and_keeps_partial_output() {
    let runtime = MockRuntime::new();
    runtime.stdout("partial\n");
    runtime.state().hang = true;
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "python",
            &mut Command::new("sleep 2"),
            &Bindings::new(),
            &directory,
            None,
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();
    let result = engine.get_result(&id).await.unwrap();

    assert!(result.timed_out);
    assert_eq!(result.stdout, "partial\n");
    assert!(runtime.calls().contains(&format!("stop:{}", id)));
    assert!(!runtime.calls().contains(&format!("remove:{}", id)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_with_stdin_stops_container() {
    let runtime = MockRuntime::new();
    runtime.stdout("reading\n");
    runtime.state().hang = true;
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "python",
            &mut Command::new("python3 loop.py"),
            &Bindings::new(),
            &directory,
            Some("1 2"),
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();
    let result = engine.get_result(&id).await.unwrap();

    assert!(result.timed_out);
    assert_eq!(result.stdout, "reading\n");
    assert_eq!(runtime.state().stdin, b"1 2\n");

    let calls = runtime.calls();
    assert!(calls.contains(&format!("attach:{}", id)));
    assert!(!calls.contains(&format!("logs:{}", id)));
    assert!(calls.contains(&format!("stop:{}", id)));
}

#[tokio::test]
async fn test_result_reports_exit_code_and_duration() {
    let runtime = MockRuntime::new();
    runtime
        .stdout("out\n")
        .stderr("err\n")
        .exits_with(3, "2024-05-01T12:00:00.000Z", "2024-05-01T12:00:02.125Z");
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "gcc",
            &mut Command::new("sleep 2; exit 3"),
            &Bindings::new(),
            &directory,
            None,
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();
    let result = engine.get_result(&id).await.unwrap();

    assert_eq!(result.exit_code(), Some(3));
    assert_eq!(result.stdout, "out\n");
    assert_eq!(result.stderr, "err\n");
    assert!(!result.timed_out);
    assert!(!result.out_of_memory);
    assert!((2.0..=3.0).contains(&result.duration));
    assert!(!runtime.calls().iter().any(|c| c.starts_with("stop:")));
}

#[tokio::test]
async fn test_oom_and_unknown_exit_code() {
    let runtime = MockRuntime::new();
    runtime.state().container_state = ContainerState {
        oom_killed: Some(true),
        ..Default::default()
    };
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let id = engine
        .create_container(
            "python",
            &mut Command::new("python3 -c 'x = bytearray(1 << 30)'"),
            &Bindings::new(),
            &directory,
            None,
            &[],
        )
        .await
        .unwrap();
    engine.start_container(&id).await.unwrap();
    let result = engine.get_result(&id).await.unwrap();

    assert!(result.out_of_memory);
    assert_eq!(result.exit_code, RunResult::EXIT_CODE_UNKNOWN);
    assert_eq!(result.exit_code(), None);
    assert!(result.duration.is_nan());
}

#[tokio::test]
async fn test_untracked_container_has_no_result() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);

    let err = engine.get_result("someone-elses").await.unwrap_err();

    assert!(matches!(err, DockboxError::UntrackedContainer(ref id) if id == "someone-elses"));
    assert!(runtime.calls().is_empty());
}

// =============================================================================
// Removal and cleanup
// =============================================================================

#[tokio::test]
async fn test_removed_container_is_forgotten() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();
    let id = engine
        .create_container(
            "gcc",
            &mut Command::new("true"),
            &Bindings::new(),
            &directory,
            None,
            &[],
        )
        .await
        .unwrap();

    engine.remove_container(&id).await.unwrap();

    assert!(engine.tracker().lock().is_empty());
    assert!(matches!(
        engine.get_result(&id).await,
        Err(DockboxError::UntrackedContainer(_))
    ));
}

#[tokio::test]
async fn test_cleanup_removes_every_tracked_container() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);
    let directory = engine.open("/sandbox").await.unwrap();

    let mut ids = Vec::new();
    for _ in 0..3 {
        let id = engine
            .create_container(
                "python",
                &mut Command::new("cat"),
                &Bindings::new(),
                &directory,
                Some("x"),
                &[],
            )
            .await
            .unwrap();
        ids.push(id);
    }
    // One container vanished on its own
    runtime.state().containers.retain(|c| c != &ids[1]);

    let removed = engine.cleanup_containers().await.unwrap();

    assert_eq!(removed, 2);
    assert!(engine.tracker().lock().is_empty());
    assert!(runtime.state().containers.is_empty());
    assert_eq!(engine.cleanup_containers().await.unwrap(), 0);
}

// =============================================================================
// Working directory ownership
// =============================================================================

#[tokio::test]
async fn test_one_open_working_directory_per_engine() {
    let runtime = MockRuntime::new();
    let mut engine = engine(&runtime);

    let mut first = engine.open("/sandbox").await.unwrap();
    let err = engine.open("/other").await.unwrap_err();
    assert!(matches!(err, DockboxError::WorkingDirectoryActive(ref name) if name == first.name()));

    first.close().await.unwrap();
    let second = engine.open("/other").await.unwrap();
    assert_ne!(first.name(), second.name());
    assert_eq!(second.path(), "/other");
}
