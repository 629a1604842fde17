//! End-to-end exercises of `Task::run_standalone` against small fixture
//! scripts standing in for the real renderer binary: the happy path,
//! the time-limit/kill path, and the missing-artifact path.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use renderd::error::RenderError;
use renderd::protocol::{AddArgs, Format, Inbound, OptionsArgs};
use renderd::stopper::Stopper;
use renderd::task::{Event, Task};

fn fixture(name: &str) -> String {
    let mut path = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    path.push("tests/fixtures");
    path.push(name);
    path.to_string_lossy().into_owned()
}

async fn task_with_source(duration: f64) -> (Arc<Task>, tempfile::TempDir) {
    let workdir = tempfile::tempdir().expect("tempdir");
    let task = Arc::new(Task::new(Stopper::new(), 30.0));
    task.apply(Inbound::Add(AddArgs {
        filename: "main.asy".to_string(),
    }))
    .expect("add");
    task.set_source_bytes("main.asy", b"// a drawing".to_vec())
        .expect("set bytes");
    task.apply(Inbound::Options(OptionsArgs {
        duration: Some(duration),
        format: Some(Format::Svg),
        ..Default::default()
    }))
    .expect("options");
    (task, workdir)
}

async fn run(task: &Arc<Task>, renderer: &str, workdir: &Path) -> (Result<(), RenderError>, Vec<Event>) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let result = task
        .run_standalone(renderer, workdir, "main.asy".to_string(), tx)
        .await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

#[tokio::test]
async fn happy_path_delivers_artifact_and_clean_completion() {
    let (task, workdir) = task_with_source(5.0).await;
    let (result, events) = run(&task, &fixture("renderer_success.sh"), workdir.path()).await;

    assert!(result.is_ok());
    let artifact = events.iter().find_map(|e| match e {
        Event::Result(Format::Svg, bytes) => Some(bytes.clone()),
        _ => None,
    });
    assert_eq!(artifact.as_deref(), Some(&b"<svg/>"[..]));
    assert!(matches!(events.last(), Some(Event::Complete(None))));
}

#[tokio::test]
async fn hanging_renderer_is_killed_on_time_limit() {
    let (task, workdir) = task_with_source(0.2).await;
    let (result, events) = run(&task, &fixture("renderer_hang.sh"), workdir.path()).await;

    assert!(matches!(result, Err(RenderError::TimeLimit { .. })));
    let completion = events.iter().find_map(|e| match e {
        Event::Complete(msg) => Some(msg.clone()),
        _ => None,
    });
    assert!(completion.flatten().is_some_and(|m| m.contains("time limit")));
}

#[tokio::test]
async fn missing_artifact_is_reported_as_no_image() {
    let (task, workdir) = task_with_source(5.0).await;
    let (result, _events) = run(&task, &fixture("renderer_missing.sh"), workdir.path()).await;

    assert!(matches!(result, Err(RenderError::NoImage)));
}
