//! One client-facing websocket connection: decodes inbound protocol
//! messages into `Task` mutations, and relays whatever the task produces
//! back out as encoded frames. Runs either standalone (renders locally)
//! or queued (hands the task to a `TaskList` for the dispatcher to pick
//! up), decided once per connection by the caller.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::RenderError;
use crate::protocol::{self, Inbound};
use crate::stopper::Stopper;
use crate::task::{Event, Task};
use crate::tasklist::TaskList;
use crate::transport::{Connection, Frame};

pub enum Mode {
    Standalone { renderer_bin: Arc<str> },
    Queued { tasklist: Arc<TaskList> },
}

/// Drives one connection end to end: reads client messages until `start`,
/// then runs the task and relays its events back, until completion or the
/// connection drops.
pub async fn run(conn: Connection, mode: Mode, max_duration: f64) -> Result<(), RenderError> {
    let conn = Arc::new(conn);
    let stopper = Stopper::new();
    let task = Arc::new(Task::new(stopper, max_duration));

    let (events_tx, events_rx) = mpsc::channel(16);
    let outbound = tokio::spawn(relay_outbound(conn.clone(), events_rx));

    let result = receive_loop(&conn, &task, &mode, events_tx).await;

    let _ = outbound.await;
    result
}

async fn relay_outbound(conn: Arc<Connection>, mut events: mpsc::Receiver<Event>) {
    while let Some(event) = events.recv().await {
        let sent = match event {
            Event::Output(stream, bytes) => {
                conn.send_pair(protocol::encode_output(stream), bytes).await
            }
            Event::Result(format, bytes) => {
                conn.send_pair(protocol::encode_result(format), bytes).await
            }
            Event::Complete(error) => conn.send_text(protocol::encode_complete(error.as_deref())).await,
        };
        if sent.is_err() {
            break;
        }
    }
}

async fn receive_loop(
    conn: &Arc<Connection>,
    task: &Arc<Task>,
    mode: &Mode,
    events_tx: mpsc::Sender<Event>,
) -> Result<(), RenderError> {
    let mut pending_name: Option<String> = None;
    loop {
        match conn.recv().await {
            Some(Ok(Frame::Text(text))) => match protocol::decode(&text) {
                Ok(Inbound::Start(args)) => {
                    return run_task(task, mode, args.main, events_tx).await;
                }
                Ok(Inbound::Add(args)) => {
                    if let Err(e) = task.apply(Inbound::Add(protocol::AddArgs {
                        filename: args.filename.clone(),
                    })) {
                        deny(conn, &e).await;
                        return Err(e);
                    }
                    pending_name = Some(args.filename);
                }
                Ok(other) => {
                    if let Err(e) = task.apply(other) {
                        deny(conn, &e).await;
                        return Err(e);
                    }
                }
                Err(e) => {
                    let err = RenderError::Validation(e.to_string());
                    deny(conn, &err).await;
                    return Err(err);
                }
            },
            Some(Ok(Frame::Binary(bytes))) => {
                let Some(name) = pending_name.take() else {
                    continue;
                };
                if let Err(e) = task.set_source_bytes(&name, bytes) {
                    deny(conn, &e).await;
                    return Err(e);
                }
            }
            Some(Err(e)) => return Err(RenderError::Io(e)),
            None => return Err(RenderError::Stopped),
        }
    }
}

async fn run_task(
    task: &Arc<Task>,
    mode: &Mode,
    mainname: String,
    events_tx: mpsc::Sender<Event>,
) -> Result<(), RenderError> {
    match mode {
        Mode::Standalone { renderer_bin } => {
            let workdir = tempfile::tempdir().map_err(RenderError::Io)?;
            task.run_standalone(renderer_bin, workdir.path(), mainname, events_tx)
                .await
        }
        Mode::Queued { tasklist } => task.run_queued(mainname, tasklist, events_tx).await,
    }
}

async fn deny(conn: &Connection, err: &RenderError) {
    let _ = conn.send_text(protocol::encode_deny(&err.user_message())).await;
}
