//! The render task state machine: `Created -> Configured -> Enqueued ->
//! Executing -> Stopped`. Configuration fields are only ever mutated by
//! the owning Session's receive loop, and only before the task has
//! started; the duration is the one field that can still be tightened
//! after start, communicated through a watch channel rather than direct
//! mutation so the executing side (standalone executor or queued
//! downstream) can react to it without taking a lock on the hot path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot, watch};

use crate::backend_pool::Backend;
use crate::error::RenderError;
use crate::exec::{self, ExecSpec};
use crate::protocol::{self, Format, Inbound, OptionsArgs, OptionsOut, Stream};
use crate::stopper::Stopper;
use crate::tasklist::TaskList;
use crate::timer::Timer;
use crate::transport::{Connection, Frame};

pub type TaskHandle = Arc<Task>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Configured,
    Enqueued,
    Executing,
    Stopped,
}

/// What a Session forwards back to its own client as work progresses.
pub enum Event {
    Output(Stream, Vec<u8>),
    Result(Format, Vec<u8>),
    Complete(Option<String>),
}

struct Config {
    sources: HashMap<String, Vec<u8>>,
    mainname: Option<String>,
    format: Format,
    stderr_redir: bool,
    verbosity: u8,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sources: HashMap::new(),
            mainname: None,
            format: Format::Svg,
            stderr_redir: false,
            verbosity: 0,
        }
    }
}

pub struct Task {
    state: Mutex<TaskState>,
    config: Mutex<Config>,
    max_duration: f64,
    duration_tx: watch::Sender<f64>,
    duration_rx: watch::Receiver<f64>,
    stopper: Stopper,
    backend_slot: Mutex<Option<oneshot::Sender<Backend>>>,
}

impl Task {
    pub fn new(stopper: Stopper, max_duration: f64) -> Self {
        let (duration_tx, duration_rx) = watch::channel(max_duration);
        Self {
            state: Mutex::new(TaskState::Created),
            config: Mutex::new(Config::default()),
            max_duration,
            duration_tx,
            duration_rx,
            stopper,
            backend_slot: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn new_for_test(stopper: Stopper, duration: f64) -> Self {
        let task = Self::new(stopper, crate::config::DEFAULT_MAX_DURATION);
        let _ = task.duration_tx.send(duration);
        task
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock().unwrap()
    }

    pub fn duration(&self) -> f64 {
        *self.duration_rx.borrow()
    }

    pub fn duration_changes(&self) -> watch::Receiver<f64> {
        self.duration_rx.clone()
    }

    pub fn stopper(&self) -> &Stopper {
        &self.stopper
    }

    pub fn stop(&self) {
        *self.state.lock().unwrap() = TaskState::Stopped;
        self.stopper.stop();
    }

    fn started(&self) -> bool {
        !matches!(self.state(), TaskState::Created | TaskState::Configured)
    }

    /// Applies one decoded client message (everything but `start`, which
    /// the caller drives directly since it also picks standalone vs.
    /// queued execution).
    pub fn apply(&self, inbound: Inbound) -> Result<(), RenderError> {
        match inbound {
            Inbound::Add(args) => self.add_source(args.filename),
            Inbound::Options(args) => self.set_options(args),
            Inbound::Start(_) => Err(RenderError::Validation(
                "start must be handled by the caller, not apply()".to_string(),
            )),
            Inbound::Input => Err(RenderError::Validation(
                "input is not implemented".to_string(),
            )),
            Inbound::Restore => Err(RenderError::Validation(
                "restore is not implemented".to_string(),
            )),
        }
    }

    fn add_source(&self, name: String) -> Result<(), RenderError> {
        check_filename(&name)?;
        if self.started() {
            return Err(RenderError::Validation("task already started".to_string()));
        }
        let mut config = self.config.lock().unwrap();
        config.sources.insert(name, Vec::new());
        Ok(())
    }

    /// Fills in the payload for a name already registered by `add`, and
    /// enforces the aggregate input cap.
    pub fn set_source_bytes(&self, name: &str, bytes: Vec<u8>) -> Result<(), RenderError> {
        const MAX_TOTAL_BYTES: usize = 128 * 1024;
        if self.started() {
            return Err(RenderError::Validation("task already started".to_string()));
        }
        let mut config = self.config.lock().unwrap();
        let existing_len = config.sources.get(name).map(Vec::len).unwrap_or(0);
        let total_after: usize =
            config.sources.values().map(Vec::len).sum::<usize>() - existing_len + bytes.len();
        if total_after > MAX_TOTAL_BYTES {
            return Err(RenderError::Validation(format!(
                "total input size would exceed {MAX_TOTAL_BYTES} bytes"
            )));
        }
        match config.sources.get_mut(name) {
            Some(slot) => {
                *slot = bytes;
                Ok(())
            }
            None => Err(RenderError::Validation(format!("unknown file {name:?}"))),
        }
    }

    fn set_options(&self, args: OptionsArgs) -> Result<(), RenderError> {
        if let Some(secs) = args.duration {
            self.set_duration(secs);
        }
        if self.started() {
            if args.format.is_some() || args.stderr_redir.is_some() || args.verbosity.is_some() {
                return Err(RenderError::Validation(
                    "only duration may change after start".to_string(),
                ));
            }
            return Ok(());
        }
        let mut config = self.config.lock().unwrap();
        if let Some(format) = args.format {
            config.format = format;
        }
        if let Some(redir) = args.stderr_redir {
            config.stderr_redir = redir;
        }
        if let Some(verbosity) = args.verbosity {
            if verbosity > 3 {
                return Err(RenderError::Validation("verbosity must be 0..=3".to_string()));
            }
            config.verbosity = verbosity;
        }
        Ok(())
    }

    /// Out-of-range durations clamp to `max_duration` rather than denying,
    /// matching the original's `SetDuration`. Once started, only ever
    /// tightens — a later, larger value is silently ignored.
    fn set_duration(&self, secs: f64) {
        let clamped = secs.clamp(0.0, self.max_duration);
        let current = *self.duration_tx.borrow();
        if !self.started() || clamped < current {
            let _ = self.duration_tx.send(clamped);
        }
    }

    fn begin_start(&self, mainname: String) -> Result<(), RenderError> {
        check_filename(&mainname)?;
        let mut config = self.config.lock().unwrap();
        if !config.sources.contains_key(&mainname) {
            return Err(RenderError::Validation(format!(
                "unknown main file {mainname:?}"
            )));
        }
        config.mainname = Some(mainname);
        Ok(())
    }

    /// Runs the task directly against a local renderer binary — the
    /// executor's own mode, and the frontend's standalone degenerate mode.
    pub async fn run_standalone(
        self: &Arc<Self>,
        renderer_bin: &str,
        workdir: &std::path::Path,
        mainname: String,
        events: mpsc::Sender<Event>,
    ) -> Result<(), RenderError> {
        self.begin_start(mainname)?;
        *self.state.lock().unwrap() = TaskState::Executing;

        let (format, stderr_redir, verbosity, mainname, sources) = {
            let config = self.config.lock().unwrap();
            (
                config.format,
                config.stderr_redir,
                config.verbosity,
                config.mainname.clone().expect("set by begin_start"),
                config.sources.clone(),
            )
        };
        for (name, bytes) in &sources {
            let path = workdir.join(name);
            if let Err(e) = tokio::fs::write(&path, bytes).await {
                self.stop();
                return Err(RenderError::Io(e));
            }
        }

        let timer = Timer::new(self.stopper.clone());
        timer.set_duration(self.duration()).await;

        let duration_forward = {
            let timer = timer.clone();
            let mut duration_changes = self.duration_changes();
            let stopper = self.stopper.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stopper.stopped() => return,
                        changed = duration_changes.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let secs = *duration_changes.borrow();
                            timer.set_duration(secs).await;
                        }
                    }
                }
            })
        };

        let (output_tx, mut output_rx) = mpsc::channel(8);
        let relay = {
            let events = events.clone();
            tokio::spawn(async move {
                while let Some((stream, bytes)) = output_rx.recv().await {
                    if events.send(Event::Output(stream, bytes)).await.is_err() {
                        break;
                    }
                }
            })
        };

        let workdir_owned = workdir.to_path_buf();
        let renderer_bin_owned = renderer_bin.to_string();
        let outcome = exec::execute(
            ExecSpec {
                renderer_bin: &renderer_bin_owned,
                workdir: &workdir_owned,
                mainname: &mainname,
                format,
                stderr_redir,
                verbosity,
            },
            &timer,
            self.stopper.clone(),
            output_tx,
        )
        .await;

        duration_forward.abort();
        let _ = relay.await;

        if let Some(artifact) = outcome.artifact {
            let _ = events.send(Event::Result(format, artifact)).await;
        }
        let error = outcome.error;
        let message = error.as_ref().map(RenderError::user_message);
        let _ = events.send(Event::Complete(message)).await;
        self.stop();
        error.map_or(Ok(()), Err)
    }

    /// Registers with a `TaskList` and waits for the dispatcher to hand it
    /// a backend, then relays the whole render session through that
    /// backend connection. Used by the frontend's queued mode.
    pub async fn run_queued(
        self: &Arc<Self>,
        mainname: String,
        tasklist: &TaskList,
        events: mpsc::Sender<Event>,
    ) -> Result<(), RenderError> {
        self.begin_start(mainname)?;
        *self.state.lock().unwrap() = TaskState::Enqueued;

        if self.duration() <= 0.0 {
            self.stop();
            return Err(RenderError::Stopped);
        }

        let (backend_tx, backend_rx) = oneshot::channel();
        *self.backend_slot.lock().unwrap() = Some(backend_tx);
        tasklist.push(Arc::clone(self), self.duration());

        let backend = tokio::select! {
            _ = self.stopper.stopped() => return Err(RenderError::Stopped),
            b = backend_rx => match b {
                Ok(b) => b,
                Err(_) => return Err(RenderError::Stopped),
            },
        };

        *self.state.lock().unwrap() = TaskState::Executing;
        let conn = Arc::new(
            backend
                .dial()
                .await
                .map_err(|e| RenderError::Server(e.to_string()))?,
        );

        let (mainname, format, stderr_redir, verbosity, sources) = {
            let config = self.config.lock().unwrap();
            (
                config.mainname.clone().expect("set by begin_start"),
                config.format,
                config.stderr_redir,
                config.verbosity,
                config.sources.clone(),
            )
        };

        for (name, bytes) in sources {
            conn.send_pair(protocol::encode_add(&name), bytes)
                .await
                .map_err(RenderError::Io)?;
        }
        conn.send_text(protocol::encode_options(&OptionsOut {
            duration: Some(self.duration()),
            format: Some(format),
            stderr_redir: Some(stderr_redir),
            verbosity: Some(verbosity),
        }))
        .await
        .map_err(RenderError::Io)?;
        conn.send_text(protocol::encode_start(&mainname))
            .await
            .map_err(RenderError::Io)?;

        let duration_forward = {
            let conn = conn.clone();
            let mut duration_changes = self.duration_changes();
            let stopper = self.stopper.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = stopper.stopped() => return,
                        changed = duration_changes.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            let secs = *duration_changes.borrow();
                            let text = protocol::encode_options(&OptionsOut {
                                duration: Some(secs),
                                ..Default::default()
                            });
                            if conn.send_text(text).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            })
        };

        let result = relay_backend(&conn, &events).await;
        duration_forward.abort();
        self.stop();
        result
    }

    pub fn proceed_with(&self, backend: Backend) {
        if let Some(tx) = self.backend_slot.lock().unwrap().take() {
            let _ = tx.send(backend);
        }
    }
}

async fn relay_backend(
    conn: &Connection,
    events: &mpsc::Sender<Event>,
) -> Result<(), RenderError> {
    let mut pending_stream: Option<Stream> = None;
    let mut pending_format: Option<Format> = None;
    loop {
        match conn.recv().await {
            Some(Ok(Frame::Text(text))) => {
                let (verb, rest) = text.split_once(' ').unwrap_or((text.as_str(), ""));
                match verb {
                    "output" => {
                        let args: protocol::OutputArgs = serde_json::from_str(rest)
                            .map_err(|e| RenderError::Server(e.to_string()))?;
                        pending_stream = Some(args.stream);
                    }
                    "result" => {
                        let args: protocol::ResultArgs = serde_json::from_str(rest)
                            .map_err(|e| RenderError::Server(e.to_string()))?;
                        pending_format = Some(args.format);
                    }
                    "complete" => {
                        let notice: protocol::CompleteNotice =
                            serde_json::from_str(rest).unwrap_or_default();
                        let _ = events.send(Event::Complete(notice.error.clone())).await;
                        return match notice.error {
                            Some(msg) => Err(RenderError::Server(msg)),
                            None => Ok(()),
                        };
                    }
                    "deny" => {
                        let _ = events
                            .send(Event::Complete(Some(rest.to_string())))
                            .await;
                        return Err(RenderError::Server(rest.to_string()));
                    }
                    _ => {}
                }
            }
            Some(Ok(Frame::Binary(bytes))) => {
                if let Some(stream) = pending_stream.take() {
                    let _ = events.send(Event::Output(stream, bytes)).await;
                } else if let Some(format) = pending_format.take() {
                    let _ = events.send(Event::Result(format, bytes)).await;
                }
            }
            Some(Err(e)) => return Err(RenderError::Io(e)),
            None => return Err(RenderError::Stopped),
        }
    }
}

fn check_filename(name: &str) -> Result<(), RenderError> {
    if !name.ends_with(".asy") {
        return Err(RenderError::Validation(
            "filename must end with \".asy\"".to_string(),
        ));
    }
    if name.contains('/') {
        return Err(RenderError::Validation(
            "filename cannot contain slash \"/\"".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_filenames_with_slash() {
        assert!(check_filename("sub/dir.asy").is_err());
    }

    #[test]
    fn rejects_non_asy_suffix() {
        assert!(check_filename("main.txt").is_err());
    }

    #[test]
    fn accepts_plain_asy_name() {
        assert!(check_filename("main.asy").is_ok());
    }

    #[test]
    fn duration_clamps_above_max() {
        let task = Task::new(Stopper::new(), 30.0);
        task.set_duration(31.0);
        assert_eq!(task.duration(), 30.0);
    }

    #[test]
    fn duration_only_tightens_after_start() {
        let task = Task::new(Stopper::new(), 30.0);
        task.set_duration(10.0);
        *task.state.lock().unwrap() = TaskState::Executing;
        task.set_duration(20.0);
        assert_eq!(task.duration(), 10.0);
        task.set_duration(5.0);
        assert_eq!(task.duration(), 5.0);
    }
}
