use thiserror::Error;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("process reached time limit ({secs:.1}s)")]
    TimeLimit { secs: f64 },

    #[error("process was stopped")]
    Stopped,

    /// `child.wait()` itself failed (reaping the exit status) — distinct
    /// from a generic reader I/O fault, and outranks it.
    #[error("wait error: {0}")]
    WaitError(std::io::Error),

    #[error("output exceeded {0} bytes")]
    OutputLimit(usize),

    #[error("execution failed")]
    ExecutionFailed,

    /// A reader pipe faulted (or the renderer failed to spawn at all).
    #[error("process I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no image")]
    NoImage,

    #[error("server error: {0}")]
    Server(String),
}

impl RenderError {
    /// Relative precedence when more than one failure is observed for the
    /// same task: kill reason, then wait error, then output overflow,
    /// then a nonzero exit, then a generic reader I/O fault, then a
    /// missing artifact. Lower wins.
    fn rank(&self) -> u8 {
        match self {
            Self::TimeLimit { .. } => 0,
            Self::Stopped => 0,
            Self::WaitError(_) => 1,
            Self::OutputLimit(_) => 2,
            Self::ExecutionFailed => 3,
            Self::Io(_) => 4,
            Self::NoImage => 5,
            Self::Validation(_) => 6,
            Self::Server(_) => 6,
        }
    }

    /// Keep `self` unless `other` outranks it — used to fold multiple
    /// candidate causes into the one actually reported, per the kill
    /// reason / wait error / output limit / exit status / I/O error /
    /// missing artifact precedence order.
    pub fn prefer(self, other: RenderError) -> RenderError {
        if other.rank() < self.rank() {
            other
        } else {
            self
        }
    }

    /// Text safe to send to a client: no file paths, no raw OS error
    /// strings.
    pub fn user_message(&self) -> String {
        match self {
            Self::Validation(msg) => msg.clone(),
            Self::TimeLimit { secs } => format!("Process reached time limit ({secs:.1}s)"),
            Self::Stopped => "Process was stopped".to_string(),
            Self::WaitError(_) => "Server error".to_string(),
            Self::OutputLimit(bytes) => format!("Process reached output limit ({bytes}B)"),
            Self::ExecutionFailed => "Execution failed".to_string(),
            Self::Io(_) => "Process I/O error".to_string(),
            Self::NoImage => "No image".to_string(),
            Self::Server(_) => "Server error".to_string(),
        }
    }
}
