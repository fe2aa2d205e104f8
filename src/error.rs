use std::path::PathBuf;

pub type Result<T, E = RecorderError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("`{0}` not found in PATH")]
    ToolNotFound(String),

    /// Non-zero exit from ffmpeg/ffprobe. Output is kept for diagnostics only.
    #[error("{tool} failed (exit code {exit_code:?})")]
    ToolExecution {
        tool: String,
        exit_code: Option<i32>,
        stdout: Vec<String>,
        stderr: Vec<String>,
    },

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("failed to rename '{}' to '{}': {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("cannot parse {what}: {value}")]
    Parse { what: &'static str, value: String },
}
