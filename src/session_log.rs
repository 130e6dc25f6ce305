//! JSON export of a finished run.

use std::fs::OpenOptions;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::orchestrator::{RunStatus, TaskRun};
use crate::types::{HistoryEntry, TaskSummary, TimeLogEntry};

#[derive(Error, Debug)]
pub enum SessionLogError {
    #[error("session log io: {0}")]
    Io(#[from] std::io::Error),

    #[error("session log json: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SessionLog {
    pub run_id: String,
    pub intent: String,
    pub model: String,
    pub total_agent_ms: u64,
    pub total_human_ms: u64,
    pub total_ms: u64,
    pub time_log: Vec<TimeLogEntry>,
    pub url_trail: Vec<String>,
    pub action_log: Vec<HistoryEntry>,
    pub summary: Option<TaskSummary>,
    pub status: RunStatus,
}

impl SessionLog {
    pub fn from_run(run: &TaskRun, model: &str) -> Self {
        Self {
            run_id: run.run_id().to_string(),
            intent: run.instructions().to_string(),
            model: model.to_string(),
            total_agent_ms: run.agent_ms(),
            total_human_ms: run.human_ms(),
            total_ms: run.total_ms(),
            time_log: run.time_log().to_vec(),
            url_trail: run.url_trail().to_vec(),
            action_log: run.history().to_vec(),
            summary: run.summary().cloned(),
            status: run.status(),
        }
    }
}

pub fn file_name(run: &TaskRun) -> String {
    format!("session_{}.json", run.run_id())
}

/// Write `run` to `<dir>/session_<run_id>.json`, creating `dir` if needed.
pub fn write(dir: &Path, run: &TaskRun, model: &str) -> Result<PathBuf, SessionLogError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name(run));
    let file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&path)?;

    serde_json::to_writer_pretty(file, &SessionLog::from_run(run, model))?;
    Ok(path)
}

pub fn load(path: &Path) -> Result<SessionLog, SessionLogError> {
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    Ok(serde_json::from_reader(reader)?)
}
