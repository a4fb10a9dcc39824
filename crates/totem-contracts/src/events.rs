use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde::Serialize;

use crate::workflow::{Phase, SpiritStatus as SpiritState};

/// Everything the workflow reports about itself, one variant per transition.
///
/// The variant name becomes the `type` field of the logged line, so the
/// on-disk vocabulary is closed: a consumer can match on it exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    PhaseChanged { phase: Phase },
    AnalysisCompleted { subject: String },
    AnalysisFailed { error: String },
    RetryScheduled { delay_ms: u64 },
    QuotaNotice { message: String },
    BillingNotice { message: String },
    SpiritStatus {
        status: SpiritState,
        caption: Option<String>,
    },
    ChatTurn { messages: usize },
    SessionReset,
}

#[derive(Serialize)]
struct EventLine<'a> {
    session_id: &'a str,
    ts: String,
    #[serde(flatten)]
    event: &'a SessionEvent,
}

/// Append-only writer for the session's `events.jsonl`: one compact JSON
/// object per line, stamped with the session id and a UTC timestamp.
#[derive(Debug, Clone)]
pub struct SessionEventLog {
    inner: Arc<SessionEventLogInner>,
}

#[derive(Debug)]
struct SessionEventLogInner {
    path: PathBuf,
    session_id: String,
    lock: Mutex<()>,
}

impl SessionEventLog {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(SessionEventLogInner {
                path: path.into(),
                session_id: session_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, event: &SessionEvent) -> anyhow::Result<()> {
        let line = serde_json::to_string(&EventLine {
            session_id: &self.inner.session_id,
            ts: now_utc_iso(),
            event,
        })?;

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event log lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

pub fn new_session_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
