use serde::{Deserialize, Serialize};

use crate::errors::TotemError;

/// Main workflow phase. One analysis run at a time: `start` is rejected while
/// `Loading`, and `Result` holds until an explicit reset or a new start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Input,
    Loading,
    Result,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SpiritStatus {
    Idle,
    Loading,
    Done,
}

/// Outcome of one successful analysis call. Owned by the workflow; pipelines
/// borrow it and never keep copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub text: String,
    pub subject_name: String,
}

/// Derived-asset state. Cycles idle -> loading -> done, or loading -> idle on
/// failure, and is only reachable out of idle while the workflow is in
/// `Result`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpiritRecord {
    pub status: SpiritStatus,
    pub image_data: Option<String>,
    pub caption: Option<String>,
}

impl SpiritRecord {
    pub fn idle() -> Self {
        Self {
            status: SpiritStatus::Idle,
            image_data: None,
            caption: None,
        }
    }
}

impl Default for SpiritRecord {
    fn default() -> Self {
        Self::idle()
    }
}

/// The phase machine plus the entities whose lifecycle it governs.
#[derive(Debug, Clone)]
pub struct WorkflowState {
    phase: Phase,
    analysis: Option<AnalysisResult>,
    spirit: SpiritRecord,
}

impl WorkflowState {
    pub fn new() -> Self {
        Self {
            phase: Phase::Input,
            analysis: None,
            spirit: SpiritRecord::idle(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn analysis(&self) -> Option<&AnalysisResult> {
        self.analysis.as_ref()
    }

    pub fn spirit(&self) -> &SpiritRecord {
        &self.spirit
    }

    /// `Input`/`Result` -> `Loading`. Clears any previous analysis so a stale
    /// reading is never visible alongside the new run.
    pub fn begin_analysis(&mut self) -> Result<(), TotemError> {
        if self.phase == Phase::Loading {
            return Err(TotemError::Rejected("an analysis is already running"));
        }
        self.phase = Phase::Loading;
        self.analysis = None;
        self.spirit = SpiritRecord::idle();
        Ok(())
    }

    /// `Loading` -> `Result`, storing the reading and resetting the spirit.
    pub fn complete_analysis(&mut self, result: AnalysisResult) {
        self.phase = Phase::Result;
        self.analysis = Some(result);
        self.spirit = SpiritRecord::idle();
    }

    /// `Loading` -> `Input`; the failed run leaves nothing behind.
    pub fn fail_analysis(&mut self) {
        self.phase = Phase::Input;
        self.analysis = None;
        self.spirit = SpiritRecord::idle();
    }

    /// Spirit `Idle`/`Done` -> `Loading`, only once a reading exists.
    pub fn begin_spirit(&mut self) -> Result<&AnalysisResult, TotemError> {
        if self.phase != Phase::Result || self.analysis.is_none() {
            return Err(TotemError::Rejected(
                "no completed reading to summon a spirit from",
            ));
        }
        if self.spirit.status == SpiritStatus::Loading {
            return Err(TotemError::Rejected("a summoning is already running"));
        }
        self.spirit = SpiritRecord {
            status: SpiritStatus::Loading,
            image_data: None,
            caption: None,
        };
        Ok(self.analysis.as_ref().unwrap())
    }

    pub fn complete_spirit(&mut self, image_data: String, caption: String) {
        self.spirit = SpiritRecord {
            status: SpiritStatus::Done,
            image_data: Some(image_data),
            caption: Some(caption),
        };
    }

    /// Spirit `Loading` -> `Idle`; the caller surfaces the error message.
    pub fn fail_spirit(&mut self) {
        self.spirit = SpiritRecord::idle();
    }

    /// Unconditional return to `Input` from any phase.
    pub fn reset(&mut self) {
        self.phase = Phase::Input;
        self.analysis = None;
        self.spirit = SpiritRecord::idle();
    }
}

impl Default for WorkflowState {
    fn default() -> Self {
        Self::new()
    }
}
