use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::WorkflowError;

/// Longest dream description a session will accept. The interactive surface
/// enforces this too, but the contract is owned here.
pub const DREAM_TEXT_MAX_CHARS: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    LoggedOut,
    Main,
    Loading,
    ShowCandidates,
    Success,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoggedOut => "logged_out",
            Self::Main => "main",
            Self::Loading => "loading",
            Self::ShowCandidates => "show_candidates",
            Self::Success => "success",
        }
    }

    /// The allowed transition table. Logout is reachable from every state;
    /// everything else follows the one-way flow of a generation cycle.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        if next == Self::LoggedOut {
            return true;
        }
        matches!(
            (self, next),
            (Self::LoggedOut, Self::Main)
                | (Self::Main, Self::Loading)
                | (Self::Loading, Self::ShowCandidates)
                | (Self::Loading, Self::Main)
                | (Self::ShowCandidates, Self::Success)
                | (Self::ShowCandidates, Self::Main)
        )
    }
}

/// One image returned by a completed generation job, pending user selection.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateImage {
    pub artifact_id: String,
    pub source_url: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Pending,
    Complete { result_urls: Vec<String> },
    Failed { reason: String },
}

/// One submitted request to the external generator. Discarded as soon as the
/// owning session transition finishes with it.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationJob {
    pub job_id: String,
    pub status: JobStatus,
}

impl GenerationJob {
    pub fn pending(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            status: JobStatus::Pending,
        }
    }
}

/// One authenticated user's interaction context. State moves only through
/// [`Session::transition_to`], which rejects edges missing from the table, so
/// call sites cannot invent shortcuts through the flow.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    state: SessionState,
    pub username: String,
    pub dream_text: String,
    pub translated_prompt: Option<String>,
    pub reference_image_id: Option<String>,
    pub candidates: Vec<CandidateImage>,
    pub selected: Option<usize>,
    pub error_message: Option<String>,
}

impl Session {
    pub fn new() -> Self {
        Self {
            session_id: Uuid::new_v4().to_string(),
            state: SessionState::LoggedOut,
            username: String::new(),
            dream_text: String::new(),
            translated_prompt: None,
            reference_image_id: None,
            candidates: Vec::new(),
            selected: None,
            error_message: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn transition_to(&mut self, next: SessionState) -> Result<(), WorkflowError> {
        if !self.state.can_transition_to(next) {
            return Err(WorkflowError::InvalidTransition {
                action: next.as_str(),
                state: self.state.as_str(),
            });
        }
        self.state = next;
        Ok(())
    }

    /// Drops everything produced by the current generation cycle. The
    /// username survives so a "start over" keeps the login.
    pub fn clear_flow_data(&mut self) {
        self.dream_text.clear();
        self.translated_prompt = None;
        self.reference_image_id = None;
        self.candidates.clear();
        self.selected = None;
        self.error_message = None;
    }

    pub fn selected_candidate(&self) -> Option<&CandidateImage> {
        self.selected.and_then(|index| self.candidates.get(index))
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}
