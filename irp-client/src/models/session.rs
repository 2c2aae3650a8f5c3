//! Conversation session state machine
//!
//! A session progresses IDLE → SUBMITTING → POLLING → COMPLETED | FAILED,
//! with follow-up questions moving COMPLETED → FOLLOWUP_PENDING → COMPLETED.
//! Sessions live in memory only; a reset discards them.

use chrono::{DateTime, Utc};
use irp_common::events::SessionState;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// State transition record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub session_id: Uuid,
    pub old_state: SessionState,
    pub new_state: SessionState,
    pub transitioned_at: DateTime<Utc>,
}

/// Analysis payload returned by the backend
///
/// The payload layout is owned by the analysis service; only the summary
/// used as follow-up context is interpreted here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub payload: Value,
    pub received_at: DateTime<Utc>,
}

impl AnalysisResult {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            received_at: Utc::now(),
        }
    }

    /// Text summary of the analysis
    ///
    /// Uses the first present of `executive_summary`, `text`, `summary`,
    /// `investment_report`; a bare string payload is its own summary.
    pub fn summary(&self) -> String {
        match &self.payload {
            Value::String(text) => text.clone(),
            Value::Object(map) => ["executive_summary", "text", "summary", "investment_report"]
                .iter()
                .find_map(|key| map.get(*key))
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| self.payload.to_string()),
            Value::Null => String::new(),
            other => other.to_string(),
        }
    }
}

/// Kind of follow-up question
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowupKind {
    Financial,
    Market,
    Risk,
    Strategy,
    /// Free-form question; requires custom text
    Custom,
}

impl FollowupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FollowupKind::Financial => "financial",
            FollowupKind::Market => "market",
            FollowupKind::Risk => "risk",
            FollowupKind::Strategy => "strategy",
            FollowupKind::Custom => "custom",
        }
    }
}

impl fmt::Display for FollowupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for FollowupKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "financial" => Ok(FollowupKind::Financial),
            "market" => Ok(FollowupKind::Market),
            "risk" => Ok(FollowupKind::Risk),
            "strategy" => Ok(FollowupKind::Strategy),
            "custom" => Ok(FollowupKind::Custom),
            other => Err(format!("unknown follow-up kind: {}", other)),
        }
    }
}

/// One answered follow-up question
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowupEntry {
    pub kind: FollowupKind,
    pub custom_text: Option<String>,
    pub answer: String,
    pub metrics: Option<Value>,
    pub answered_at: DateTime<Utc>,
}

/// One user's end-to-end analysis conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSession {
    /// Local session identifier
    pub session_id: Uuid,

    /// Company the analysis is about
    pub company_label: String,

    /// Current workflow state
    pub state: SessionState,

    /// Backend analysis job (or project) id, once started
    pub job_id: Option<String>,

    /// Backend conversation id, assigned by the first follow-up
    pub remote_session_id: Option<String>,

    /// Latest analysis payload
    pub analysis: Option<AnalysisResult>,

    /// Follow-up answers, oldest first
    pub followups: Vec<FollowupEntry>,

    /// Last error surfaced to the user
    pub last_error: Option<String>,

    pub started_at: DateTime<Utc>,

    /// Set when the submit/poll flow reached COMPLETED or FAILED
    pub ended_at: Option<DateTime<Utc>>,
}

impl ConversationSession {
    pub fn new(company_label: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            company_label: company_label.into(),
            state: SessionState::Idle,
            job_id: None,
            remote_session_id: None,
            analysis: None,
            followups: Vec::new(),
            last_error: None,
            started_at: Utc::now(),
            ended_at: None,
        }
    }

    /// Transition to new state
    pub fn transition_to(&mut self, new_state: SessionState) -> StateTransition {
        let transition = StateTransition {
            session_id: self.session_id,
            old_state: self.state,
            new_state,
            transitioned_at: Utc::now(),
        };
        self.state = new_state;

        if new_state.is_terminal() && self.ended_at.is_none() {
            self.ended_at = Some(Utc::now());
        }

        transition
    }

    /// Context sent with follow-up questions
    pub fn previous_context(&self) -> String {
        let mut context = self
            .analysis
            .as_ref()
            .map(|a| a.summary())
            .unwrap_or_default();

        for entry in &self.followups {
            if !context.is_empty() {
                context.push_str("\n\n");
            }
            context.push_str(&format!("[{}] {}", entry.kind, entry.answer));
        }
        context
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_new_session_is_idle() {
        let session = ConversationSession::new("Acme");
        assert_eq!(session.state, SessionState::Idle);
        assert!(session.analysis.is_none());
        assert!(session.ended_at.is_none());
    }

    #[test]
    fn test_transition_records_old_state_and_end_time() {
        let mut session = ConversationSession::new("Acme");
        let t = session.transition_to(SessionState::Submitting);
        assert_eq!(t.old_state, SessionState::Idle);
        assert_eq!(t.new_state, SessionState::Submitting);
        assert!(session.ended_at.is_none());

        session.transition_to(SessionState::Completed);
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn test_summary_prefers_executive_summary() {
        let result = AnalysisResult::new(json!({
            "investment_report": "long report",
            "executive_summary": "short summary"
        }));
        assert_eq!(result.summary(), "short summary");

        let plain = AnalysisResult::new(json!("plain text"));
        assert_eq!(plain.summary(), "plain text");
    }

    #[test]
    fn test_previous_context_includes_followups() {
        let mut session = ConversationSession::new("Acme");
        session.analysis = Some(AnalysisResult::new(json!({"text": "base"})));
        session.followups.push(FollowupEntry {
            kind: FollowupKind::Risk,
            custom_text: None,
            answer: "risks are low".to_string(),
            metrics: None,
            answered_at: Utc::now(),
        });

        assert_eq!(session.previous_context(), "base\n\n[risk] risks are low");
    }

    #[test]
    fn test_followup_kind_parse() {
        assert_eq!("Financial".parse::<FollowupKind>().unwrap(), FollowupKind::Financial);
        assert!("weather".parse::<FollowupKind>().is_err());
    }
}
