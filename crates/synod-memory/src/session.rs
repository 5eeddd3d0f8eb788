//! Multi-round private chats and meetings
//!
//! A session records who may speak and what was said, round by round. It
//! never decides when a discussion is over: [`CommunicationSession::round_count`]
//! and [`CommunicationSession::members`] are exposed so an external decision
//! step can stop it with [`SessionManager::close`].

use crate::embedding::tokenize;
use crate::error::{SynodError, SynodResult};
use crate::storage::{MemoryQuery, MemoryValue};
use crate::system::SystemHandle;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

const NAMESPACE: &str = "session";

/// Distinct content tokens two turns must share to count as a reference
const REFERENCE_OVERLAP: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionKind {
    /// Initiator plus exactly one target
    PrivateChat,
    /// Initiator plus two or more participants
    Meeting,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PrivateChat => write!(f, "private_chat"),
            Self::Meeting => write!(f, "meeting"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Open,
    Closed,
}

/// One contribution to a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub agent_id: String,

    /// 1-based, non-decreasing within a session
    pub round: u32,

    pub content: String,

    pub created_at: DateTime<Utc>,

    references_prior: bool,
}

impl Turn {
    /// Whether this turn appears to build on earlier rounds
    ///
    /// Heuristic only: true when the content names another member or shares
    /// enough content words with turns from previous rounds. Always true for
    /// first-round turns.
    pub fn references_prior(&self) -> bool {
        self.references_prior
    }
}

/// A private chat or meeting transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommunicationSession {
    pub id: String,
    pub kind: SessionKind,
    pub initiator: String,

    /// Everyone invited besides the initiator
    pub participants: BTreeSet<String>,

    pub topic: String,
    pub turns: Vec<Turn>,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
}

impl CommunicationSession {
    /// Initiator followed by the participants
    pub fn members(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.initiator.as_str()).chain(self.participants.iter().map(String::as_str))
    }

    pub fn is_member(&self, agent_id: &str) -> bool {
        self.initiator == agent_id || self.participants.contains(agent_id)
    }

    /// Highest round seen so far, 0 before the first turn
    pub fn current_round(&self) -> u32 {
        self.turns.last().map(|t| t.round).unwrap_or(0)
    }

    /// Number of distinct rounds with at least one turn
    pub fn round_count(&self) -> usize {
        self.turns
            .iter()
            .map(|t| t.round)
            .collect::<BTreeSet<_>>()
            .len()
    }

    pub fn is_open(&self) -> bool {
        self.status == SessionStatus::Open
    }

    /// Meeting turns from round 2 on are expected to build on earlier rounds
    pub fn requires_reference(&self, round: u32) -> bool {
        self.kind == SessionKind::Meeting && round >= 2
    }

    /// Turns that should reference earlier rounds but do not appear to
    pub fn unreferenced_turns(&self) -> Vec<&Turn> {
        self.turns
            .iter()
            .filter(|t| self.requires_reference(t.round) && !t.references_prior)
            .collect()
    }

    fn references_prior(&self, agent_id: &str, round: u32, content: &str) -> bool {
        if round < 2 {
            return true;
        }

        let tokens = tokenize(content);
        let names_member = self
            .members()
            .filter(|m| *m != agent_id)
            .map(tokenize)
            .any(|name| !name.is_empty() && tokens.windows(name.len()).any(|w| w == name.as_slice()));
        if names_member {
            return true;
        }

        let earlier: BTreeSet<String> = self
            .turns
            .iter()
            .filter(|t| t.round < round)
            .flat_map(|t| tokenize(&t.content))
            .filter(|t| t.len() > 3)
            .collect();
        let shared = tokens
            .into_iter()
            .filter(|t| earlier.contains(t))
            .collect::<BTreeSet<_>>()
            .len();
        shared >= REFERENCE_OVERLAP
    }
}

/// Open, extend and read communication sessions of the live run
#[derive(Clone)]
pub struct SessionManager {
    handle: SystemHandle,
}

impl SessionManager {
    pub(crate) fn new(handle: SystemHandle) -> Self {
        Self { handle }
    }

    /// Start a session and return its id
    ///
    /// `participants` excludes the initiator; it is deduplicated and an
    /// initiator listed there is dropped. A private chat needs exactly one
    /// participant, a meeting at least two.
    pub async fn open<I, S>(
        &self,
        kind: SessionKind,
        initiator: &str,
        participants: I,
        topic: &str,
    ) -> SynodResult<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let run = self.handle.active()?;
        let initiator = initiator.trim();
        if initiator.is_empty() {
            return Err(SynodError::invalid_input("initiator", "must not be empty"));
        }

        let participants: BTreeSet<String> = participants
            .into_iter()
            .map(|p| Into::<String>::into(p).trim().to_string())
            .filter(|p| !p.is_empty() && p != initiator)
            .collect();

        match kind {
            SessionKind::PrivateChat if participants.len() != 1 => {
                return Err(SynodError::invalid_input(
                    "participants",
                    format!(
                        "private_chat needs exactly one participant besides the initiator, got {}",
                        participants.len()
                    ),
                ));
            }
            SessionKind::Meeting if participants.len() < 2 => {
                return Err(SynodError::invalid_input(
                    "participants",
                    format!(
                        "meeting needs at least two participants besides the initiator, got {}",
                        participants.len()
                    ),
                ));
            }
            _ => {}
        }

        let session = CommunicationSession {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            initiator: initiator.to_string(),
            participants,
            topic: topic.to_string(),
            turns: Vec::new(),
            status: SessionStatus::Open,
            created_at: Utc::now(),
        };

        let key = self.key(&run.namespace(NAMESPACE), &session.id);
        self.save("open_session", &key, &session).await?;

        tracing::info!(
            session_id = %session.id,
            kind = %kind,
            initiator = initiator,
            participants = session.participants.len(),
            "Opened session"
        );
        Ok(session.id)
    }

    /// Record one turn
    ///
    /// Fails with `Unauthorized` for a non-member and `InvalidInput` for a
    /// closed session, round 0, a round below the current maximum or empty
    /// content.
    pub async fn append_turn(
        &self,
        session_id: &str,
        agent_id: &str,
        round: u32,
        content: &str,
    ) -> SynodResult<Turn> {
        let run = self.handle.active()?;
        let _guard = run.sessions.lock().await;

        let key = self.key(&run.namespace(NAMESPACE), session_id);
        let mut session = self.load("append_turn", &key, session_id).await?;

        if !session.is_open() {
            return Err(SynodError::invalid_input(
                "session",
                format!("session {} is closed", session_id),
            ));
        }
        if !session.is_member(agent_id) {
            tracing::warn!(
                session_id = session_id,
                agent_id = agent_id,
                "Rejected turn from non-participant"
            );
            return Err(SynodError::unauthorized(
                agent_id,
                &session.initiator,
                "append to",
                "session",
            ));
        }
        if round == 0 {
            return Err(SynodError::invalid_input("round", "rounds start at 1"));
        }
        let current = session.current_round();
        if round < current {
            return Err(SynodError::invalid_input(
                "round",
                format!("round {} is below the current round {}", round, current),
            ));
        }
        if content.trim().is_empty() {
            return Err(SynodError::invalid_input("content", "must not be empty"));
        }

        let turn = Turn {
            agent_id: agent_id.to_string(),
            round,
            content: content.to_string(),
            created_at: Utc::now(),
            references_prior: session.references_prior(agent_id, round, content),
        };
        if session.requires_reference(round) && !turn.references_prior {
            tracing::debug!(
                session_id = session_id,
                agent_id = agent_id,
                round = round,
                "Meeting turn does not reference earlier rounds"
            );
        }

        session.turns.push(turn.clone());
        self.save("append_turn", &key, &session).await?;
        Ok(turn)
    }

    /// Every turn in order
    pub async fn transcript(&self, session_id: &str) -> SynodResult<Vec<Turn>> {
        Ok(self.get(session_id).await?.turns)
    }

    /// Turns of rounds before `round`, the context for generating that round
    pub async fn transcript_before(&self, session_id: &str, round: u32) -> SynodResult<Vec<Turn>> {
        let mut turns = self.transcript(session_id).await?;
        turns.retain(|t| t.round < round);
        Ok(turns)
    }

    pub async fn get(&self, session_id: &str) -> SynodResult<CommunicationSession> {
        let run = self.handle.active()?;
        let key = self.key(&run.namespace(NAMESPACE), session_id);
        self.load("get_session", &key, session_id).await
    }

    /// Mark a session closed; closing twice is a no-op
    pub async fn close(&self, session_id: &str) -> SynodResult<()> {
        let run = self.handle.active()?;
        let _guard = run.sessions.lock().await;

        let key = self.key(&run.namespace(NAMESPACE), session_id);
        let mut session = self.load("close_session", &key, session_id).await?;
        if !session.is_open() {
            return Ok(());
        }

        session.status = SessionStatus::Closed;
        self.save("close_session", &key, &session).await?;
        tracing::info!(
            session_id = session_id,
            rounds = session.round_count(),
            turns = session.turns.len(),
            "Closed session"
        );
        Ok(())
    }

    /// Sessions `agent_id` belongs to, oldest first
    pub async fn list_for(&self, agent_id: &str) -> SynodResult<Vec<CommunicationSession>> {
        let run = self.handle.active()?;
        let storage = self.handle.storage();
        let query = MemoryQuery::new().with_namespace(run.namespace(NAMESPACE));
        let keys = self.handle.call("list_sessions", storage.keys(&query)).await?;

        let mut sessions = Vec::new();
        for key in keys {
            if let Some(value) = self.handle.call("list_sessions", storage.get(&key)).await? {
                let session = decode(&value)?;
                if session.is_member(agent_id) {
                    sessions.push(session);
                }
            }
        }
        sessions.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn key(&self, namespace: &str, session_id: &str) -> String {
        format!("{}::{}", namespace, session_id)
    }

    async fn load(
        &self,
        operation: &str,
        key: &str,
        session_id: &str,
    ) -> SynodResult<CommunicationSession> {
        let value = self
            .handle
            .call(operation, self.handle.storage().get(key))
            .await?
            .ok_or_else(|| SynodError::not_found("session", session_id))?;
        decode(&value)
    }

    async fn save(
        &self,
        operation: &str,
        key: &str,
        session: &CommunicationSession,
    ) -> SynodResult<()> {
        let value = serde_json::to_value(session)
            .map_err(|e| SynodError::storage("serialize_session", e))?;
        self.handle
            .call(operation, self.handle.storage().set(key, MemoryValue::Json(value)))
            .await
    }
}

fn decode(value: &MemoryValue) -> SynodResult<CommunicationSession> {
    let json = value.as_json().ok_or_else(|| SynodError::Storage {
        operation: "deserialize_session".to_string(),
        message: "expected a JSON value".to_string(),
    })?;
    serde_json::from_value(json.clone()).map_err(|e| SynodError::storage("deserialize_session", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SynodConfig;
    use crate::system::MemorySystem;

    async fn manager() -> SessionManager {
        let system = MemorySystem::new(SynodConfig::default()).unwrap();
        system.initialize("run-1").await.unwrap();
        system.sessions()
    }

    #[tokio::test]
    async fn test_private_chat_participant_count() {
        let sessions = manager().await;

        let err = sessions
            .open(SessionKind::PrivateChat, "pm", ["technical_analyst", "valuation_analyst"], "RSI")
            .await
            .unwrap_err();
        assert!(matches!(err, SynodError::InvalidInput { .. }));

        sessions
            .open(SessionKind::PrivateChat, "pm", ["technical_analyst"], "RSI")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_meeting_excludes_initiator_from_count() {
        let sessions = manager().await;
        let err = sessions
            .open(SessionKind::Meeting, "pm", ["pm", "risk_manager", "risk_manager"], "weekly")
            .await
            .unwrap_err();
        assert!(matches!(err, SynodError::InvalidInput { .. }));

        let id = sessions
            .open(SessionKind::Meeting, "pm", ["risk_manager", "valuation_analyst"], "weekly")
            .await
            .unwrap();
        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.members().collect::<Vec<_>>(), vec!["pm", "risk_manager", "valuation_analyst"]);
    }

    #[tokio::test]
    async fn test_turn_validation() {
        let sessions = manager().await;
        let id = sessions
            .open(SessionKind::PrivateChat, "pm", ["technical_analyst"], "RSI divergence")
            .await
            .unwrap();

        let err = sessions.append_turn(&id, "outsider", 1, "hello").await.unwrap_err();
        assert!(matches!(err, SynodError::Unauthorized { .. }));

        sessions.append_turn(&id, "pm", 2, "why the divergence?").await.unwrap();
        let err = sessions.append_turn(&id, "technical_analyst", 1, "late").await.unwrap_err();
        assert!(matches!(err, SynodError::InvalidInput { .. }));
        assert!(sessions.append_turn(&id, "technical_analyst", 0, "zero").await.is_err());

        sessions
            .append_turn(&id, "technical_analyst", 2, "volume confirms it")
            .await
            .unwrap();
        assert_eq!(sessions.transcript(&id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_transcript_before_and_round_count() {
        let sessions = manager().await;
        let id = sessions
            .open(SessionKind::Meeting, "pm", ["risk_manager", "valuation_analyst"], "sizing")
            .await
            .unwrap();

        sessions.append_turn(&id, "risk_manager", 1, "volatility elevated").await.unwrap();
        sessions.append_turn(&id, "valuation_analyst", 1, "discount widening").await.unwrap();
        sessions.append_turn(&id, "pm", 2, "noted").await.unwrap();

        let context = sessions.transcript_before(&id, 2).await.unwrap();
        assert_eq!(context.len(), 2);
        assert!(context.iter().all(|t| t.round == 1));

        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.round_count(), 2);
        assert_eq!(session.current_round(), 2);
    }

    #[tokio::test]
    async fn test_reference_heuristic_is_reported_not_enforced() {
        let sessions = manager().await;
        let id = sessions
            .open(SessionKind::Meeting, "pm", ["risk_manager", "valuation_analyst"], "sizing")
            .await
            .unwrap();

        sessions
            .append_turn(&id, "risk_manager", 1, "portfolio volatility elevated after earnings")
            .await
            .unwrap();
        let referencing = sessions
            .append_turn(&id, "valuation_analyst", 2, "elevated volatility argues for smaller positions")
            .await
            .unwrap();
        let naming = sessions
            .append_turn(&id, "pm", 2, "agree with risk manager")
            .await
            .unwrap();
        let unrelated = sessions
            .append_turn(&id, "risk_manager", 2, "lunch is ready")
            .await
            .unwrap();

        assert!(referencing.references_prior());
        assert!(naming.references_prior());
        assert!(!unrelated.references_prior());

        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.unreferenced_turns().len(), 1);
    }

    #[tokio::test]
    async fn test_member_names_match_whole_words() {
        let sessions = manager().await;
        let id = sessions
            .open(SessionKind::Meeting, "risk_manager", ["pm", "valuation_analyst"], "roadmap")
            .await
            .unwrap();

        sessions
            .append_turn(&id, "valuation_analyst", 1, "margins compress next quarter")
            .await
            .unwrap();
        let substring = sessions
            .append_turn(&id, "risk_manager", 2, "development budget slipped")
            .await
            .unwrap();
        let named = sessions
            .append_turn(&id, "valuation_analyst", 2, "the PM asked for sizing")
            .await
            .unwrap();

        assert!(!substring.references_prior());
        assert!(named.references_prior());
    }

    #[tokio::test]
    async fn test_padded_initiator_is_not_its_own_participant() {
        let sessions = manager().await;
        let err = sessions
            .open(SessionKind::PrivateChat, "pm ", ["pm", "  pm"], "sizing")
            .await
            .unwrap_err();
        assert!(matches!(err, SynodError::InvalidInput { .. }));

        let id = sessions
            .open(SessionKind::PrivateChat, " pm ", ["risk_manager"], "sizing")
            .await
            .unwrap();
        let session = sessions.get(&id).await.unwrap();
        assert_eq!(session.initiator, "pm");
        assert_eq!(session.members().collect::<Vec<_>>(), vec!["pm", "risk_manager"]);
    }

    #[tokio::test]
    async fn test_closed_session_rejects_turns() {
        let sessions = manager().await;
        let id = sessions
            .open(SessionKind::PrivateChat, "pm", ["technical_analyst"], "RSI")
            .await
            .unwrap();

        sessions.close(&id).await.unwrap();
        sessions.close(&id).await.unwrap();

        assert!(matches!(
            sessions.append_turn(&id, "pm", 1, "hello").await,
            Err(SynodError::InvalidInput { .. })
        ));
        assert_eq!(sessions.get(&id).await.unwrap().status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn test_list_for_members_only() {
        let sessions = manager().await;
        sessions
            .open(SessionKind::PrivateChat, "pm", ["technical_analyst"], "a")
            .await
            .unwrap();
        sessions
            .open(SessionKind::Meeting, "pm", ["risk_manager", "valuation_analyst"], "b")
            .await
            .unwrap();

        assert_eq!(sessions.list_for("pm").await.unwrap().len(), 2);
        assert_eq!(sessions.list_for("technical_analyst").await.unwrap().len(), 1);
        assert!(sessions.list_for("nobody").await.unwrap().is_empty());
        assert!(matches!(
            sessions.get("missing").await,
            Err(SynodError::NotFound { .. })
        ));
    }
}
