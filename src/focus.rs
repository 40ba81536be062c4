use std::collections::BTreeMap;

use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::Technique;
use crate::engine::ProgressionEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{FocusOutcome, FocusSession, FocusStats, NewLedgerEntry};

pub const FOCUS_SOURCE: &str = "focus_session";
const RECENT_SESSIONS: usize = 7;

impl ProgressionEngine {
    fn technique(&self, name: &str) -> EngineResult<&Technique> {
        self.config
            .technique(name)
            .ok_or_else(|| EngineError::UnknownTechnique(name.to_string()))
    }

    pub async fn start_focus_session(
        &self,
        user_id: Uuid,
        technique: &str,
    ) -> EngineResult<FocusSession> {
        self.technique(technique)?;

        let session = FocusSession {
            id: Uuid::new_v4(),
            user_id,
            technique: technique.to_string(),
            started_at: self.now(),
            ended_at: None,
            duration_min: None,
        };
        self.deps.focus.start(&session).await?;
        debug!(%user_id, session = %session.id, technique, "focus session started");
        Ok(session)
    }

    pub async fn end_focus_session(
        &self,
        session_id: Uuid,
        user_id: Uuid,
    ) -> EngineResult<FocusOutcome> {
        let session = self
            .deps
            .focus
            .get(session_id, user_id)
            .await?
            .ok_or(EngineError::SessionNotFound(session_id))?;
        let technique = self.technique(&session.technique)?;
        let now = self.now();

        // An ended session goes through the keyed append again, so a grant
        // that failed earlier is paid on retry and a paid one is not repeated.
        let (ended_at, duration_min) = match (session.ended_at, session.duration_min) {
            (Some(ended_at), Some(duration_min)) => (ended_at, duration_min),
            _ => {
                let elapsed = (now - session.started_at).num_minutes().max(0);
                let duration_min = i32::try_from(elapsed).unwrap_or(i32::MAX);
                self.deps.focus.finish(session_id, now, duration_min).await?;
                (now, duration_min)
            }
        };

        let completed = duration_min >= technique.work_minutes;
        if !completed {
            debug!(%user_id, session = %session_id, duration_min, "focus session too short for xp");
            return Ok(FocusOutcome {
                duration_min,
                xp_earned: 0,
                completed,
            });
        }

        let entry = NewLedgerEntry {
            user_id,
            source: FOCUS_SOURCE.to_string(),
            xp: technique.xp,
            meta: json!({
                "session_id": session_id,
                "technique": session.technique,
                "duration_min": duration_min,
            }),
            dedupe_key: Some(format!("focus:{session_id}")),
            created_at: ended_at,
        };
        let since = self.calendar.start_of_day(ended_at);
        let xp_earned = self
            .bounded(
                self.deps
                    .ledger
                    .append_capped(entry, since, self.config.focus.daily_xp_limit),
            )
            .await
            .map_err(|source| EngineError::Durability { user_id, source })?;

        if xp_earned > 0 {
            info!(%user_id, session = %session_id, xp = xp_earned, "focus xp granted");
            self.apply_grant(user_id, xp_earned, now).await?;
        } else {
            debug!(%user_id, session = %session_id, "no focus xp left to grant");
        }

        Ok(FocusOutcome {
            duration_min,
            xp_earned,
            completed,
        })
    }

    pub async fn cancel_focus_session(&self, session_id: Uuid, user_id: Uuid) -> EngineResult<bool> {
        Ok(self.deps.focus.cancel(session_id, user_id).await?)
    }

    pub async fn active_focus_session(&self, user_id: Uuid) -> EngineResult<Option<FocusSession>> {
        Ok(self.deps.focus.active_for(user_id).await?)
    }

    pub async fn daily_focus_xp(&self, user_id: Uuid) -> EngineResult<i64> {
        let since = self.calendar.start_of_day(self.now());
        Ok(self.deps.ledger.sum_since(user_id, FOCUS_SOURCE, since).await?)
    }

    pub async fn focus_stats(&self, user_id: Uuid) -> EngineResult<FocusStats> {
        let sessions = self.deps.focus.finished_for(user_id).await?;
        let total_minutes: i64 = sessions
            .iter()
            .map(|s| i64::from(s.duration_min.unwrap_or(0)))
            .sum();

        let mut by_technique: BTreeMap<String, usize> = self
            .config
            .focus
            .techniques
            .iter()
            .map(|t| (t.name.clone(), 0))
            .collect();
        for session in &sessions {
            if let Some(count) = by_technique.get_mut(&session.technique) {
                *count += 1;
            }
        }

        let daily_xp_earned = self.daily_focus_xp(user_id).await?;
        let limit = self.config.focus.daily_xp_limit;

        Ok(FocusStats {
            total_sessions: sessions.len(),
            total_minutes,
            total_hours: total_minutes / 60,
            by_technique: by_technique.into_iter().collect(),
            recent_sessions: sessions.into_iter().take(RECENT_SESSIONS).collect(),
            daily_xp_earned,
            daily_xp_remaining: (limit - daily_xp_earned).max(0),
            daily_xp_limit: limit,
        })
    }
}
