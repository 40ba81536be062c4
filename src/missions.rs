use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::engine::{Grant, ProgressionEngine};
use crate::error::{EngineError, EngineResult};
use crate::models::{
    MissionDefinition, MissionKind, MissionOutcome, MissionProgress, MissionResult, MissionRule,
    MissionStatus, MissionView, UserMission,
};

/// Tracked domain events missions can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MissionEvent {
    Submit,
    Quiz,
    Focus,
    Login,
    PerfectScore,
    EarlySubmission,
    AllOnTime,
    Streak,
    ImproveAverage,
}

impl MissionEvent {
    pub fn parse(value: &str) -> Option<Self> {
        let event = match value {
            "submit" => MissionEvent::Submit,
            "quiz" => MissionEvent::Quiz,
            "focus" => MissionEvent::Focus,
            "login" => MissionEvent::Login,
            "perfect_score" | "perfect_scores" => MissionEvent::PerfectScore,
            "early_submission" => MissionEvent::EarlySubmission,
            "all_on_time" => MissionEvent::AllOnTime,
            "streak" => MissionEvent::Streak,
            "improve_average" => MissionEvent::ImproveAverage,
            _ => return None,
        };
        Some(event)
    }
}

impl fmt::Display for MissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MissionEvent::Submit => "submit",
            MissionEvent::Quiz => "quiz",
            MissionEvent::Focus => "focus",
            MissionEvent::Login => "login",
            MissionEvent::PerfectScore => "perfect_score",
            MissionEvent::EarlySubmission => "early_submission",
            MissionEvent::AllOnTime => "all_on_time",
            MissionEvent::Streak => "streak",
            MissionEvent::ImproveAverage => "improve_average",
        };
        f.write_str(name)
    }
}

/// Context carried by a tracked event.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MissionEventData {
    pub minutes: Option<u32>,
    pub streak_days: Option<u32>,
    pub improvement_percent: Option<f64>,
    pub all_on_time: Option<bool>,
}

impl MissionRule {
    pub fn event(&self) -> Option<MissionEvent> {
        match self {
            MissionRule::Submit { .. } => Some(MissionEvent::Submit),
            MissionRule::Quiz { .. } => Some(MissionEvent::Quiz),
            MissionRule::Focus { .. } => Some(MissionEvent::Focus),
            MissionRule::Login => Some(MissionEvent::Login),
            MissionRule::PerfectScore { .. } | MissionRule::PerfectScores { .. } => {
                Some(MissionEvent::PerfectScore)
            }
            MissionRule::EarlySubmission { .. } => Some(MissionEvent::EarlySubmission),
            MissionRule::AllOnTime => Some(MissionEvent::AllOnTime),
            MissionRule::Streak { .. } => Some(MissionEvent::Streak),
            MissionRule::ImproveAverage { .. } => Some(MissionEvent::ImproveAverage),
            MissionRule::Unknown => None,
        }
    }

    pub fn is_satisfied(&self, progress: &MissionProgress) -> bool {
        match self {
            MissionRule::Submit { count } => progress.submissions.unwrap_or(0) >= *count,
            MissionRule::Quiz { count } => progress.quizzes.unwrap_or(0) >= *count,
            MissionRule::Focus { minutes, hours } => {
                let target = match (minutes, hours) {
                    (Some(minutes), _) => f64::from(*minutes),
                    (None, Some(hours)) => hours * 60.0,
                    (None, None) => return false,
                };
                f64::from(progress.minutes.unwrap_or(0)) >= target
            }
            MissionRule::Login => progress.logged_in == Some(true),
            MissionRule::PerfectScore { count } | MissionRule::PerfectScores { count } => {
                progress.perfect_scores.unwrap_or(0) >= *count
            }
            MissionRule::EarlySubmission { count } => {
                progress.early_submissions.unwrap_or(0) >= (*count).max(1)
            }
            MissionRule::AllOnTime => progress.all_on_time == Some(true),
            MissionRule::Streak { days } => progress.streak_days.unwrap_or(0) >= *days,
            MissionRule::ImproveAverage { percent } => {
                progress.improvement_percent.unwrap_or(0.0) >= *percent
            }
            MissionRule::Unknown => false,
        }
    }
}

/// Folds one event into the progress accumulator.
pub fn accumulate(
    progress: &MissionProgress,
    event: MissionEvent,
    data: &MissionEventData,
) -> MissionProgress {
    let mut next = progress.clone();
    let bump = |count: Option<u32>| Some(count.unwrap_or(0).saturating_add(1));

    match event {
        MissionEvent::Submit => next.submissions = bump(progress.submissions),
        MissionEvent::Quiz => next.quizzes = bump(progress.quizzes),
        MissionEvent::Focus => {
            let minutes = progress.minutes.unwrap_or(0);
            next.minutes = Some(minutes.saturating_add(data.minutes.unwrap_or(0)));
        }
        MissionEvent::Login => next.logged_in = Some(true),
        MissionEvent::PerfectScore => next.perfect_scores = bump(progress.perfect_scores),
        MissionEvent::EarlySubmission => {
            next.early_submissions = bump(progress.early_submissions)
        }
        MissionEvent::AllOnTime => next.all_on_time = Some(data.all_on_time.unwrap_or(true)),
        MissionEvent::Streak => {
            let days = data.streak_days.unwrap_or(0);
            next.streak_days = Some(progress.streak_days.unwrap_or(0).max(days));
        }
        MissionEvent::ImproveAverage => {
            if let Some(percent) = data.improvement_percent {
                let best = progress.improvement_percent.unwrap_or(f64::MIN).max(percent);
                next.improvement_percent = Some(best);
            }
        }
    }

    next
}

/// Overlays every field set in `patch` onto `progress`.
pub fn merge(progress: &MissionProgress, patch: &MissionProgress) -> MissionProgress {
    MissionProgress {
        submissions: patch.submissions.or(progress.submissions),
        quizzes: patch.quizzes.or(progress.quizzes),
        minutes: patch.minutes.or(progress.minutes),
        logged_in: patch.logged_in.or(progress.logged_in),
        perfect_scores: patch.perfect_scores.or(progress.perfect_scores),
        early_submissions: patch.early_submissions.or(progress.early_submissions),
        all_on_time: patch.all_on_time.or(progress.all_on_time),
        streak_days: patch.streak_days.or(progress.streak_days),
        improvement_percent: patch.improvement_percent.or(progress.improvement_percent),
    }
}

pub fn cycle_end(kind: MissionKind, now: DateTime<Utc>, calendar: &Calendar) -> DateTime<Utc> {
    match kind {
        MissionKind::Daily => calendar.end_of_day(now),
        MissionKind::Weekly => calendar.end_of_week(now),
    }
}

pub fn fresh_instance(
    user_id: Uuid,
    mission: &MissionDefinition,
    now: DateTime<Utc>,
    calendar: &Calendar,
) -> UserMission {
    UserMission {
        user_id,
        mission_id: mission.id,
        status: MissionStatus::Active,
        progress: MissionProgress::default(),
        reset_at: cycle_end(mission.kind, now, calendar),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expiry {
    Current(UserMission),
    Renewed {
        expired_reset_at: DateTime<Utc>,
        fresh: UserMission,
    },
}

/// An instance past its `reset_at` is replaced by a zeroed active one,
/// whatever its status was.
pub fn resolve_expiry(
    instance: UserMission,
    mission: &MissionDefinition,
    now: DateTime<Utc>,
    calendar: &Calendar,
) -> Expiry {
    if now <= instance.reset_at {
        return Expiry::Current(instance);
    }
    Expiry::Renewed {
        expired_reset_at: instance.reset_at,
        fresh: fresh_instance(instance.user_id, mission, now, calendar),
    }
}

impl ProgressionEngine {
    /// Every catalog mission for the user, initialised on first need and
    /// renewed when its cycle has ended.
    pub async fn list_missions(&self, user_id: Uuid) -> EngineResult<Vec<MissionView>> {
        let catalog = self
            .deps
            .catalog
            .missions()
            .await
            .map_err(EngineError::Catalog)?;
        let mut existing: HashMap<Uuid, UserMission> = self
            .deps
            .missions
            .instances_for(user_id)
            .await?
            .into_iter()
            .map(|instance| (instance.mission_id, instance))
            .collect();

        let now = self.now();
        let mut views = Vec::with_capacity(catalog.len());

        for mission in catalog {
            let instance = match existing.remove(&mission.id) {
                Some(instance) => match resolve_expiry(instance, &mission, now, &self.calendar) {
                    Expiry::Current(instance) => instance,
                    Expiry::Renewed {
                        expired_reset_at,
                        fresh,
                    } => {
                        self.deps.missions.renew(expired_reset_at, &fresh).await?;
                        info!(%user_id, mission = %mission.code, reset_at = %fresh.reset_at, "mission renewed");
                        fresh
                    }
                },
                None => {
                    let fresh = fresh_instance(user_id, &mission, now, &self.calendar);
                    if self.deps.missions.insert_if_absent(&fresh).await? {
                        debug!(%user_id, mission = %mission.code, "mission initialised");
                        fresh
                    } else {
                        // Another caller initialised it first; serve what it stored.
                        self.deps
                            .missions
                            .instances_for(user_id)
                            .await?
                            .into_iter()
                            .find(|stored| stored.mission_id == mission.id)
                            .unwrap_or(fresh)
                    }
                }
            };
            views.push(MissionView { mission, instance });
        }

        Ok(views)
    }

    pub async fn track_mission_event(
        &self,
        user_id: Uuid,
        event: MissionEvent,
        data: &MissionEventData,
    ) -> EngineResult<Vec<MissionOutcome>> {
        let mut outcomes = Vec::new();

        for view in self.list_missions(user_id).await? {
            if view.instance.status != MissionStatus::Active
                || view.mission.rules.event() != Some(event)
            {
                continue;
            }
            let progress = accumulate(&view.instance.progress, event, data);
            outcomes.push(self.advance_mission(user_id, &view, progress).await?);
        }

        Ok(outcomes)
    }

    pub async fn update_mission_progress(
        &self,
        user_id: Uuid,
        code: &str,
        patch: &MissionProgress,
    ) -> EngineResult<MissionOutcome> {
        if self
            .deps
            .catalog
            .mission_by_code(code)
            .await
            .map_err(EngineError::Catalog)?
            .is_none()
        {
            return Err(EngineError::UnknownMission(code.to_string()));
        }

        let view = self
            .list_missions(user_id)
            .await?
            .into_iter()
            .find(|view| view.mission.code == code)
            .filter(|view| view.instance.status == MissionStatus::Active)
            .ok_or_else(|| EngineError::MissionNotActive(code.to_string()))?;

        let progress = merge(&view.instance.progress, patch);
        self.advance_mission(user_id, &view, progress).await
    }

    /// The reward is appended (keyed by cycle) before the instance is marked
    /// completed, so a failed append leaves the mission active for a retry.
    async fn advance_mission(
        &self,
        user_id: Uuid,
        view: &MissionView,
        progress: MissionProgress,
    ) -> EngineResult<MissionOutcome> {
        let mission = &view.mission;
        let cycle = view.instance.reset_at;

        if !mission.rules.is_satisfied(&progress) {
            self.deps
                .missions
                .save_progress(user_id, mission.id, cycle, &progress)
                .await?;
            return Ok(MissionOutcome {
                mission_code: mission.code.clone(),
                result: MissionResult::Progressed { progress },
            });
        }

        let reward = self
            .grant(Grant {
                user_id,
                xp: mission.reward_xp.max(0),
                source: format!("mission_{}", mission.code),
                meta: json!({ "mission_code": mission.code, "cycle": cycle }),
                dedupe_key: Some(format!(
                    "mission:{}:{}:{}",
                    mission.id,
                    user_id,
                    cycle.timestamp_millis()
                )),
            })
            .await?;

        let completed = self
            .deps
            .missions
            .complete(user_id, mission.id, cycle, &progress)
            .await?;
        if completed {
            info!(%user_id, mission = %mission.code, xp = reward.xp_added, "mission completed");
        }

        Ok(MissionOutcome {
            mission_code: mission.code.clone(),
            result: MissionResult::Completed {
                xp_earned: reward.xp_added,
            },
        })
    }
}
