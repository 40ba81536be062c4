use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    pub source: String,
    pub xp: i64,
    pub meta: Value,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: Uuid,
    pub source: String,
    pub xp: i64,
    pub meta: Value,
    pub dedupe_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewLedgerEntry {
    pub fn into_entry(self) -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            user_id: self.user_id,
            source: self.source,
            xp: self.xp,
            meta: self.meta,
            dedupe_key: self.dedupe_key,
            created_at: self.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum AppendOutcome {
    Appended(LedgerEntry),
    /// An entry with the same dedupe key already exists.
    Duplicate,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressionProfile {
    pub user_id: Uuid,
    pub xp_total: i64,
    pub level: i32,
    pub current_streak: i32,
    pub longest_streak: i32,
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Last instant the streak tracker counted a day; awards do not move it.
    pub last_streak_at: Option<DateTime<Utc>>,
}

impl ProgressionProfile {
    pub fn new(user_id: Uuid) -> Self {
        Self {
            user_id,
            xp_total: 0,
            level: 1,
            current_streak: 0,
            longest_streak: 0,
            last_activity_at: None,
            last_streak_at: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileSource {
    Cache,
    Aggregated,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SourcedProfile {
    pub profile: ProgressionProfile,
    pub source: ProfileSource,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BadgeCriteria {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BadgeDefinition {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub description: String,
    pub icon_url: Option<String>,
    pub criteria: BadgeCriteria,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserBadge {
    pub badge_id: Uuid,
    pub code: String,
    pub name: String,
    pub icon_url: Option<String>,
    pub granted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionKind {
    Daily,
    Weekly,
}

impl MissionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionKind::Daily => "daily",
            MissionKind::Weekly => "weekly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(MissionKind::Daily),
            "weekly" => Some(MissionKind::Weekly),
            _ => None,
        }
    }
}

fn one() -> u32 {
    1
}

/// Completion rule stored as JSON in the mission catalog, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MissionRule {
    Submit {
        count: u32,
    },
    Quiz {
        count: u32,
    },
    Focus {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        minutes: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hours: Option<f64>,
    },
    Login,
    PerfectScore {
        #[serde(default = "one")]
        count: u32,
    },
    PerfectScores {
        count: u32,
    },
    EarlySubmission {
        #[serde(default = "one")]
        count: u32,
    },
    AllOnTime,
    Streak {
        days: u32,
    },
    ImproveAverage {
        percent: f64,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionDefinition {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub kind: MissionKind,
    pub rules: MissionRule,
    pub reward_xp: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissionStatus {
    Active,
    Completed,
}

impl MissionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MissionStatus::Active => "active",
            MissionStatus::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "active" => Some(MissionStatus::Active),
            "completed" => Some(MissionStatus::Completed),
            _ => None,
        }
    }
}

/// Accumulated progress of one mission instance. Only the fields relevant to
/// the mission's rule are ever set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MissionProgress {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub submissions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quizzes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logged_in: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub perfect_scores: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub early_submissions: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub all_on_time: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub streak_days: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub improvement_percent: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UserMission {
    pub user_id: Uuid,
    pub mission_id: Uuid,
    pub status: MissionStatus,
    pub progress: MissionProgress,
    pub reset_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionView {
    pub mission: MissionDefinition,
    pub instance: UserMission,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusSession {
    pub id: Uuid,
    pub user_id: Uuid,
    pub technique: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_min: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RankPeriod {
    Daily,
    Weekly,
}

impl RankPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RankPeriod::Daily => "daily",
            RankPeriod::Weekly => "weekly",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "daily" => Some(RankPeriod::Daily),
            "weekly" => Some(RankPeriod::Weekly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankEntry {
    pub position: usize,
    pub user_id: Uuid,
    pub display_name: String,
    pub xp: i64,
    pub level: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassRankSnapshot {
    pub id: Uuid,
    pub class_id: Uuid,
    pub period: RankPeriod,
    pub generated_at: DateTime<Utc>,
    pub rank_data: Vec<RankEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AwardOutcome {
    pub xp_added: i64,
    pub new_total_xp: i64,
    pub new_level: i32,
    pub leveled_up: bool,
    pub xp_for_next_level: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProfileView {
    pub user_id: Uuid,
    pub xp_total: i64,
    pub level: i32,
    pub current_streak: i32,
    pub longest_streak: i32,
    pub xp_for_next_level: i64,
    pub progress_percent: u8,
    pub badges: Vec<UserBadge>,
    pub source: ProfileSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StreakOutcome {
    pub current_streak: i32,
    pub longest_streak: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MissionResult {
    Completed { xp_earned: i64 },
    Progressed { progress: MissionProgress },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MissionOutcome {
    pub mission_code: String,
    #[serde(flatten)]
    pub result: MissionResult,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusOutcome {
    pub duration_min: i32,
    pub xp_earned: i64,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FocusStats {
    pub total_sessions: usize,
    pub total_minutes: i64,
    pub total_hours: i64,
    pub by_technique: Vec<(String, usize)>,
    pub recent_sessions: Vec<FocusSession>,
    pub daily_xp_earned: i64,
    pub daily_xp_remaining: i64,
    pub daily_xp_limit: i64,
}
