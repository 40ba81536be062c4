//! Collaborator boundaries of the engine.
//!
//! Every store returns `anyhow::Result`; the engine decides which failures are
//! fatal. Inserts that collide with an existing row report `false`/`Duplicate`
//! instead of failing.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    AppendOutcome, BadgeDefinition, ClassRankSnapshot, FocusSession, LedgerEntry,
    MissionDefinition, MissionProgress, NewLedgerEntry, ProgressionProfile, RankPeriod,
    UserBadge, UserMission,
};

#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn append(&self, entry: NewLedgerEntry) -> anyhow::Result<AppendOutcome>;

    /// Appends `entry` with its XP clamped so that the user's total for
    /// `entry.source` since `since` stays at or below `cap`. Returns the XP
    /// actually granted; nothing is written when that is zero.
    async fn append_capped(
        &self,
        entry: NewLedgerEntry,
        since: DateTime<Utc>,
        cap: i64,
    ) -> anyhow::Result<i64>;

    async fn total_for(&self, user_id: Uuid) -> anyhow::Result<i64>;

    async fn sum_since(
        &self,
        user_id: Uuid,
        source: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64>;

    async fn entries_for(&self, user_id: Uuid) -> anyhow::Result<Vec<LedgerEntry>>;
}

#[async_trait]
pub trait ProfileStore: Send + Sync {
    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<ProgressionProfile>>;

    async fn insert_if_absent(&self, profile: &ProgressionProfile) -> anyhow::Result<bool>;

    async fn save_xp(
        &self,
        user_id: Uuid,
        xp_total: i64,
        level: i32,
        last_activity_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Writes the streak only if `last_streak_at` still equals `expected`.
    async fn save_streak(
        &self,
        profile: &ProgressionProfile,
        expected: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait Catalog: Send + Sync {
    async fn badges(&self) -> anyhow::Result<Vec<BadgeDefinition>>;

    async fn missions(&self) -> anyhow::Result<Vec<MissionDefinition>>;

    async fn mission_by_code(&self, code: &str) -> anyhow::Result<Option<MissionDefinition>>;
}

#[async_trait]
pub trait BadgeStore: Send + Sync {
    async fn grant_if_absent(
        &self,
        user_id: Uuid,
        badge_id: Uuid,
        granted_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    async fn badges_for(&self, user_id: Uuid) -> anyhow::Result<Vec<UserBadge>>;
}

#[async_trait]
pub trait MissionStore: Send + Sync {
    async fn instances_for(&self, user_id: Uuid) -> anyhow::Result<Vec<UserMission>>;

    async fn insert_if_absent(&self, instance: &UserMission) -> anyhow::Result<bool>;

    /// Replaces the instance whose cycle ended at `expired_reset_at` with
    /// `fresh`. A no-op if another caller already renewed it.
    async fn renew(
        &self,
        expired_reset_at: DateTime<Utc>,
        fresh: &UserMission,
    ) -> anyhow::Result<()>;

    async fn save_progress(
        &self,
        user_id: Uuid,
        mission_id: Uuid,
        cycle: DateTime<Utc>,
        progress: &MissionProgress,
    ) -> anyhow::Result<()>;

    /// Moves the active instance of `cycle` to completed. Returns `false` when
    /// it was already completed or belongs to another cycle.
    async fn complete(
        &self,
        user_id: Uuid,
        mission_id: Uuid,
        cycle: DateTime<Utc>,
        progress: &MissionProgress,
    ) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait FocusStore: Send + Sync {
    async fn start(&self, session: &FocusSession) -> anyhow::Result<()>;

    async fn get(&self, session_id: Uuid, user_id: Uuid) -> anyhow::Result<Option<FocusSession>>;

    async fn finish(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_min: i32,
    ) -> anyhow::Result<()>;

    async fn cancel(&self, session_id: Uuid, user_id: Uuid) -> anyhow::Result<bool>;

    async fn active_for(&self, user_id: Uuid) -> anyhow::Result<Option<FocusSession>>;

    /// Finished sessions, newest first.
    async fn finished_for(&self, user_id: Uuid) -> anyhow::Result<Vec<FocusSession>>;
}

#[async_trait]
pub trait Roster: Send + Sync {
    async fn members(&self, class_id: Uuid) -> anyhow::Result<Vec<Uuid>>;

    async fn display_names(&self, user_ids: &[Uuid]) -> anyhow::Result<HashMap<Uuid, String>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn latest(
        &self,
        class_id: Uuid,
        period: RankPeriod,
    ) -> anyhow::Result<Option<ClassRankSnapshot>>;

    async fn save(&self, snapshot: &ClassRankSnapshot) -> anyhow::Result<()>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, template_key: &str, user_id: Uuid, variables: Value)
        -> anyhow::Result<()>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
