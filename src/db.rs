use std::collections::{BTreeSet, HashMap};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::ProgressionEngine;
use crate::models::{
    AppendOutcome, BadgeCriteria, BadgeDefinition, ClassRankSnapshot, FocusSession, LedgerEntry,
    MissionDefinition, MissionKind, MissionProgress, MissionRule, MissionStatus, NewLedgerEntry,
    ProgressionProfile, RankEntry, RankPeriod, UserBadge, UserMission,
};
use crate::store::{
    BadgeStore, Catalog, FocusStore, LedgerStore, MissionStore, Notifier, ProfileStore, Roster,
    SnapshotStore,
};

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Postgres adapter behind every engine collaborator.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn ledger_entry(row: &PgRow) -> LedgerEntry {
    LedgerEntry {
        id: row.get("id"),
        user_id: row.get("user_id"),
        source: row.get("source"),
        xp: row.get("xp"),
        meta: row.get("meta"),
        dedupe_key: row.get("dedupe_key"),
        created_at: row.get("created_at"),
    }
}

fn profile(row: &PgRow) -> ProgressionProfile {
    ProgressionProfile {
        user_id: row.get("user_id"),
        xp_total: row.get("xp_total"),
        level: row.get("level"),
        current_streak: row.get("current_streak"),
        longest_streak: row.get("longest_streak"),
        last_activity_at: row.get("last_activity_at"),
        last_streak_at: row.get("last_streak_at"),
    }
}

fn badge_definition(row: &PgRow) -> BadgeDefinition {
    let code: String = row.get("code");
    let criteria: Value = row.get("criteria");
    let criteria = serde_json::from_value::<BadgeCriteria>(criteria).unwrap_or_else(|err| {
        warn!(badge = %code, error = %err, "unreadable badge criteria");
        BadgeCriteria::default()
    });
    BadgeDefinition {
        id: row.get("id"),
        code,
        name: row.get("name"),
        description: row.get("description"),
        icon_url: row.get("icon_url"),
        criteria,
    }
}

fn mission_definition(row: &PgRow) -> anyhow::Result<MissionDefinition> {
    let code: String = row.get("code");
    let kind: String = row.get("kind");
    let kind = MissionKind::parse(&kind)
        .with_context(|| format!("mission {code} has unknown kind {kind}"))?;
    let rules: Value = row.get("rules");
    let rules = serde_json::from_value::<MissionRule>(rules).unwrap_or_else(|err| {
        warn!(mission = %code, error = %err, "unreadable mission rules");
        MissionRule::Unknown
    });
    Ok(MissionDefinition {
        id: row.get("id"),
        code,
        name: row.get("name"),
        kind,
        rules,
        reward_xp: row.get("reward_xp"),
    })
}

fn user_mission(row: &PgRow) -> anyhow::Result<UserMission> {
    let status: String = row.get("status");
    let status = MissionStatus::parse(&status)
        .with_context(|| format!("unknown mission status {status}"))?;
    let progress: Json<MissionProgress> = row.try_get("progress")?;
    Ok(UserMission {
        user_id: row.get("user_id"),
        mission_id: row.get("mission_id"),
        status,
        progress: progress.0,
        reset_at: row.get("reset_at"),
    })
}

fn focus_session(row: &PgRow) -> FocusSession {
    FocusSession {
        id: row.get("id"),
        user_id: row.get("user_id"),
        technique: row.get("technique"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        duration_min: row.get("duration_min"),
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn append(&self, entry: NewLedgerEntry) -> anyhow::Result<AppendOutcome> {
        let entry = entry.into_entry();
        let result = sqlx::query(
            r#"
            INSERT INTO progression.xp_log
            (id, user_id, source, xp, meta, dedupe_key, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(entry.user_id)
        .bind(&entry.source)
        .bind(entry.xp)
        .bind(&entry.meta)
        .bind(&entry.dedupe_key)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(AppendOutcome::Duplicate);
        }
        Ok(AppendOutcome::Appended(entry))
    }

    async fn append_capped(
        &self,
        entry: NewLedgerEntry,
        since: DateTime<Utc>,
        cap: i64,
    ) -> anyhow::Result<i64> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(format!("{}:{}", entry.user_id, entry.source))
            .execute(&mut *tx)
            .await?;

        if let Some(key) = &entry.dedupe_key {
            let seen: i64 = sqlx::query(
                "SELECT COUNT(*) AS n FROM progression.xp_log WHERE dedupe_key = $1",
            )
            .bind(key)
            .fetch_one(&mut *tx)
            .await?
            .get("n");
            if seen > 0 {
                return Ok(0);
            }
        }

        let earned: i64 = sqlx::query(
            r#"
            SELECT COALESCE(SUM(xp), 0)::BIGINT AS earned
            FROM progression.xp_log
            WHERE user_id = $1 AND source = $2 AND created_at >= $3
            "#,
        )
        .bind(entry.user_id)
        .bind(&entry.source)
        .bind(since)
        .fetch_one(&mut *tx)
        .await?
        .get("earned");

        let granted = entry.xp.min(cap - earned).max(0);
        if granted > 0 {
            sqlx::query(
                r#"
                INSERT INTO progression.xp_log
                (id, user_id, source, xp, meta, dedupe_key, created_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(entry.user_id)
            .bind(&entry.source)
            .bind(granted)
            .bind(&entry.meta)
            .bind(&entry.dedupe_key)
            .bind(entry.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(granted)
    }

    async fn total_for(&self, user_id: Uuid) -> anyhow::Result<i64> {
        let total: i64 = sqlx::query(
            "SELECT COALESCE(SUM(xp), 0)::BIGINT AS total FROM progression.xp_log WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?
        .get("total");
        Ok(total)
    }

    async fn sum_since(
        &self,
        user_id: Uuid,
        source: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        let total: i64 = sqlx::query(
            r#"
            SELECT COALESCE(SUM(xp), 0)::BIGINT AS total
            FROM progression.xp_log
            WHERE user_id = $1 AND source = $2 AND created_at >= $3
            "#,
        )
        .bind(user_id)
        .bind(source)
        .bind(since)
        .fetch_one(&self.pool)
        .await?
        .get("total");
        Ok(total)
    }

    async fn entries_for(&self, user_id: Uuid) -> anyhow::Result<Vec<LedgerEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, source, xp, meta, dedupe_key, created_at
            FROM progression.xp_log
            WHERE user_id = $1
            ORDER BY created_at
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(ledger_entry).collect())
    }
}

#[async_trait]
impl ProfileStore for PgStore {
    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<ProgressionProfile>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, xp_total, level, current_streak, longest_streak,
                   last_activity_at, last_streak_at
            FROM progression.profiles
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(profile))
    }

    async fn insert_if_absent(&self, profile: &ProgressionProfile) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO progression.profiles
            (user_id, xp_total, level, current_streak, longest_streak,
             last_activity_at, last_streak_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(profile.user_id)
        .bind(profile.xp_total)
        .bind(profile.level)
        .bind(profile.current_streak)
        .bind(profile.longest_streak)
        .bind(profile.last_activity_at)
        .bind(profile.last_streak_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_xp(
        &self,
        user_id: Uuid,
        xp_total: i64,
        level: i32,
        last_activity_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE progression.profiles
            SET xp_total = $2, level = $3, last_activity_at = $4
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .bind(xp_total)
        .bind(level)
        .bind(last_activity_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_streak(
        &self,
        profile: &ProgressionProfile,
        expected: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE progression.profiles
            SET current_streak = $2, longest_streak = $3,
                last_streak_at = $4, last_activity_at = $5
            WHERE user_id = $1 AND last_streak_at IS NOT DISTINCT FROM $6
            "#,
        )
        .bind(profile.user_id)
        .bind(profile.current_streak)
        .bind(profile.longest_streak)
        .bind(profile.last_streak_at)
        .bind(profile.last_activity_at)
        .bind(expected)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl Catalog for PgStore {
    async fn badges(&self) -> anyhow::Result<Vec<BadgeDefinition>> {
        let rows = sqlx::query(
            "SELECT id, code, name, description, icon_url, criteria FROM progression.badges_catalog",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(badge_definition).collect())
    }

    async fn missions(&self) -> anyhow::Result<Vec<MissionDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, code, name, kind, rules, reward_xp
            FROM progression.missions_catalog
            ORDER BY kind, code
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(mission_definition).collect()
    }

    async fn mission_by_code(&self, code: &str) -> anyhow::Result<Option<MissionDefinition>> {
        let row = sqlx::query(
            r#"
            SELECT id, code, name, kind, rules, reward_xp
            FROM progression.missions_catalog
            WHERE code = $1
            "#,
        )
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(mission_definition).transpose()
    }
}

#[async_trait]
impl BadgeStore for PgStore {
    async fn grant_if_absent(
        &self,
        user_id: Uuid,
        badge_id: Uuid,
        granted_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO progression.user_badges (user_id, badge_id, granted_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, badge_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(badge_id)
        .bind(granted_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn badges_for(&self, user_id: Uuid) -> anyhow::Result<Vec<UserBadge>> {
        let rows = sqlx::query(
            r#"
            SELECT b.id, b.code, b.name, b.icon_url, ub.granted_at
            FROM progression.user_badges ub
            JOIN progression.badges_catalog b ON b.id = ub.badge_id
            WHERE ub.user_id = $1
            ORDER BY ub.granted_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut badges = Vec::new();
        for row in rows {
            badges.push(UserBadge {
                badge_id: row.get("id"),
                code: row.get("code"),
                name: row.get("name"),
                icon_url: row.get("icon_url"),
                granted_at: row.get("granted_at"),
            });
        }
        Ok(badges)
    }
}

#[async_trait]
impl MissionStore for PgStore {
    async fn instances_for(&self, user_id: Uuid) -> anyhow::Result<Vec<UserMission>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id, mission_id, status, progress, reset_at
            FROM progression.user_missions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(user_mission).collect()
    }

    async fn insert_if_absent(&self, instance: &UserMission) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO progression.user_missions
            (user_id, mission_id, status, progress, reset_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, mission_id) DO NOTHING
            "#,
        )
        .bind(instance.user_id)
        .bind(instance.mission_id)
        .bind(instance.status.as_str())
        .bind(Json(&instance.progress))
        .bind(instance.reset_at)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn renew(
        &self,
        expired_reset_at: DateTime<Utc>,
        fresh: &UserMission,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO progression.user_missions
            (user_id, mission_id, status, progress, reset_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (user_id, mission_id) DO UPDATE
            SET status = EXCLUDED.status, progress = EXCLUDED.progress,
                reset_at = EXCLUDED.reset_at
            WHERE progression.user_missions.reset_at = $6
            "#,
        )
        .bind(fresh.user_id)
        .bind(fresh.mission_id)
        .bind(fresh.status.as_str())
        .bind(Json(&fresh.progress))
        .bind(fresh.reset_at)
        .bind(expired_reset_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn save_progress(
        &self,
        user_id: Uuid,
        mission_id: Uuid,
        cycle: DateTime<Utc>,
        progress: &MissionProgress,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE progression.user_missions
            SET progress = $4
            WHERE user_id = $1 AND mission_id = $2 AND reset_at = $3 AND status = 'active'
            "#,
        )
        .bind(user_id)
        .bind(mission_id)
        .bind(cycle)
        .bind(Json(progress))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn complete(
        &self,
        user_id: Uuid,
        mission_id: Uuid,
        cycle: DateTime<Utc>,
        progress: &MissionProgress,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE progression.user_missions
            SET status = 'completed', progress = $4
            WHERE user_id = $1 AND mission_id = $2 AND reset_at = $3 AND status = 'active'
            "#,
        )
        .bind(user_id)
        .bind(mission_id)
        .bind(cycle)
        .bind(Json(progress))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl FocusStore for PgStore {
    async fn start(&self, session: &FocusSession) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO progression.focus_sessions (id, user_id, technique, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(session.id)
        .bind(session.user_id)
        .bind(&session.technique)
        .bind(session.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, session_id: Uuid, user_id: Uuid) -> anyhow::Result<Option<FocusSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, technique, started_at, ended_at, duration_min
            FROM progression.focus_sessions
            WHERE id = $1 AND user_id = $2
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(focus_session))
    }

    async fn finish(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_min: i32,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            UPDATE progression.focus_sessions
            SET ended_at = $2, duration_min = $3
            WHERE id = $1 AND ended_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(ended_at)
        .bind(duration_min)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel(&self, session_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM progression.focus_sessions
            WHERE id = $1 AND user_id = $2 AND ended_at IS NULL
            "#,
        )
        .bind(session_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active_for(&self, user_id: Uuid) -> anyhow::Result<Option<FocusSession>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, technique, started_at, ended_at, duration_min
            FROM progression.focus_sessions
            WHERE user_id = $1 AND ended_at IS NULL
            ORDER BY started_at DESC
            LIMIT 1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(focus_session))
    }

    async fn finished_for(&self, user_id: Uuid) -> anyhow::Result<Vec<FocusSession>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, technique, started_at, ended_at, duration_min
            FROM progression.focus_sessions
            WHERE user_id = $1 AND ended_at IS NOT NULL
            ORDER BY started_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(focus_session).collect())
    }
}

#[async_trait]
impl Roster for PgStore {
    async fn members(&self, class_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        let rows = sqlx::query(
            r#"
            SELECT user_id FROM progression.class_members
            WHERE class_id = $1 AND role = 'student'
            "#,
        )
        .bind(class_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(|row| row.get("user_id")).collect())
    }

    async fn display_names(&self, user_ids: &[Uuid]) -> anyhow::Result<HashMap<Uuid, String>> {
        let rows = sqlx::query("SELECT id, full_name FROM progression.users WHERE id = ANY($1)")
            .bind(user_ids)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .iter()
            .map(|row| (row.get("id"), row.get("full_name")))
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for PgStore {
    async fn latest(
        &self,
        class_id: Uuid,
        period: RankPeriod,
    ) -> anyhow::Result<Option<ClassRankSnapshot>> {
        let row = sqlx::query(
            r#"
            SELECT id, class_id, generated_at, rank_data
            FROM progression.class_rank_snapshots
            WHERE class_id = $1 AND period = $2
            ORDER BY generated_at DESC
            LIMIT 1
            "#,
        )
        .bind(class_id)
        .bind(period.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let rank_data: Json<Vec<RankEntry>> = row.try_get("rank_data")?;
        Ok(Some(ClassRankSnapshot {
            id: row.get("id"),
            class_id: row.get("class_id"),
            period,
            generated_at: row.get("generated_at"),
            rank_data: rank_data.0,
        }))
    }

    async fn save(&self, snapshot: &ClassRankSnapshot) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO progression.class_rank_snapshots
            (id, class_id, period, generated_at, rank_data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(snapshot.id)
        .bind(snapshot.class_id)
        .bind(snapshot.period.as_str())
        .bind(snapshot.generated_at)
        .bind(Json(&snapshot.rank_data))
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for PgStore {
    async fn send(
        &self,
        template_key: &str,
        user_id: Uuid,
        variables: Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO progression.notification_outbox (id, user_id, template_key, variables)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(user_id)
        .bind(template_key)
        .bind(&variables)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

pub const SEED_CLASS_ID: &str = "6b1f0f7e-3c55-4a57-9b0e-0f2d7c9a4e11";

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let class_id = Uuid::parse_str(SEED_CLASS_ID)?;
    let students = vec![
        (
            Uuid::parse_str("3d7f5d6f-24f7-4e8e-8b4b-3e7e44b4a7b2")?,
            "Avery Lee",
            "avery.lee@groupscholar.com",
        ),
        (
            Uuid::parse_str("0c22f1f1-9184-4fd4-9b21-28c68a6a89dc")?,
            "Jules Moreno",
            "jules.moreno@groupscholar.com",
        ),
        (
            Uuid::parse_str("d5a0a1a2-2a3c-44c2-8f73-60b7897a9dd2")?,
            "Kiara Patel",
            "kiara.patel@groupscholar.com",
        ),
    ];

    for (id, name, email) in students {
        let user_id: Uuid = sqlx::query(
            r#"
            INSERT INTO progression.users (id, full_name, email)
            VALUES ($1, $2, $3)
            ON CONFLICT (email) DO UPDATE SET full_name = EXCLUDED.full_name
            RETURNING id
            "#,
        )
        .bind(id)
        .bind(name)
        .bind(email)
        .fetch_one(pool)
        .await?
        .get("id");

        sqlx::query(
            r#"
            INSERT INTO progression.class_members (class_id, user_id, role)
            VALUES ($1, $2, 'student')
            ON CONFLICT (class_id, user_id) DO NOTHING
            "#,
        )
        .bind(class_id)
        .bind(user_id)
        .execute(pool)
        .await?;
    }

    let badges = vec![
        ("level_5", "Rising Scholar", "Reached level 5", json!({ "level": 5 })),
        ("level_10", "Dedicated Scholar", "Reached level 10", json!({ "level": 10 })),
        ("streak_7", "On Fire", "Seven days in a row", json!({ "streak": 7 })),
        ("streak_30", "Unstoppable", "Thirty days in a row", json!({ "streak": 30 })),
    ];

    for (code, name, description, criteria) in badges {
        sqlx::query(
            r#"
            INSERT INTO progression.badges_catalog (id, code, name, description, criteria)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(name)
        .bind(description)
        .bind(&criteria)
        .execute(pool)
        .await?;
    }

    let missions = vec![
        (
            "daily_login",
            "Show up",
            MissionKind::Daily,
            json!({ "type": "login" }),
            5_i64,
        ),
        (
            "daily_submit",
            "Hand in an activity",
            MissionKind::Daily,
            json!({ "type": "submit", "count": 1 }),
            20,
        ),
        (
            "daily_quiz",
            "Two quizzes",
            MissionKind::Daily,
            json!({ "type": "quiz", "count": 2 }),
            15,
        ),
        (
            "daily_focus",
            "Focus for 50 minutes",
            MissionKind::Daily,
            json!({ "type": "focus", "minutes": 50 }),
            25,
        ),
        (
            "weekly_perfect",
            "Three perfect scores",
            MissionKind::Weekly,
            json!({ "type": "perfect_scores", "count": 3 }),
            100,
        ),
        (
            "weekly_streak",
            "Seven-day streak",
            MissionKind::Weekly,
            json!({ "type": "streak", "days": 7 }),
            75,
        ),
        (
            "weekly_focus",
            "Five hours of focus",
            MissionKind::Weekly,
            json!({ "type": "focus", "hours": 5 }),
            120,
        ),
    ];

    for (code, name, kind, rules, reward_xp) in missions {
        sqlx::query(
            r#"
            INSERT INTO progression.missions_catalog (id, code, name, kind, rules, reward_xp)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (code) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(code)
        .bind(name)
        .bind(kind.as_str())
        .bind(&rules)
        .bind(reward_xp)
        .execute(pool)
        .await?;
    }

    Ok(())
}

/// Records historical grants through the engine's bounded ledger path, then
/// reconciles every touched profile. Rows without a key get one derived from
/// their content so re-importing the same file is a no-op.
pub async fn import_csv(
    engine: &ProgressionEngine,
    csv_path: &std::path::Path,
) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        user_id: Uuid,
        source: String,
        xp: i64,
        created_at: DateTime<Utc>,
        dedupe_key: Option<String>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;
    let mut touched = BTreeSet::new();

    for (line, result) in reader.deserialize::<CsvRow>().enumerate() {
        let row = result.with_context(|| format!("invalid row {}", line + 1))?;
        if row.xp < 0 {
            warn!(user_id = %row.user_id, xp = row.xp, "skipping negative grant");
            continue;
        }

        let dedupe_key = row.dedupe_key.filter(|key| !key.is_empty()).unwrap_or_else(|| {
            format!(
                "import:{}:{}:{}",
                row.user_id,
                row.source,
                row.created_at.timestamp_millis()
            )
        });

        let user_id = row.user_id;
        let appended = engine
            .import_xp(NewLedgerEntry {
                user_id,
                source: row.source,
                xp: row.xp,
                meta: json!({ "imported": true }),
                dedupe_key: Some(dedupe_key),
                created_at: row.created_at,
            })
            .await
            .with_context(|| format!("failed to import row {}", line + 1))?;

        if appended {
            inserted += 1;
            touched.insert(user_id);
        }
    }

    for user_id in touched {
        engine
            .reconcile(user_id)
            .await
            .with_context(|| format!("failed to reconcile {user_id}"))?;
    }
    info!(inserted, "csv import finished");

    Ok(inserted)
}
