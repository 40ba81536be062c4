use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::badges::BadgeSubject;
use crate::calendar::Calendar;
use crate::config::Config;
use crate::error::{EngineError, EngineResult};
use crate::leveling::LevelTable;
use crate::models::{
    AppendOutcome, AwardOutcome, LedgerEntry, NewLedgerEntry, ProfileSource, ProfileView,
    ProgressionProfile, SourcedProfile,
};
use crate::store::{
    BadgeStore, Catalog, Clock, FocusStore, LedgerStore, MissionStore, Notifier, ProfileStore,
    Roster, SnapshotStore,
};

/// Everything the engine talks to. Production wires one `PgStore` into every
/// slot; tests wire the in-memory store.
#[derive(Clone)]
pub struct Collaborators {
    pub ledger: Arc<dyn LedgerStore>,
    pub profiles: Arc<dyn ProfileStore>,
    pub catalog: Arc<dyn Catalog>,
    pub badges: Arc<dyn BadgeStore>,
    pub missions: Arc<dyn MissionStore>,
    pub focus: Arc<dyn FocusStore>,
    pub roster: Arc<dyn Roster>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub notifier: Arc<dyn Notifier>,
    pub clock: Arc<dyn Clock>,
}

impl Collaborators {
    pub fn from_store<S>(store: Arc<S>, clock: Arc<dyn Clock>) -> Self
    where
        S: LedgerStore
            + ProfileStore
            + Catalog
            + BadgeStore
            + MissionStore
            + FocusStore
            + Roster
            + SnapshotStore
            + Notifier
            + 'static,
    {
        Self {
            ledger: store.clone(),
            profiles: store.clone(),
            catalog: store.clone(),
            badges: store.clone(),
            missions: store.clone(),
            focus: store.clone(),
            roster: store.clone(),
            snapshots: store.clone(),
            notifier: store,
            clock,
        }
    }
}

/// A pending XP grant before it reaches the ledger.
#[derive(Debug, Clone)]
pub(crate) struct Grant {
    pub user_id: Uuid,
    pub xp: i64,
    pub source: String,
    pub meta: Value,
    pub dedupe_key: Option<String>,
}

pub struct ProgressionEngine {
    pub(crate) deps: Collaborators,
    pub(crate) config: Config,
    pub(crate) levels: LevelTable,
    pub(crate) calendar: Calendar,
    timeout: Duration,
}

impl ProgressionEngine {
    pub fn new(config: Config, deps: Collaborators) -> Self {
        Self {
            levels: LevelTable::new(&config.leveling),
            calendar: Calendar::new(config.calendar.utc_offset_minutes),
            timeout: Duration::from_millis(config.store.timeout_ms.max(1)),
            deps,
            config,
        }
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.deps.clock.now()
    }

    pub async fn award_xp(
        &self,
        user_id: Uuid,
        amount: i64,
        source: &str,
        meta: Option<Value>,
    ) -> EngineResult<AwardOutcome> {
        self.grant(Grant {
            user_id,
            xp: amount,
            source: source.to_string(),
            meta: meta.unwrap_or_else(|| Value::Object(Default::default())),
            dedupe_key: None,
        })
        .await
    }

    /// Records a historical grant under its original timestamp. A repeated
    /// dedupe key is a no-op. Cached profiles catch up through `reconcile`.
    pub async fn import_xp(&self, entry: NewLedgerEntry) -> EngineResult<bool> {
        if entry.xp < 0 {
            return Err(EngineError::InvalidAmount(entry.xp));
        }

        let user_id = entry.user_id;
        let appended = self
            .bounded(self.deps.ledger.append(entry))
            .await
            .map_err(|source| EngineError::Durability { user_id, source })?;
        Ok(matches!(appended, AppendOutcome::Appended(_)))
    }

    pub(crate) async fn grant(&self, grant: Grant) -> EngineResult<AwardOutcome> {
        if grant.xp < 0 {
            return Err(EngineError::InvalidAmount(grant.xp));
        }

        let now = self.now();
        let user_id = grant.user_id;
        let entry = NewLedgerEntry {
            user_id,
            source: grant.source.clone(),
            xp: grant.xp,
            meta: grant.meta,
            dedupe_key: grant.dedupe_key,
            created_at: now,
        };

        let appended = self
            .bounded(self.deps.ledger.append(entry))
            .await
            .map_err(|source| EngineError::Durability { user_id, source })?;

        match appended {
            AppendOutcome::Appended(entry) => {
                info!(%user_id, source = %entry.source, xp = entry.xp, "xp granted");
                self.apply_grant(user_id, entry.xp, now).await
            }
            AppendOutcome::Duplicate => {
                debug!(%user_id, source = %grant.source, "duplicate grant ignored");
                let current = self.resolve_profile(user_id).await?.profile;
                Ok(AwardOutcome {
                    xp_added: 0,
                    new_total_xp: current.xp_total,
                    new_level: current.level,
                    leveled_up: false,
                    xp_for_next_level: self.levels.xp_for_next_level(current.xp_total),
                })
            }
        }
    }

    /// Projects an already-recorded ledger grant onto the cached profile.
    pub(crate) async fn apply_grant(
        &self,
        user_id: Uuid,
        xp: i64,
        now: DateTime<Utc>,
    ) -> EngineResult<AwardOutcome> {
        let (xp_total, level, leveled_up, streak) = match self.deps.profiles.get(user_id).await {
            Ok(Some(profile)) => {
                let xp_total = profile.xp_total + xp;
                let level = self.levels.level(xp_total).max(profile.level);
                if let Err(err) = self
                    .deps
                    .profiles
                    .save_xp(user_id, xp_total, level, now)
                    .await
                {
                    warn!(%user_id, error = %err, "profile cache update failed");
                }
                (xp_total, level, level > profile.level, profile.current_streak)
            }
            Ok(None) => {
                let mut profile = self.aggregate(user_id).await?;
                profile.last_activity_at = Some(now);
                match self.deps.profiles.insert_if_absent(&profile).await {
                    Ok(true) => debug!(%user_id, "profile created from ledger"),
                    Ok(false) => debug!(%user_id, "profile created concurrently"),
                    Err(err) => warn!(%user_id, error = %err, "profile cache create failed"),
                }
                let before = self.levels.level(profile.xp_total - xp);
                (profile.xp_total, profile.level, profile.level > before, 0)
            }
            Err(err) => {
                warn!(%user_id, error = %err, "profile cache unavailable, aggregating ledger");
                let profile = self.aggregate(user_id).await?;
                let before = self.levels.level(profile.xp_total - xp);
                (profile.xp_total, profile.level, profile.level > before, 0)
            }
        };

        if leveled_up {
            info!(%user_id, level, "level up");
        }

        let subject = BadgeSubject {
            level,
            streak,
            xp_total,
        };
        if let Err(err) = self.evaluate_badges(user_id, subject).await {
            warn!(%user_id, error = %err, "badge evaluation skipped");
        }

        Ok(AwardOutcome {
            xp_added: xp,
            new_total_xp: xp_total,
            new_level: level,
            leveled_up,
            xp_for_next_level: self.levels.xp_for_next_level(xp_total),
        })
    }

    /// Rebuilds `{xp_total, level}` from the ledger alone.
    pub async fn aggregate(&self, user_id: Uuid) -> EngineResult<ProgressionProfile> {
        let xp_total = self.deps.ledger.total_for(user_id).await?;
        let mut profile = ProgressionProfile::new(user_id);
        profile.xp_total = xp_total;
        profile.level = self.levels.level(xp_total);
        Ok(profile)
    }

    /// Cached profile when readable, otherwise the ledger aggregate.
    pub async fn resolve_profile(&self, user_id: Uuid) -> EngineResult<SourcedProfile> {
        match self.deps.profiles.get(user_id).await {
            Ok(Some(profile)) => Ok(SourcedProfile {
                profile,
                source: ProfileSource::Cache,
            }),
            Ok(None) => {
                debug!(%user_id, "no cached profile, aggregating ledger");
                Ok(SourcedProfile {
                    profile: self.aggregate(user_id).await?,
                    source: ProfileSource::Aggregated,
                })
            }
            Err(err) => {
                warn!(%user_id, error = %err, "profile cache unavailable, aggregating ledger");
                Ok(SourcedProfile {
                    profile: self.aggregate(user_id).await?,
                    source: ProfileSource::Aggregated,
                })
            }
        }
    }

    pub async fn get_profile(&self, user_id: Uuid) -> EngineResult<ProfileView> {
        let SourcedProfile { profile, source } = self.resolve_profile(user_id).await?;
        let info = self.levels.info(profile.xp_total);

        let badges = match self.deps.badges.badges_for(user_id).await {
            Ok(badges) => badges,
            Err(err) => {
                warn!(%user_id, error = %err, "badge list unavailable");
                Vec::new()
            }
        };

        Ok(ProfileView {
            user_id,
            xp_total: profile.xp_total,
            level: profile.level.max(info.level),
            current_streak: profile.current_streak,
            longest_streak: profile.longest_streak,
            xp_for_next_level: info.xp_for_next_level,
            progress_percent: info.progress_percent,
            badges,
            source,
        })
    }

    /// Ledger entries for the user, oldest first.
    pub async fn xp_history(&self, user_id: Uuid) -> EngineResult<Vec<LedgerEntry>> {
        Ok(self.deps.ledger.entries_for(user_id).await?)
    }

    /// Overwrites the cached totals with the ledger aggregate.
    pub async fn reconcile(&self, user_id: Uuid) -> EngineResult<ProgressionProfile> {
        let aggregated = self.aggregate(user_id).await?;
        let now = self.now();

        match self.deps.profiles.get(user_id).await? {
            Some(cached) => {
                let last_activity_at = cached.last_activity_at.unwrap_or(now);
                self.deps
                    .profiles
                    .save_xp(user_id, aggregated.xp_total, aggregated.level, last_activity_at)
                    .await?;
                if cached.xp_total != aggregated.xp_total {
                    info!(
                        %user_id,
                        cached = cached.xp_total,
                        ledger = aggregated.xp_total,
                        "profile reconciled"
                    );
                }
                Ok(ProgressionProfile {
                    xp_total: aggregated.xp_total,
                    level: aggregated.level,
                    last_activity_at: Some(last_activity_at),
                    ..cached
                })
            }
            None => {
                self.deps.profiles.insert_if_absent(&aggregated).await?;
                Ok(aggregated)
            }
        }
    }

    pub(crate) async fn bounded<T, F>(&self, call: F) -> anyhow::Result<T>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(anyhow!("timed out after {:?}", self.timeout)),
        }
    }

    /// Fire-and-forget: failures are logged, never returned.
    pub(crate) async fn notify(&self, template_key: &str, user_id: Uuid, variables: Value) {
        let sent = self
            .bounded(self.deps.notifier.send(template_key, user_id, variables))
            .await;
        if let Err(err) = sent {
            warn!(%user_id, template_key, error = %err, "notification dropped");
        }
    }
}
