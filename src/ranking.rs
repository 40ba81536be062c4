use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::calendar::Calendar;
use crate::engine::ProgressionEngine;
use crate::error::EngineResult;
use crate::models::{ClassRankSnapshot, RankEntry, RankPeriod};

const FALLBACK_NAME: &str = "Student";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Standing {
    pub user_id: Uuid,
    pub xp: i64,
    pub level: i32,
}

/// Orders by XP (then level, then id for a stable tie-break) and assigns
/// 1-based positions.
pub fn rank(mut standings: Vec<Standing>, names: &HashMap<Uuid, String>) -> Vec<RankEntry> {
    standings.sort_by(|a, b| {
        b.xp.cmp(&a.xp)
            .then_with(|| b.level.cmp(&a.level))
            .then_with(|| a.user_id.cmp(&b.user_id))
    });

    standings
        .into_iter()
        .enumerate()
        .map(|(index, standing)| RankEntry {
            position: index + 1,
            user_id: standing.user_id,
            display_name: names
                .get(&standing.user_id)
                .cloned()
                .unwrap_or_else(|| FALLBACK_NAME.to_string()),
            xp: standing.xp,
            level: standing.level,
        })
        .collect()
}

pub fn period_start(period: RankPeriod, now: DateTime<Utc>, calendar: &Calendar) -> DateTime<Utc> {
    match period {
        RankPeriod::Daily => calendar.start_of_day(now),
        RankPeriod::Weekly => calendar.start_of_week(now),
    }
}

impl ProgressionEngine {
    /// Builds a ranking from each member's resolved profile. Reads only.
    pub async fn generate_class_ranking(
        &self,
        class_id: Uuid,
        period: RankPeriod,
    ) -> EngineResult<ClassRankSnapshot> {
        let members = self.deps.roster.members(class_id).await?;
        let mut standings = Vec::with_capacity(members.len());
        for user_id in &members {
            let profile = self.resolve_profile(*user_id).await?.profile;
            standings.push(Standing {
                user_id: *user_id,
                xp: profile.xp_total,
                level: profile.level.max(self.levels.level(profile.xp_total)),
            });
        }

        let names = match self.deps.roster.display_names(&members).await {
            Ok(names) => names,
            Err(err) => {
                warn!(%class_id, error = %err, "display names unavailable");
                HashMap::new()
            }
        };

        Ok(ClassRankSnapshot {
            id: Uuid::new_v4(),
            class_id,
            period,
            generated_at: self.now(),
            rank_data: rank(standings, &names),
        })
    }

    /// Newest snapshot from the current period window, otherwise a freshly
    /// generated and persisted one.
    pub async fn class_ranking(
        &self,
        class_id: Uuid,
        period: RankPeriod,
    ) -> EngineResult<ClassRankSnapshot> {
        let window = period_start(period, self.now(), &self.calendar);

        match self.deps.snapshots.latest(class_id, period).await {
            Ok(Some(snapshot)) if snapshot.generated_at >= window => {
                debug!(%class_id, period = period.as_str(), "serving cached ranking");
                return Ok(snapshot);
            }
            Ok(_) => {}
            Err(err) => warn!(%class_id, error = %err, "ranking snapshot lookup failed"),
        }

        let snapshot = self.generate_class_ranking(class_id, period).await?;
        match self.deps.snapshots.save(&snapshot).await {
            Ok(()) => info!(
                %class_id,
                period = period.as_str(),
                entries = snapshot.rank_data.len(),
                "ranking snapshot generated"
            ),
            Err(err) => warn!(%class_id, error = %err, "ranking snapshot not persisted"),
        }
        Ok(snapshot)
    }
}
