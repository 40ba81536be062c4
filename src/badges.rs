use std::collections::HashSet;

use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::engine::ProgressionEngine;
use crate::error::{EngineError, EngineResult};
use crate::models::{BadgeCriteria, BadgeDefinition};

/// Profile state badge criteria are evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BadgeSubject {
    pub level: i32,
    pub streak: i32,
    pub xp_total: i64,
}

impl BadgeCriteria {
    /// Every present threshold must hold. Empty criteria never qualify.
    pub fn is_met(&self, subject: &BadgeSubject) -> bool {
        if self.level.is_none() && self.streak.is_none() && self.xp.is_none() {
            return false;
        }
        self.level.map_or(true, |level| subject.level >= level)
            && self.streak.map_or(true, |days| subject.streak >= days)
            && self.xp.map_or(true, |xp| subject.xp_total >= xp)
    }
}

pub fn qualifying<'a>(
    catalog: &'a [BadgeDefinition],
    held: &HashSet<Uuid>,
    subject: &BadgeSubject,
) -> Vec<&'a BadgeDefinition> {
    catalog
        .iter()
        .filter(|badge| !held.contains(&badge.id))
        .filter(|badge| badge.criteria.is_met(subject))
        .collect()
}

impl ProgressionEngine {
    /// Grants every catalog badge the subject newly qualifies for and returns
    /// the ones this call actually inserted.
    pub async fn evaluate_badges(
        &self,
        user_id: Uuid,
        subject: BadgeSubject,
    ) -> EngineResult<Vec<BadgeDefinition>> {
        let catalog = self.deps.catalog.badges().await.map_err(EngineError::Catalog)?;
        if catalog.is_empty() {
            return Ok(Vec::new());
        }

        let held: HashSet<Uuid> = match self.deps.badges.badges_for(user_id).await {
            Ok(badges) => badges.into_iter().map(|b| b.badge_id).collect(),
            Err(err) => {
                warn!(%user_id, error = %err, "held badges unavailable, relying on insert-if-absent");
                HashSet::new()
            }
        };

        let now = self.now();
        let mut granted = Vec::new();
        for badge in qualifying(&catalog, &held, &subject) {
            if !self.deps.badges.grant_if_absent(user_id, badge.id, now).await? {
                continue;
            }

            info!(%user_id, badge = %badge.code, "badge granted");
            self.notify(
                "badgeEarned",
                user_id,
                json!({
                    "badgeName": badge.name,
                    "badgeDescription": badge.description,
                    "profileUrl": format!("/profile/{user_id}"),
                }),
            )
            .await;
            granted.push(badge.clone());
        }

        Ok(granted)
    }
}
