use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::badges::BadgeSubject;
use crate::calendar::Calendar;
use crate::engine::{Grant, ProgressionEngine};
use crate::error::{EngineError, EngineResult};
use crate::models::{AwardOutcome, ProgressionProfile, StreakOutcome};

const SAVE_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreakStep {
    /// Same calendar day as the last counted activity.
    Unchanged,
    Started,
    Extended,
    Reset,
}

pub fn step(last: Option<DateTime<Utc>>, now: DateTime<Utc>, calendar: &Calendar) -> StreakStep {
    let Some(last) = last else {
        return StreakStep::Started;
    };
    match calendar.days_between(last, now) {
        days if days <= 0 => StreakStep::Unchanged,
        1 => StreakStep::Extended,
        _ => StreakStep::Reset,
    }
}

pub fn next_streak(current: i32, step: StreakStep) -> i32 {
    match step {
        StreakStep::Unchanged => current,
        StreakStep::Started | StreakStep::Reset => 1,
        StreakStep::Extended => current.saturating_add(1),
    }
}

impl ProgressionEngine {
    /// A reached milestone is paid before the streak is saved, so a failed
    /// bonus leaves the day uncounted and a retry pays it (keyed per day).
    pub async fn update_streak(&self, user_id: Uuid) -> EngineResult<StreakOutcome> {
        let now = self.now();
        let mut attempts = 0;

        let (updated, bonus) = loop {
            attempts += 1;
            let profile = self.streak_profile(user_id).await?;
            let step = step(profile.last_streak_at, now, &self.calendar);

            if step == StreakStep::Unchanged {
                debug!(%user_id, "streak already counted today");
                return Ok(StreakOutcome {
                    current_streak: profile.current_streak,
                    longest_streak: profile.longest_streak,
                });
            }

            let current_streak = next_streak(profile.current_streak, step);
            let bonus = self
                .award_streak_milestone(user_id, current_streak, now)
                .await?;

            let updated = ProgressionProfile {
                current_streak,
                longest_streak: profile.longest_streak.max(current_streak),
                last_streak_at: Some(now),
                last_activity_at: Some(now),
                ..profile.clone()
            };

            let saved = self
                .deps
                .profiles
                .save_streak(&updated, profile.last_streak_at)
                .await
                .map_err(|source| EngineError::ProfileUnavailable { user_id, source })?;

            if saved {
                info!(%user_id, streak = current_streak, ?step, "streak updated");
                break (updated, bonus);
            }
            if attempts >= SAVE_ATTEMPTS {
                let current = self.streak_profile(user_id).await?;
                return Ok(StreakOutcome {
                    current_streak: current.current_streak,
                    longest_streak: current.longest_streak,
                });
            }
            debug!(%user_id, "streak changed concurrently, retrying");
        };

        let (level, xp_total) = match &bonus {
            Some(award) => (award.new_level, award.new_total_xp),
            None => (updated.level, updated.xp_total),
        };
        let subject = BadgeSubject {
            level,
            streak: updated.current_streak,
            xp_total,
        };
        if let Err(err) = self.evaluate_badges(user_id, subject).await {
            warn!(%user_id, error = %err, "streak badge evaluation skipped");
        }

        Ok(StreakOutcome {
            current_streak: updated.current_streak,
            longest_streak: updated.longest_streak,
        })
    }

    /// The cached profile, created from the ledger aggregate on first use.
    async fn streak_profile(&self, user_id: Uuid) -> EngineResult<ProgressionProfile> {
        let unavailable = |source: anyhow::Error| EngineError::ProfileUnavailable { user_id, source };

        if let Some(profile) = self.deps.profiles.get(user_id).await.map_err(unavailable)? {
            return Ok(profile);
        }

        let created = self.aggregate(user_id).await?;
        if self
            .deps
            .profiles
            .insert_if_absent(&created)
            .await
            .map_err(unavailable)?
        {
            return Ok(created);
        }

        self.deps
            .profiles
            .get(user_id)
            .await
            .map_err(unavailable)?
            .ok_or_else(|| unavailable(anyhow::anyhow!("profile vanished after insert")))
    }

    async fn award_streak_milestone(
        &self,
        user_id: Uuid,
        streak: i32,
        now: DateTime<Utc>,
    ) -> EngineResult<Option<AwardOutcome>> {
        let Some(milestone) = self
            .config
            .streak
            .milestones
            .iter()
            .find(|m| m.days == streak)
            .copied()
        else {
            return Ok(None);
        };

        let day = self.calendar.local_date(now);
        let grant = Grant {
            user_id,
            xp: milestone.xp,
            source: format!("streak_{}_days", milestone.days),
            meta: json!({ "streak": milestone.days }),
            dedupe_key: Some(format!("streak:{}:{}:{}", milestone.days, user_id, day)),
        };

        let award = self.grant(grant).await?;
        if award.xp_added > 0 {
            info!(%user_id, days = milestone.days, xp = award.xp_added, "streak milestone reached");
        }
        Ok(Some(award))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::tests::harness;
    use crate::store::Clock;
    use chrono::{Duration, TimeZone};
    use std::sync::atomic::Ordering;

    fn at(d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, d, h, 0, 0).unwrap()
    }

    fn seeded(user_id: Uuid, current: i32, longest: i32, last: DateTime<Utc>) -> ProgressionProfile {
        ProgressionProfile {
            current_streak: current,
            longest_streak: longest,
            last_streak_at: Some(last),
            last_activity_at: Some(last),
            ..ProgressionProfile::new(user_id)
        }
    }

    #[test]
    fn steps_follow_calendar_days() {
        let calendar = Calendar::utc();
        assert_eq!(step(None, at(4, 10), &calendar), StreakStep::Started);
        assert_eq!(step(Some(at(4, 1)), at(4, 23), &calendar), StreakStep::Unchanged);
        assert_eq!(step(Some(at(3, 23)), at(4, 0), &calendar), StreakStep::Extended);
        assert_eq!(step(Some(at(1, 10)), at(4, 10), &calendar), StreakStep::Reset);
        assert_eq!(step(Some(at(5, 10)), at(4, 10), &calendar), StreakStep::Unchanged);
    }

    #[test]
    fn next_streak_transitions() {
        assert_eq!(next_streak(4, StreakStep::Extended), 5);
        assert_eq!(next_streak(4, StreakStep::Unchanged), 4);
        assert_eq!(next_streak(15, StreakStep::Reset), 1);
        assert_eq!(next_streak(0, StreakStep::Started), 1);
    }

    #[tokio::test]
    async fn first_activity_starts_streak() {
        let h = harness();
        let user = Uuid::new_v4();

        let outcome = h.engine.update_streak(user).await.unwrap();

        assert_eq!(outcome.current_streak, 1);
        assert_eq!(outcome.longest_streak, 1);
    }

    #[tokio::test]
    async fn yesterday_extends_by_one() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 4, 4, h.clock.now() - Duration::days(1)));

        let outcome = h.engine.update_streak(user).await.unwrap();

        assert_eq!(outcome.current_streak, 5);
        assert!(outcome.longest_streak >= outcome.current_streak);
    }

    #[tokio::test]
    async fn same_day_repeat_is_a_no_op() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 2, 9, h.clock.now() - Duration::days(1)));

        let first = h.engine.update_streak(user).await.unwrap();
        h.clock.advance(Duration::hours(3));
        let second = h.engine.update_streak(user).await.unwrap();

        assert_eq!(first.current_streak, 3);
        assert_eq!(second, first);
    }

    #[tokio::test]
    async fn gap_resets_but_keeps_longest() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 15, 15, h.clock.now() - Duration::days(3)));

        let outcome = h.engine.update_streak(user).await.unwrap();

        assert_eq!(outcome.current_streak, 1);
        assert_eq!(outcome.longest_streak, 15);
    }

    #[tokio::test]
    async fn xp_awards_do_not_block_the_daily_streak() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 1, 1, h.clock.now() - Duration::days(1)));

        h.engine.award_xp(user, 10, "quiz_completed", None).await.unwrap();
        let outcome = h.engine.update_streak(user).await.unwrap();

        assert_eq!(outcome.current_streak, 2);
    }

    #[tokio::test]
    async fn reaching_seven_pays_the_milestone_once() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 6, 6, h.clock.now() - Duration::days(1)));

        h.engine.update_streak(user).await.unwrap();
        h.engine.update_streak(user).await.unwrap();

        let bonuses: Vec<_> = h
            .store
            .ledger(user)
            .into_iter()
            .filter(|e| e.source == "streak_7_days")
            .collect();
        assert_eq!(bonuses.len(), 1);
        assert_eq!(bonuses[0].xp, 50);
        assert_eq!(h.store.profile(user).unwrap().xp_total, 50);
    }

    #[tokio::test]
    async fn milestone_fires_again_in_a_later_streak() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 6, 6, h.clock.now() - Duration::days(1)));
        h.engine.update_streak(user).await.unwrap();

        h.clock.advance(Duration::days(3));
        h.engine.update_streak(user).await.unwrap();
        for _ in 0..6 {
            h.clock.advance(Duration::days(1));
            h.engine.update_streak(user).await.unwrap();
        }

        let bonuses = h
            .store
            .ledger(user)
            .into_iter()
            .filter(|e| e.source == "streak_7_days")
            .count();
        assert_eq!(bonuses, 2);
        assert_eq!(h.store.profile(user).unwrap().longest_streak, 7);
    }

    #[tokio::test]
    async fn streak_badges_unlock() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.add_badge(crate::models::BadgeDefinition {
            id: Uuid::new_v4(),
            code: "streak_3".to_string(),
            name: "Three in a row".to_string(),
            description: "Three consecutive days".to_string(),
            icon_url: None,
            criteria: crate::models::BadgeCriteria {
                streak: Some(3),
                ..Default::default()
            },
        });
        h.store.put_profile(seeded(user, 2, 2, h.clock.now() - Duration::days(1)));

        h.engine.update_streak(user).await.unwrap();

        assert_eq!(h.store.user_badge_count(user), 1);
    }

    #[tokio::test]
    async fn failed_milestone_bonus_leaves_the_day_uncounted() {
        let h = harness();
        let user = Uuid::new_v4();
        h.store.put_profile(seeded(user, 6, 6, h.clock.now() - Duration::days(1)));
        h.store.fail_ledger.store(true, Ordering::SeqCst);

        let err = h.engine.update_streak(user).await;
        assert!(matches!(err, Err(EngineError::Durability { .. })));
        assert_eq!(h.store.profile(user).unwrap().current_streak, 6);

        h.store.fail_ledger.store(false, Ordering::SeqCst);
        let outcome = h.engine.update_streak(user).await.unwrap();

        assert_eq!(outcome.current_streak, 7);
        let bonuses = h
            .store
            .ledger(user)
            .into_iter()
            .filter(|e| e.source == "streak_7_days")
            .count();
        assert_eq!(bonuses, 1);
        assert_eq!(h.store.profile(user).unwrap().xp_total, 50);
    }
}
