//! In-memory collaborators for engine tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::bail;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{
    AppendOutcome, BadgeDefinition, ClassRankSnapshot, FocusSession, LedgerEntry,
    MissionDefinition, MissionProgress, MissionStatus, NewLedgerEntry, ProgressionProfile,
    RankPeriod, UserBadge, UserMission,
};
use crate::store::{
    BadgeStore, Catalog, Clock, FocusStore, LedgerStore, MissionStore, Notifier, ProfileStore,
    Roster, SnapshotStore,
};

#[derive(Default)]
struct State {
    ledger: Vec<LedgerEntry>,
    profiles: HashMap<Uuid, ProgressionProfile>,
    badges: Vec<BadgeDefinition>,
    missions: Vec<MissionDefinition>,
    user_badges: HashMap<(Uuid, Uuid), DateTime<Utc>>,
    user_missions: HashMap<(Uuid, Uuid), UserMission>,
    focus: Vec<FocusSession>,
    members: HashMap<Uuid, Vec<Uuid>>,
    names: HashMap<Uuid, String>,
    snapshots: Vec<ClassRankSnapshot>,
    notifications: Vec<(String, Uuid, Value)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    pub fail_ledger: AtomicBool,
    pub fail_profiles: AtomicBool,
    pub fail_profile_writes: AtomicBool,
    pub fail_catalog: AtomicBool,
    pub fail_notifier: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn add_badge(&self, badge: BadgeDefinition) {
        self.state().badges.push(badge);
    }

    pub fn add_mission(&self, mission: MissionDefinition) {
        self.state().missions.push(mission);
    }

    pub fn add_member(&self, class_id: Uuid, user_id: Uuid, name: &str) {
        let mut state = self.state();
        state.members.entry(class_id).or_default().push(user_id);
        state.names.insert(user_id, name.to_string());
    }

    pub fn put_profile(&self, profile: ProgressionProfile) {
        self.state().profiles.insert(profile.user_id, profile);
    }

    pub fn profile(&self, user_id: Uuid) -> Option<ProgressionProfile> {
        self.state().profiles.get(&user_id).cloned()
    }

    pub fn remove_profile(&self, user_id: Uuid) {
        self.state().profiles.remove(&user_id);
    }

    pub fn ledger(&self, user_id: Uuid) -> Vec<LedgerEntry> {
        self.state()
            .ledger
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn user_badge_count(&self, user_id: Uuid) -> usize {
        self.state()
            .user_badges
            .keys()
            .filter(|(user, _)| *user == user_id)
            .count()
    }

    pub fn mission_instance(&self, user_id: Uuid, mission_id: Uuid) -> Option<UserMission> {
        self.state().user_missions.get(&(user_id, mission_id)).cloned()
    }

    pub fn focus_session(&self, session_id: Uuid) -> Option<FocusSession> {
        self.state().focus.iter().find(|s| s.id == session_id).cloned()
    }

    pub fn notifications(&self) -> Vec<(String, Uuid, Value)> {
        self.state().notifications.clone()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots.len()
    }

    fn check(flag: &AtomicBool, what: &str) -> anyhow::Result<()> {
        if flag.load(Ordering::SeqCst) {
            bail!("{what} unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn append(&self, entry: NewLedgerEntry) -> anyhow::Result<AppendOutcome> {
        Self::check(&self.fail_ledger, "ledger")?;
        let mut state = self.state();
        if let Some(key) = &entry.dedupe_key {
            if state.ledger.iter().any(|e| e.dedupe_key.as_ref() == Some(key)) {
                return Ok(AppendOutcome::Duplicate);
            }
        }
        let entry = entry.into_entry();
        state.ledger.push(entry.clone());
        Ok(AppendOutcome::Appended(entry))
    }

    async fn append_capped(
        &self,
        mut entry: NewLedgerEntry,
        since: DateTime<Utc>,
        cap: i64,
    ) -> anyhow::Result<i64> {
        Self::check(&self.fail_ledger, "ledger")?;
        let mut state = self.state();
        if let Some(key) = &entry.dedupe_key {
            if state.ledger.iter().any(|e| e.dedupe_key.as_ref() == Some(key)) {
                return Ok(0);
            }
        }
        let earned: i64 = state
            .ledger
            .iter()
            .filter(|e| e.user_id == entry.user_id && e.source == entry.source)
            .filter(|e| e.created_at >= since)
            .map(|e| e.xp)
            .sum();
        let granted = entry.xp.min(cap - earned).max(0);
        if granted > 0 {
            entry.xp = granted;
            state.ledger.push(entry.into_entry());
        }
        Ok(granted)
    }

    async fn total_for(&self, user_id: Uuid) -> anyhow::Result<i64> {
        Self::check(&self.fail_ledger, "ledger")?;
        Ok(self.ledger(user_id).iter().map(|e| e.xp).sum())
    }

    async fn sum_since(
        &self,
        user_id: Uuid,
        source: &str,
        since: DateTime<Utc>,
    ) -> anyhow::Result<i64> {
        Self::check(&self.fail_ledger, "ledger")?;
        Ok(self
            .ledger(user_id)
            .iter()
            .filter(|e| e.source == source && e.created_at >= since)
            .map(|e| e.xp)
            .sum())
    }

    async fn entries_for(&self, user_id: Uuid) -> anyhow::Result<Vec<LedgerEntry>> {
        Self::check(&self.fail_ledger, "ledger")?;
        Ok(self.ledger(user_id))
    }
}

#[async_trait]
impl ProfileStore for MemoryStore {
    async fn get(&self, user_id: Uuid) -> anyhow::Result<Option<ProgressionProfile>> {
        Self::check(&self.fail_profiles, "profiles")?;
        Ok(self.profile(user_id))
    }

    async fn insert_if_absent(&self, profile: &ProgressionProfile) -> anyhow::Result<bool> {
        Self::check(&self.fail_profiles, "profiles")?;
        Self::check(&self.fail_profile_writes, "profile writes")?;
        let mut state = self.state();
        if state.profiles.contains_key(&profile.user_id) {
            return Ok(false);
        }
        state.profiles.insert(profile.user_id, profile.clone());
        Ok(true)
    }

    async fn save_xp(
        &self,
        user_id: Uuid,
        xp_total: i64,
        level: i32,
        last_activity_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        Self::check(&self.fail_profiles, "profiles")?;
        Self::check(&self.fail_profile_writes, "profile writes")?;
        let mut state = self.state();
        if let Some(profile) = state.profiles.get_mut(&user_id) {
            profile.xp_total = xp_total;
            profile.level = level;
            profile.last_activity_at = Some(last_activity_at);
        }
        Ok(())
    }

    async fn save_streak(
        &self,
        profile: &ProgressionProfile,
        expected: Option<DateTime<Utc>>,
    ) -> anyhow::Result<bool> {
        Self::check(&self.fail_profiles, "profiles")?;
        Self::check(&self.fail_profile_writes, "profile writes")?;
        let mut state = self.state();
        match state.profiles.get_mut(&profile.user_id) {
            Some(current) if current.last_streak_at == expected => {
                current.current_streak = profile.current_streak;
                current.longest_streak = profile.longest_streak;
                current.last_streak_at = profile.last_streak_at;
                current.last_activity_at = profile.last_activity_at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl Catalog for MemoryStore {
    async fn badges(&self) -> anyhow::Result<Vec<BadgeDefinition>> {
        Self::check(&self.fail_catalog, "catalog")?;
        Ok(self.state().badges.clone())
    }

    async fn missions(&self) -> anyhow::Result<Vec<MissionDefinition>> {
        Self::check(&self.fail_catalog, "catalog")?;
        Ok(self.state().missions.clone())
    }

    async fn mission_by_code(&self, code: &str) -> anyhow::Result<Option<MissionDefinition>> {
        Self::check(&self.fail_catalog, "catalog")?;
        Ok(self.state().missions.iter().find(|m| m.code == code).cloned())
    }
}

#[async_trait]
impl BadgeStore for MemoryStore {
    async fn grant_if_absent(
        &self,
        user_id: Uuid,
        badge_id: Uuid,
        granted_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let mut state = self.state();
        if state.user_badges.contains_key(&(user_id, badge_id)) {
            return Ok(false);
        }
        state.user_badges.insert((user_id, badge_id), granted_at);
        Ok(true)
    }

    async fn badges_for(&self, user_id: Uuid) -> anyhow::Result<Vec<UserBadge>> {
        let state = self.state();
        let mut badges: Vec<UserBadge> = state
            .user_badges
            .iter()
            .filter(|((user, _), _)| *user == user_id)
            .filter_map(|((_, badge_id), granted_at)| {
                state.badges.iter().find(|b| b.id == *badge_id).map(|b| UserBadge {
                    badge_id: b.id,
                    code: b.code.clone(),
                    name: b.name.clone(),
                    icon_url: b.icon_url.clone(),
                    granted_at: *granted_at,
                })
            })
            .collect();
        badges.sort_by(|a, b| b.granted_at.cmp(&a.granted_at));
        Ok(badges)
    }
}

#[async_trait]
impl MissionStore for MemoryStore {
    async fn instances_for(&self, user_id: Uuid) -> anyhow::Result<Vec<UserMission>> {
        Ok(self
            .state()
            .user_missions
            .values()
            .filter(|m| m.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn insert_if_absent(&self, instance: &UserMission) -> anyhow::Result<bool> {
        let mut state = self.state();
        let key = (instance.user_id, instance.mission_id);
        if state.user_missions.contains_key(&key) {
            return Ok(false);
        }
        state.user_missions.insert(key, instance.clone());
        Ok(true)
    }

    async fn renew(
        &self,
        expired_reset_at: DateTime<Utc>,
        fresh: &UserMission,
    ) -> anyhow::Result<()> {
        let mut state = self.state();
        let key = (fresh.user_id, fresh.mission_id);
        match state.user_missions.get(&key) {
            Some(current) if current.reset_at != expired_reset_at => {}
            _ => {
                state.user_missions.insert(key, fresh.clone());
            }
        }
        Ok(())
    }

    async fn save_progress(
        &self,
        user_id: Uuid,
        mission_id: Uuid,
        cycle: DateTime<Utc>,
        progress: &MissionProgress,
    ) -> anyhow::Result<()> {
        let mut state = self.state();
        if let Some(instance) = state.user_missions.get_mut(&(user_id, mission_id)) {
            if instance.reset_at == cycle && instance.status == MissionStatus::Active {
                instance.progress = progress.clone();
            }
        }
        Ok(())
    }

    async fn complete(
        &self,
        user_id: Uuid,
        mission_id: Uuid,
        cycle: DateTime<Utc>,
        progress: &MissionProgress,
    ) -> anyhow::Result<bool> {
        let mut state = self.state();
        match state.user_missions.get_mut(&(user_id, mission_id)) {
            Some(instance)
                if instance.reset_at == cycle && instance.status == MissionStatus::Active =>
            {
                instance.status = MissionStatus::Completed;
                instance.progress = progress.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl FocusStore for MemoryStore {
    async fn start(&self, session: &FocusSession) -> anyhow::Result<()> {
        self.state().focus.push(session.clone());
        Ok(())
    }

    async fn get(&self, session_id: Uuid, user_id: Uuid) -> anyhow::Result<Option<FocusSession>> {
        Ok(self
            .state()
            .focus
            .iter()
            .find(|s| s.id == session_id && s.user_id == user_id)
            .cloned())
    }

    async fn finish(
        &self,
        session_id: Uuid,
        ended_at: DateTime<Utc>,
        duration_min: i32,
    ) -> anyhow::Result<()> {
        let mut state = self.state();
        if let Some(session) = state.focus.iter_mut().find(|s| s.id == session_id) {
            session.ended_at = Some(ended_at);
            session.duration_min = Some(duration_min);
        }
        Ok(())
    }

    async fn cancel(&self, session_id: Uuid, user_id: Uuid) -> anyhow::Result<bool> {
        let mut state = self.state();
        let before = state.focus.len();
        state
            .focus
            .retain(|s| !(s.id == session_id && s.user_id == user_id && s.ended_at.is_none()));
        Ok(state.focus.len() < before)
    }

    async fn active_for(&self, user_id: Uuid) -> anyhow::Result<Option<FocusSession>> {
        Ok(self
            .state()
            .focus
            .iter()
            .filter(|s| s.user_id == user_id && s.ended_at.is_none())
            .max_by_key(|s| s.started_at)
            .cloned())
    }

    async fn finished_for(&self, user_id: Uuid) -> anyhow::Result<Vec<FocusSession>> {
        let mut sessions: Vec<FocusSession> = self
            .state()
            .focus
            .iter()
            .filter(|s| s.user_id == user_id && s.ended_at.is_some())
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        Ok(sessions)
    }
}

#[async_trait]
impl Roster for MemoryStore {
    async fn members(&self, class_id: Uuid) -> anyhow::Result<Vec<Uuid>> {
        Ok(self.state().members.get(&class_id).cloned().unwrap_or_default())
    }

    async fn display_names(&self, user_ids: &[Uuid]) -> anyhow::Result<HashMap<Uuid, String>> {
        let state = self.state();
        Ok(user_ids
            .iter()
            .filter_map(|id| state.names.get(id).map(|name| (*id, name.clone())))
            .collect())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn latest(
        &self,
        class_id: Uuid,
        period: RankPeriod,
    ) -> anyhow::Result<Option<ClassRankSnapshot>> {
        Ok(self
            .state()
            .snapshots
            .iter()
            .filter(|s| s.class_id == class_id && s.period == period)
            .max_by_key(|s| s.generated_at)
            .cloned())
    }

    async fn save(&self, snapshot: &ClassRankSnapshot) -> anyhow::Result<()> {
        self.state().snapshots.push(snapshot.clone());
        Ok(())
    }
}

#[async_trait]
impl Notifier for MemoryStore {
    async fn send(
        &self,
        template_key: &str,
        user_id: Uuid,
        variables: Value,
    ) -> anyhow::Result<()> {
        Self::check(&self.fail_notifier, "notifier")?;
        self.state()
            .notifications
            .push((template_key.to_string(), user_id, variables));
        Ok(())
    }
}

pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}
