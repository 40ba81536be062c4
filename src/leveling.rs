use serde::Serialize;

use crate::config::LevelingConfig;

/// Where a given XP total sits on the level curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LevelInfo {
    pub level: i32,
    pub xp_for_next_level: i64,
    pub progress_percent: u8,
}

/// Tabulated thresholds for the early levels, then one level per
/// `overflow_step` XP past the last threshold.
#[derive(Debug, Clone)]
pub struct LevelTable {
    thresholds: Vec<i64>,
    overflow_step: i64,
}

impl LevelTable {
    pub fn new(config: &LevelingConfig) -> Self {
        let mut thresholds = config.thresholds.clone();
        if thresholds.first() != Some(&0) {
            thresholds.insert(0, 0);
        }
        Self {
            thresholds,
            overflow_step: config.overflow_step.max(1),
        }
    }

    pub fn level(&self, xp_total: i64) -> i32 {
        let xp = xp_total.max(0);
        let last = self.last_threshold();
        let tabulated = self.thresholds.len() as i64;

        if xp > last {
            return clamp_level(tabulated + (xp - last) / self.overflow_step);
        }

        let reached = self.thresholds.iter().take_while(|t| **t <= xp).count();
        clamp_level(reached.max(1) as i64)
    }

    /// XP at which `level` begins.
    pub fn lower_threshold(&self, level: i32) -> i64 {
        let level = i64::from(level.max(1));
        let tabulated = self.thresholds.len() as i64;
        if level <= tabulated {
            self.thresholds[(level - 1) as usize]
        } else {
            self.last_threshold()
                .saturating_add((level - tabulated).saturating_mul(self.overflow_step))
        }
    }

    pub fn xp_for_next_level(&self, xp_total: i64) -> i64 {
        self.lower_threshold(self.level(xp_total).saturating_add(1))
    }

    pub fn info(&self, xp_total: i64) -> LevelInfo {
        let xp = xp_total.max(0);
        let level = self.level(xp);
        let lower = self.lower_threshold(level);
        let upper = self.lower_threshold(level.saturating_add(1));
        let span = (upper - lower).max(1);
        let percent = (100.0 * (xp - lower) as f64 / span as f64).round();

        LevelInfo {
            level,
            xp_for_next_level: upper,
            progress_percent: percent.clamp(0.0, 100.0) as u8,
        }
    }

    fn last_threshold(&self) -> i64 {
        self.thresholds.last().copied().unwrap_or(0)
    }
}

fn clamp_level(level: i64) -> i32 {
    level.clamp(1, i64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn table() -> LevelTable {
        LevelTable::new(&Config::builtin().unwrap().leveling)
    }

    #[test]
    fn tabulated_levels_follow_thresholds() {
        let table = table();
        assert_eq!(table.level(0), 1);
        assert_eq!(table.level(99), 1);
        assert_eq!(table.level(100), 2);
        assert_eq!(table.level(150), 2);
        assert_eq!(table.level(250), 3);
        assert_eq!(table.level(99_999), 19);
        assert_eq!(table.level(100_000), 20);
    }

    #[test]
    fn levels_extrapolate_past_the_table() {
        let table = table();
        assert_eq!(table.level(109_999), 20);
        assert_eq!(table.level(110_000), 21);
        assert_eq!(table.level(135_000), 23);
        assert_eq!(table.xp_for_next_level(100_000), 110_000);
        assert_eq!(table.xp_for_next_level(135_000), 140_000);
    }

    #[test]
    fn negative_xp_is_level_one() {
        assert_eq!(table().level(-50), 1);
        assert_eq!(table().info(-50).progress_percent, 0);
    }

    #[test]
    fn level_is_monotonic() {
        let table = table();
        let mut previous = table.level(0);
        for xp in (0..400_000).step_by(37) {
            let level = table.level(xp);
            assert!(level >= previous, "level dropped at {xp}");
            previous = level;
        }
        assert!(table.level(i64::MAX) >= previous);
    }

    #[test]
    fn progress_percent_is_rounded_within_band() {
        let table = table();
        let info = table.info(150);
        assert_eq!(info.level, 2);
        assert_eq!(info.xp_for_next_level, 250);
        assert_eq!(info.progress_percent, 33);
        assert_eq!(table.info(100).progress_percent, 0);
        assert_eq!(table.info(249).progress_percent, 99);
        assert_eq!(table.info(105_000).progress_percent, 50);
    }
}
