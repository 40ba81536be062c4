use std::collections::HashSet;
use std::path::Path;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

const DEFAULT_CONFIG_FILE: &str = "progression.toml";
const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Every section and field falls back to the values in `config/default.toml`,
/// so a partial file only needs the keys it changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub leveling: LevelingConfig,
    #[serde(default)]
    pub streak: StreakConfig,
    #[serde(default)]
    pub focus: FocusConfig,
    #[serde(default)]
    pub calendar: CalendarConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LevelingConfig {
    /// XP needed to reach each level, starting at level 1
    #[serde(default = "default_thresholds")]
    pub thresholds: Vec<i64>,
    /// XP per level past the end of the table
    #[serde(default = "default_overflow_step")]
    pub overflow_step: i64,
}

impl Default for LevelingConfig {
    fn default() -> Self {
        Self {
            thresholds: default_thresholds(),
            overflow_step: default_overflow_step(),
        }
    }
}

fn default_thresholds() -> Vec<i64> {
    vec![
        0, 100, 250, 500, 1000, 2000, 3500, 5500, 8000, 11000, 15000, 20000, 26000, 33000, 41000,
        50000, 60000, 72000, 85000, 100000,
    ]
}

fn default_overflow_step() -> i64 {
    10000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreakConfig {
    #[serde(default = "default_milestones")]
    pub milestones: Vec<StreakMilestone>,
}

impl Default for StreakConfig {
    fn default() -> Self {
        Self {
            milestones: default_milestones(),
        }
    }
}

fn default_milestones() -> Vec<StreakMilestone> {
    vec![
        StreakMilestone { days: 7, xp: 50 },
        StreakMilestone { days: 30, xp: 150 },
        StreakMilestone { days: 100, xp: 500 },
    ]
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreakMilestone {
    pub days: i32,
    pub xp: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FocusConfig {
    #[serde(default = "default_daily_xp_limit")]
    pub daily_xp_limit: i64,
    #[serde(default = "default_techniques")]
    pub techniques: Vec<Technique>,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            daily_xp_limit: default_daily_xp_limit(),
            techniques: default_techniques(),
        }
    }
}

fn default_daily_xp_limit() -> i64 {
    50
}

fn default_techniques() -> Vec<Technique> {
    vec![
        Technique::new("pomodoro25", "Classic Pomodoro (25/5)", 25, 5, 5),
        Technique::new("pomodoro30", "Medium Pomodoro (30/5)", 30, 5, 7),
        Technique::new("pomodoro50", "Long Pomodoro (50/10)", 50, 10, 12),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Technique {
    pub name: String,
    pub label: String,
    pub work_minutes: i32,
    pub break_minutes: i32,
    pub xp: i64,
}

impl Technique {
    fn new(name: &str, label: &str, work_minutes: i32, break_minutes: i32, xp: i64) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            work_minutes,
            break_minutes,
            xp,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CalendarConfig {
    /// Fixed offset used for day and week boundaries
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    5000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn builtin() -> anyhow::Result<Self> {
        let config: Config =
            toml::from_str(DEFAULT_CONFIG).context("built-in configuration is invalid")?;
        config.validate()?;
        Ok(config)
    }

    pub fn technique(&self, name: &str) -> Option<&Technique> {
        self.focus.techniques.iter().find(|t| t.name == name)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let thresholds = &self.leveling.thresholds;
        if thresholds.first() != Some(&0) {
            bail!("leveling.thresholds must start at 0");
        }
        if thresholds.windows(2).any(|pair| pair[0] >= pair[1]) {
            bail!("leveling.thresholds must be strictly ascending");
        }
        if self.leveling.overflow_step <= 0 {
            bail!("leveling.overflow_step must be positive");
        }
        if self.focus.daily_xp_limit < 0 {
            bail!("focus.daily_xp_limit must not be negative");
        }

        let mut names = HashSet::new();
        for technique in &self.focus.techniques {
            if !names.insert(technique.name.as_str()) {
                bail!("duplicate focus technique {}", technique.name);
            }
        }

        if self.streak.milestones.iter().any(|m| m.days <= 0 || m.xp < 0) {
            bail!("streak.milestones need positive days and non-negative xp");
        }

        if self.calendar.utc_offset_minutes.abs() >= 24 * 60 {
            bail!("calendar.utc_offset_minutes must be within one day");
        }

        Ok(())
    }
}

/// Loads the explicit config file, falling back to `progression.toml` in the
/// working directory and finally to the built-in defaults.
pub fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let candidate = match path {
        Some(path) => Some(path.to_path_buf()),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            default.exists().then(|| default.to_path_buf())
        }
    };

    let Some(candidate) = candidate else {
        return Config::builtin();
    };

    let contents = std::fs::read_to_string(&candidate)
        .with_context(|| format!("failed to read config {}", candidate.display()))?;
    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config {}", candidate.display()))?;
    config.validate()?;
    Ok(config)
}
