use std::collections::BTreeMap;
use std::fmt::Write;

use crate::models::{ClassRankSnapshot, RankEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct LevelSummary {
    pub level: i32,
    pub count: usize,
    pub avg_xp: f64,
}

pub fn summarize_by_level(entries: &[RankEntry]) -> Vec<LevelSummary> {
    let mut map: BTreeMap<i32, (usize, i64)> = BTreeMap::new();

    for entry in entries {
        let slot = map.entry(entry.level).or_insert((0, 0));
        slot.0 += 1;
        slot.1 += entry.xp;
    }

    map.into_iter()
        .rev()
        .map(|(level, (count, total_xp))| LevelSummary {
            level,
            count,
            avg_xp: if count == 0 {
                0.0
            } else {
                total_xp as f64 / count as f64
            },
        })
        .collect()
}

pub fn build_report(class_label: &str, snapshot: &ClassRankSnapshot, top: usize) -> String {
    let summaries = summarize_by_level(&snapshot.rank_data);
    let mut output = String::new();

    let _ = writeln!(output, "# Class XP Ranking");
    let _ = writeln!(
        output,
        "Generated for {} ({} period, {})",
        class_label,
        snapshot.period.as_str(),
        snapshot.generated_at.format("%Y-%m-%d %H:%M UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Standings");

    if snapshot.rank_data.is_empty() {
        let _ = writeln!(output, "No students in this class yet.");
    } else {
        for entry in snapshot.rank_data.iter().take(top) {
            let _ = writeln!(
                output,
                "{}. {} - {} XP (level {})",
                entry.position, entry.display_name, entry.xp, entry.level
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Level Distribution");

    if summaries.is_empty() {
        let _ = writeln!(output, "No progression recorded yet.");
    } else {
        for summary in &summaries {
            let _ = writeln!(
                output,
                "- Level {}: {} students (avg {:.0} XP)",
                summary.level, summary.count, summary.avg_xp
            );
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RankPeriod;
    use chrono::{TimeZone, Utc};
    use uuid::Uuid;

    fn entry(position: usize, name: &str, xp: i64, level: i32) -> RankEntry {
        RankEntry {
            position,
            user_id: Uuid::new_v4(),
            display_name: name.to_string(),
            xp,
            level,
        }
    }

    #[test]
    fn levels_are_summarized_highest_first() {
        let entries = vec![
            entry(1, "Jules Moreno", 480, 3),
            entry(2, "Kiara Patel", 260, 3),
            entry(3, "Avery Lee", 120, 2),
        ];
        let summaries = summarize_by_level(&entries);
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].level, 3);
        assert_eq!(summaries[0].count, 2);
        assert!((summaries[0].avg_xp - 370.0).abs() < 0.001);
        assert_eq!(summaries[1].level, 2);
    }

    #[test]
    fn report_lists_top_students() {
        let snapshot = ClassRankSnapshot {
            id: Uuid::new_v4(),
            class_id: Uuid::new_v4(),
            period: RankPeriod::Weekly,
            generated_at: Utc.with_ymd_and_hms(2026, 3, 4, 10, 0, 0).unwrap(),
            rank_data: vec![entry(1, "Jules Moreno", 480, 3), entry(2, "Avery Lee", 120, 2)],
        };

        let report = build_report("Cohort 2026", &snapshot, 1);

        assert!(report.contains("Generated for Cohort 2026 (weekly period, 2026-03-04 10:00 UTC)"));
        assert!(report.contains("1. Jules Moreno - 480 XP (level 3)"));
        assert!(!report.contains("2. Avery Lee"));
        assert!(report.contains("- Level 2: 1 students (avg 120 XP)"));
    }
}
