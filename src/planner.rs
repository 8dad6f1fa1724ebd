use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::LeagueSchedule;
use crate::connectors::FetchScope;
use crate::model::{GameType, SeasonState};

/// Phases whose game count has a fixed formula.
pub const TRACKED_PHASES: [GameType; 2] = [GameType::Regular, GameType::Playoff];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncPlan {
    Skip,
    Full,
    /// Phases still short of their expected count, largest gap first.
    Partial(Vec<GameType>),
}

impl SyncPlan {
    pub fn label(&self) -> String {
        match self {
            SyncPlan::Skip => "skip".to_string(),
            SyncPlan::Full => "full".to_string(),
            SyncPlan::Partial(phases) => {
                let names: Vec<&str> = phases.iter().map(|p| p.as_str()).collect();
                format!("partial:{}", names.join(","))
            }
        }
    }

    pub fn scope(&self) -> Option<FetchScope> {
        match self {
            SyncPlan::Skip => None,
            SyncPlan::Full => Some(FetchScope::Full),
            SyncPlan::Partial(phases) => Some(FetchScope::Phases(phases.clone())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseGap {
    pub phase: GameType,
    pub expected: u32,
    pub actual: u32,
}

impl PhaseGap {
    pub fn missing(&self) -> u32 {
        self.expected.saturating_sub(self.actual)
    }
}

/// Expected playable games: the formula minus fixtures configured as
/// cancelled in that phase.
pub fn expected_playable(schedule: &LeagueSchedule, season: i32, phase: GameType) -> Option<u32> {
    let scheduled = schedule.expected_games(season, phase)?;
    let cancelled = match phase {
        GameType::Regular => schedule.cancelled_in(season).count() as u32,
        _ => 0,
    };
    Some(scheduled.saturating_sub(cancelled))
}

pub fn phase_gaps(
    schedule: &LeagueSchedule,
    season: i32,
    counts: &BTreeMap<GameType, u32>,
) -> Vec<PhaseGap> {
    TRACKED_PHASES
        .iter()
        .filter_map(|&phase| {
            Some(PhaseGap {
                phase,
                expected: expected_playable(schedule, season, phase)?,
                actual: counts.get(&phase).copied().unwrap_or(0),
            })
        })
        .collect()
}

/// Share of expected games present, over every tracked phase, as 0..=100.
pub fn completeness_percent(gaps: &[PhaseGap]) -> f64 {
    let expected: u32 = gaps.iter().map(|g| g.expected).sum();
    if expected == 0 {
        return 100.0;
    }
    let present: u32 = gaps.iter().map(|g| g.actual.min(g.expected)).sum();
    f64::from(present) * 100.0 / f64::from(expected)
}

pub fn plan(
    schedule: &LeagueSchedule,
    season: i32,
    counts: &BTreeMap<GameType, u32>,
    state: SeasonState,
    force: bool,
) -> SyncPlan {
    if force {
        return SyncPlan::Full;
    }
    if state == SeasonState::AuditedComplete {
        return SyncPlan::Skip;
    }
    if counts.values().all(|n| *n == 0) {
        return SyncPlan::Full;
    }
    let mut short: Vec<PhaseGap> = phase_gaps(schedule, season, counts)
        .into_iter()
        .filter(|g| g.missing() > 0)
        .collect();
    if short.is_empty() {
        return SyncPlan::Skip;
    }
    short.sort_by(|a, b| b.missing().cmp(&a.missing()).then(a.phase.cmp(&b.phase)));
    SyncPlan::Partial(short.into_iter().map(|g| g.phase).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts(regular: u32, playoff: u32) -> BTreeMap<GameType, u32> {
        BTreeMap::from([(GameType::Regular, regular), (GameType::Playoff, playoff)])
    }

    #[test]
    fn empty_season_is_fetched_in_full() {
        let nfl = LeagueSchedule::nfl();
        assert_eq!(
            plan(&nfl, 2023, &BTreeMap::new(), SeasonState::NotStarted, false),
            SyncPlan::Full
        );
    }

    #[test]
    fn cancelled_fixture_lowers_the_target() {
        let nfl = LeagueSchedule::nfl();
        assert_eq!(expected_playable(&nfl, 2022, GameType::Regular), Some(271));
        assert_eq!(
            plan(&nfl, 2022, &counts(271, 13), SeasonState::Reconciling, false),
            SyncPlan::Skip
        );
    }

    #[test]
    fn partial_orders_by_largest_gap() {
        let nfl = LeagueSchedule::nfl();
        let p = plan(&nfl, 2023, &counts(270, 2), SeasonState::AuditedIncomplete, false);
        assert_eq!(p, SyncPlan::Partial(vec![GameType::Playoff, GameType::Regular]));
        assert_eq!(p.label(), "partial:playoff,regular");
    }

    #[test]
    fn audited_complete_skips_unless_forced() {
        let nfl = LeagueSchedule::nfl();
        let c = counts(10, 0);
        assert_eq!(plan(&nfl, 2023, &c, SeasonState::AuditedComplete, false), SyncPlan::Skip);
        assert_eq!(plan(&nfl, 2023, &c, SeasonState::AuditedComplete, true), SyncPlan::Full);
    }

    #[test]
    fn completeness_caps_each_phase() {
        let gaps = [
            PhaseGap { phase: GameType::Regular, expected: 10, actual: 12 },
            PhaseGap { phase: GameType::Playoff, expected: 10, actual: 5 },
        ];
        assert!((completeness_percent(&gaps) - 75.0).abs() < 1e-9);
    }
}
