use chrono::{Datelike, NaiveDate};

use crate::config::LeagueSchedule;
use crate::model::GameType;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub game_type: GameType,
    /// Set when a January/February date was decided without a configured
    /// tail cutoff for the season.
    pub missing_cutoff: bool,
}

/// Season-phase classification from the calendar. Pure and total; applying
/// it to its own output yields the same phase.
pub fn classify(
    schedule: &LeagueSchedule,
    declared: Option<GameType>,
    date: NaiveDate,
    season: i32,
) -> Classification {
    let year = date.year();
    let month = date.month();
    let decided = |game_type| Classification {
        game_type,
        missing_cutoff: false,
    };

    if year == season && schedule.preseason_months.contains(&month) {
        return decided(GameType::Preseason);
    }
    if year == season && schedule.regular_months.contains(&month) {
        return decided(GameType::Regular);
    }
    if year == season + 1 && schedule.playoff_months.contains(&month) {
        return match schedule.cutoff_for(season) {
            Some(cutoff) if date <= cutoff => decided(GameType::Regular),
            Some(_) => decided(GameType::Playoff),
            None => Classification {
                game_type: declared.unwrap_or(GameType::Playoff),
                missing_cutoff: true,
            },
        };
    }
    decided(declared.unwrap_or(GameType::Regular))
}

/// Playoff rounds carry no week number.
pub fn normalize_week(game_type: GameType, week: Option<i32>) -> Option<i32> {
    match game_type {
        GameType::Playoff => None,
        GameType::Regular | GameType::Preseason => week.filter(|w| *w > 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).expect("date")
    }

    #[test]
    fn august_game_declared_playoff_is_preseason() {
        let nfl = LeagueSchedule::nfl();
        let c = classify(&nfl, Some(GameType::Playoff), d(2022, 8, 13), 2022);
        assert_eq!(c.game_type, GameType::Preseason);
    }

    #[test]
    fn january_tail_before_cutoff_is_regular() {
        let nfl = LeagueSchedule::nfl();
        let week18 = classify(&nfl, Some(GameType::Playoff), d(2023, 1, 8), 2022);
        assert_eq!(week18.game_type, GameType::Regular);
        let wildcard = classify(&nfl, Some(GameType::Regular), d(2023, 1, 14), 2022);
        assert_eq!(wildcard.game_type, GameType::Playoff);
    }

    #[test]
    fn missing_cutoff_falls_back_to_declared_and_flags() {
        let nfl = LeagueSchedule::nfl();
        let c = classify(&nfl, Some(GameType::Regular), d(2015, 1, 3), 2014);
        assert_eq!(c.game_type, GameType::Regular);
        assert!(c.missing_cutoff);
        let c = classify(&nfl, None, d(2015, 1, 10), 2014);
        assert_eq!(c.game_type, GameType::Playoff);
    }

    #[test]
    fn outside_windows_uses_declared_or_regular() {
        let nfl = LeagueSchedule::nfl();
        assert_eq!(
            classify(&nfl, Some(GameType::Preseason), d(2023, 3, 1), 2023).game_type,
            GameType::Preseason
        );
        assert_eq!(classify(&nfl, None, d(2023, 5, 1), 2023).game_type, GameType::Regular);
    }

    #[test]
    fn classify_is_idempotent_over_a_season() {
        let nfl = LeagueSchedule::nfl();
        let mut date = d(2022, 7, 1);
        while date <= d(2023, 2, 28) {
            for declared in [None, Some(GameType::Preseason), Some(GameType::Regular), Some(GameType::Playoff)] {
                let first = classify(&nfl, declared, date, 2022).game_type;
                let again = classify(&nfl, Some(first), date, 2022).game_type;
                assert_eq!(first, again, "{date} {declared:?}");
            }
            date = date.succ_opt().expect("next day");
        }
    }

    #[test]
    fn playoff_weeks_are_dropped() {
        assert_eq!(normalize_week(GameType::Playoff, Some(19)), None);
        assert_eq!(normalize_week(GameType::Regular, Some(18)), Some(18));
        assert_eq!(normalize_week(GameType::Regular, Some(0)), None);
    }
}
