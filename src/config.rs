use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::http_cache::app_cache_dir;
use crate::model::{GameType, League, SourceTag};

const DB_FILE: &str = "gridiron.sqlite";

/// Schedule formula and calendar windows for one league.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeagueSchedule {
    pub league: League,
    pub team_count: u32,
    pub regular_games_per_team: u32,
    #[serde(default)]
    pub regular_games_per_team_overrides: BTreeMap<i32, u32>,
    pub playoff_games: u32,
    #[serde(default)]
    pub playoff_games_overrides: BTreeMap<i32, u32>,
    /// Months of the season's first calendar year.
    pub preseason_months: Vec<u32>,
    /// Months of the season's first calendar year.
    pub regular_months: Vec<u32>,
    /// Months of the season's second calendar year.
    pub playoff_months: Vec<u32>,
    /// Last date (inclusive) of each season's regular schedule when it
    /// spills into January. Reviewed per season; never inferred.
    #[serde(default)]
    pub regular_tail_cutoff: BTreeMap<i32, NaiveDate>,
    /// Fixed offset used to turn UTC kickoffs into the venue calendar day.
    pub local_utc_offset_hours: i32,
    pub first_season: i32,
    pub last_season: i32,
    #[serde(default)]
    pub cancelled_fixtures: Vec<CancelledFixture>,
}

/// A scheduled regular-season game that was never played.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledFixture {
    pub season: i32,
    pub date: NaiveDate,
    pub home_team_uid: String,
    pub away_team_uid: String,
}

impl LeagueSchedule {
    pub fn nfl() -> Self {
        let mut regular_games_per_team_overrides = BTreeMap::new();
        let mut playoff_games_overrides = BTreeMap::new();
        for season in 2002..=2020 {
            regular_games_per_team_overrides.insert(season, 16);
        }
        for season in 2002..=2019 {
            playoff_games_overrides.insert(season, 11);
        }

        let mut regular_tail_cutoff = BTreeMap::new();
        for (season, (y, m, d)) in [
            (2016, (2017, 1, 1)),
            (2017, (2017, 12, 31)),
            (2018, (2018, 12, 30)),
            (2019, (2019, 12, 29)),
            (2020, (2021, 1, 3)),
            (2021, (2022, 1, 9)),
            (2022, (2023, 1, 8)),
            (2023, (2024, 1, 7)),
            (2024, (2025, 1, 5)),
            (2025, (2026, 1, 4)),
        ] {
            if let Some(date) = NaiveDate::from_ymd_opt(y, m, d) {
                regular_tail_cutoff.insert(season, date);
            }
        }

        Self {
            league: League::Nfl,
            team_count: 32,
            regular_games_per_team: 17,
            regular_games_per_team_overrides,
            playoff_games: 13,
            playoff_games_overrides,
            preseason_months: vec![7, 8],
            regular_months: vec![9, 10, 11, 12],
            playoff_months: vec![1, 2],
            regular_tail_cutoff,
            local_utc_offset_hours: -5,
            first_season: 2020,
            last_season: 2025,
            cancelled_fixtures: NaiveDate::from_ymd_opt(2023, 1, 2)
                .map(|date| CancelledFixture {
                    season: 2022,
                    date,
                    home_team_uid: "NFL_134923".to_string(),
                    away_team_uid: "NFL_134918".to_string(),
                })
                .into_iter()
                .collect(),
        }
    }

    pub fn games_per_team(&self, season: i32) -> u32 {
        self.regular_games_per_team_overrides
            .get(&season)
            .copied()
            .unwrap_or(self.regular_games_per_team)
    }

    pub fn playoff_games_for(&self, season: i32) -> u32 {
        self.playoff_games_overrides
            .get(&season)
            .copied()
            .unwrap_or(self.playoff_games)
    }

    /// Scheduled games per phase before cancellations. Preseason has no
    /// formula and is never tracked.
    pub fn expected_games(&self, season: i32, phase: GameType) -> Option<u32> {
        match phase {
            GameType::Preseason => None,
            GameType::Regular => Some(self.team_count * self.games_per_team(season) / 2),
            GameType::Playoff => Some(self.playoff_games_for(season)),
        }
    }

    pub fn cutoff_for(&self, season: i32) -> Option<NaiveDate> {
        self.regular_tail_cutoff.get(&season).copied()
    }

    pub fn cancelled_in(&self, season: i32) -> impl Iterator<Item = &CancelledFixture> {
        self.cancelled_fixtures
            .iter()
            .filter(move |f| f.season == season)
    }

    pub fn seasons(&self) -> Vec<i32> {
        (self.first_season..=self.last_season).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.team_count == 0 || self.team_count % 2 != 0 {
            return Err(SyncError::Config(format!(
                "{}: team_count must be even and non-zero",
                self.league
            )));
        }
        if self.first_season > self.last_season {
            return Err(SyncError::Config(format!(
                "{}: first_season after last_season",
                self.league
            )));
        }
        let mut months = self
            .preseason_months
            .iter()
            .chain(&self.regular_months)
            .chain(&self.playoff_months);
        if months.any(|m| !(1..=12).contains(m)) {
            return Err(SyncError::Config(format!(
                "{}: month windows must be 1..=12",
                self.league
            )));
        }
        if self
            .preseason_months
            .iter()
            .any(|m| self.regular_months.contains(m))
        {
            return Err(SyncError::Config(format!(
                "{}: preseason and regular windows overlap",
                self.league
            )));
        }
        for (season, cutoff) in &self.regular_tail_cutoff {
            let year = cutoff.year();
            if year != *season && year != season + 1 {
                return Err(SyncError::Config(format!(
                    "{}: cutoff {cutoff} is outside season {season}",
                    self.league
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceSettings {
    pub source: SourceTag,
    pub enabled: bool,
    pub base_url: String,
    pub min_interval_ms: u64,
    pub max_attempts: u32,
    pub backoff_base_ms: u64,
    /// Cap on consecutive 429 waits; those waits are not attempts.
    pub max_rate_limit_waits: u32,
    pub api_key: Option<String>,
}

impl SourceSettings {
    pub fn defaults(source: SourceTag) -> Self {
        let (base_url, min_interval_ms) = match source {
            SourceTag::TheSportsDb => ("https://www.thesportsdb.com/api/v2/json", 1_000),
            SourceTag::Espn => (
                "https://site.api.espn.com/apis/site/v2/sports/football/nfl",
                500,
            ),
            SourceTag::ProFootballReference => ("https://www.pro-football-reference.com", 3_000),
        };
        Self {
            source,
            enabled: true,
            base_url: base_url.to_string(),
            min_interval_ms,
            max_attempts: 4,
            backoff_base_ms: 500,
            max_rate_limit_waits: 5,
            api_key: None,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    pub leagues: Vec<LeagueSchedule>,
    pub sources: Vec<SourceSettings>,
    pub fetch_parallelism: usize,
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub db_path: Option<PathBuf>,
    #[serde(default = "default_true")]
    pub fetch_box_scores: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            leagues: vec![LeagueSchedule::nfl()],
            sources: SourceTag::ALL.into_iter().map(SourceSettings::defaults).collect(),
            fetch_parallelism: 6,
            request_timeout_secs: 10,
            db_path: None,
            fetch_box_scores: true,
        }
    }
}

impl SyncConfig {
    /// Defaults, then the optional JSON file named by `GRIDIRON_CONFIG`, then
    /// environment overrides.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::from_filename(".env.local");
        let _ = dotenvy::from_filename(".env");

        let mut config = match env::var("GRIDIRON_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(path.trim()))?,
            _ => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| SyncError::Config(format!("read {}: {e}", path.display())))?;
        let config = serde_json::from_str::<SyncConfig>(&raw)?;
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(n) = env::var("FETCH_PARALLELISM")
            .ok()
            .and_then(|val| val.parse::<usize>().ok())
        {
            self.fetch_parallelism = n;
        }
        self.fetch_parallelism = self.fetch_parallelism.clamp(2, 32);

        if let Ok(key) = env::var("THESPORTSDB_API_KEY")
            && !key.trim().is_empty()
            && let Some(src) = self
                .sources
                .iter_mut()
                .find(|s| s.source == SourceTag::TheSportsDb)
        {
            src.api_key = Some(key.trim().to_string());
        }

        if let Ok(path) = env::var("GRIDIRON_DB")
            && !path.trim().is_empty()
        {
            self.db_path = Some(PathBuf::from(path.trim()));
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.leagues.is_empty() {
            return Err(SyncError::Config("no leagues configured".to_string()));
        }
        for league in &self.leagues {
            league.validate()?;
        }
        if !self.sources.iter().any(|s| s.source.is_primary() && s.enabled) {
            return Err(SyncError::Config(
                "the primary schedule source must be enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn schedule(&self, league: League) -> Result<&LeagueSchedule> {
        self.leagues
            .iter()
            .find(|l| l.league == league)
            .ok_or_else(|| SyncError::Config(format!("no schedule configured for {league}")))
    }

    pub fn source(&self, tag: SourceTag) -> SourceSettings {
        self.sources
            .iter()
            .find(|s| s.source == tag)
            .cloned()
            .unwrap_or_else(|| SourceSettings::defaults(tag))
    }

    pub fn resolved_db_path(&self) -> Option<PathBuf> {
        self.db_path
            .clone()
            .or_else(|| app_cache_dir().map(|dir| dir.join(DB_FILE)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nfl_formula_matches_modern_schedule() {
        let nfl = LeagueSchedule::nfl();
        assert_eq!(nfl.expected_games(2023, GameType::Regular), Some(272));
        assert_eq!(nfl.expected_games(2019, GameType::Regular), Some(256));
        assert_eq!(nfl.expected_games(2023, GameType::Playoff), Some(13));
        assert_eq!(nfl.expected_games(2019, GameType::Playoff), Some(11));
        assert_eq!(nfl.expected_games(2023, GameType::Preseason), None);
    }

    #[test]
    fn default_config_validates() {
        SyncConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn cutoff_outside_season_is_rejected() {
        let mut nfl = LeagueSchedule::nfl();
        nfl.regular_tail_cutoff
            .insert(2022, NaiveDate::from_ymd_opt(2030, 1, 1).expect("date"));
        assert!(nfl.validate().is_err());
    }

    #[test]
    fn config_round_trips_through_json_file_format() {
        let raw = serde_json::to_string(&SyncConfig::default()).expect("serialize");
        let back: SyncConfig = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(back.leagues[0].cutoff_for(2022), LeagueSchedule::nfl().cutoff_for(2022));
    }
}
