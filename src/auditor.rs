use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::classify;
use crate::config::LeagueSchedule;
use crate::model::{Game, GameType, League, Team, TeamGameStat, TeamSeasonStat};
use crate::planner::{PhaseGap, completeness_percent, phase_gaps};

const MAX_COMBINED_SCORE: i32 = 100;
const MAX_ATTENDANCE: i64 = 150_000;
const SAMPLE_LIMIT: usize = 5;

const WEIGHT_COMPLETENESS: f64 = 40.0;
const WEIGHT_DUPLICATES: f64 = 20.0;
const WEIGHT_INTEGRITY: f64 = 20.0;
const WEIGHT_QUALITY: f64 = 20.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Completeness,
    DuplicateGames,
    OrphanRecords,
    NonParticipantStats,
    SeasonRecords,
    DataQuality,
    QuarantinedIdentities,
    MergeConflicts,
    MissingCutoff,
}

impl AuditCategory {
    pub fn remediation(self) -> &'static str {
        match self {
            AuditCategory::Completeness => "re-run collect_season; a partial plan fetches the short phases",
            AuditCategory::DuplicateGames => "check team aliases and kickoff dates for the listed fixtures",
            AuditCategory::OrphanRecords => "re-seed teams, then re-collect the season",
            AuditCategory::NonParticipantStats => "drop the stat rows or fix the box score team mapping",
            AuditCategory::SeasonRecords => "run force_reaudit to recompute season aggregates",
            AuditCategory::DataQuality => "compare the listed games against a second source",
            AuditCategory::QuarantinedIdentities => "add team aliases for the quarantined native ids",
            AuditCategory::MergeConflicts => "review the discarded values; the primary source was kept",
            AuditCategory::MissingCutoff => "configure regular_tail_cutoff for the season, then backfill_classification",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditFinding {
    pub category: AuditCategory,
    pub issues: usize,
    pub remediation: String,
    #[serde(default)]
    pub samples: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub league: League,
    pub season: i32,
    pub generated_at: String,
    pub health_score: f64,
    pub complete: bool,
    pub completeness_percent: f64,
    pub phases: Vec<PhaseGap>,
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    pub fn issues(&self, category: AuditCategory) -> usize {
        self.findings
            .iter()
            .find(|f| f.category == category)
            .map(|f| f.issues)
            .unwrap_or(0)
    }

    /// Category to issue count, skipping clean categories.
    pub fn summary(&self) -> BTreeMap<AuditCategory, usize> {
        self.findings
            .iter()
            .filter(|f| f.issues > 0)
            .map(|f| (f.category, f.issues))
            .collect()
    }
}

/// Everything the auditor looks at for one season.
pub struct AuditInput<'a> {
    pub schedule: &'a LeagueSchedule,
    pub season: i32,
    pub games: &'a [Game],
    pub stats: &'a [TeamGameStat],
    pub teams: &'a [Team],
    pub season_stats: &'a [TeamSeasonStat],
    pub quarantined: usize,
    pub conflicts: usize,
    pub today: NaiveDate,
}

#[derive(Default)]
struct Tally {
    issues: usize,
    samples: Vec<String>,
}

impl Tally {
    fn push(&mut self, sample: impl FnOnce() -> String) {
        self.issues += 1;
        if self.samples.len() < SAMPLE_LIMIT {
            self.samples.push(sample());
        }
    }

    fn finding(self, category: AuditCategory) -> AuditFinding {
        AuditFinding {
            category,
            issues: self.issues,
            remediation: category.remediation().to_string(),
            samples: self.samples,
        }
    }
}

pub fn audit(input: &AuditInput<'_>) -> AuditReport {
    let league = input.schedule.league;
    let games: Vec<&Game> = input
        .games
        .iter()
        .filter(|g| g.league == league && g.season == input.season)
        .collect();

    let mut counts: BTreeMap<GameType, u32> = BTreeMap::new();
    for g in games.iter().filter(|g| !g.cancelled) {
        *counts.entry(g.game_type).or_default() += 1;
    }
    let phases = phase_gaps(input.schedule, input.season, &counts);
    let completeness = completeness_percent(&phases);
    let mut short = Tally::default();
    for gap in phases.iter().filter(|g| g.missing() > 0) {
        short.issues += gap.missing() as usize;
        short.samples.push(format!(
            "{}: {} of {} games",
            gap.phase, gap.actual, gap.expected
        ));
    }

    let duplicates = check_duplicates(&games);
    let (orphans, non_participants) = check_links(&games, input.stats, input.teams);
    let records = check_season_records(&games, input.season_stats, input.teams);
    let quality = check_quality(&games, input.today);

    let mut missing_cutoff = Tally::default();
    if input.schedule.cutoff_for(input.season).is_none() {
        for g in &games {
            if classify(input.schedule, Some(g.game_type), g.game_date, input.season).missing_cutoff {
                missing_cutoff.push(|| format!("{} on {}", g.game_uid, g.game_date));
            }
        }
    }

    let total_games = games.len().max(1) as f64;
    let integrity_issues = orphans.issues + non_participants.issues + records.issues;
    let integrity_rows = (games.len() + input.stats.len() + input.season_stats.len()).max(1) as f64;
    let penalty = |issues: usize, denom: f64| (1.0 - issues as f64 / denom).clamp(0.0, 1.0);
    let health = WEIGHT_COMPLETENESS * completeness / 100.0
        + WEIGHT_DUPLICATES * penalty(duplicates.issues, total_games)
        + WEIGHT_INTEGRITY * penalty(integrity_issues, integrity_rows)
        + WEIGHT_QUALITY * penalty(quality.issues + input.quarantined, total_games);
    let complete = phases.iter().all(|g| g.missing() == 0)
        && duplicates.issues == 0
        && integrity_issues == 0;

    let findings = vec![
        short.finding(AuditCategory::Completeness),
        duplicates.finding(AuditCategory::DuplicateGames),
        orphans.finding(AuditCategory::OrphanRecords),
        non_participants.finding(AuditCategory::NonParticipantStats),
        records.finding(AuditCategory::SeasonRecords),
        quality.finding(AuditCategory::DataQuality),
        Tally {
            issues: input.quarantined,
            samples: Vec::new(),
        }
        .finding(AuditCategory::QuarantinedIdentities),
        Tally {
            issues: input.conflicts,
            samples: Vec::new(),
        }
        .finding(AuditCategory::MergeConflicts),
        missing_cutoff.finding(AuditCategory::MissingCutoff),
    ];

    AuditReport {
        league,
        season: input.season,
        generated_at: Utc::now().to_rfc3339(),
        health_score: (health * 10.0).round() / 10.0,
        complete,
        completeness_percent: (completeness * 10.0).round() / 10.0,
        phases,
        findings,
    }
}

// Exact composite-key repeats, plus the same pairing listed a day apart.
fn check_duplicates(games: &[&Game]) -> Tally {
    let mut tally = Tally::default();
    let mut by_pair: HashMap<(&str, &str), Vec<&Game>> = HashMap::new();
    for g in games.iter().filter(|g| !g.cancelled) {
        // neutral-site listings may swap home and away
        let (home, away) = (g.home_team_uid.as_str(), g.away_team_uid.as_str());
        by_pair
            .entry((home.min(away), home.max(away)))
            .or_default()
            .push(g);
    }
    let mut pairs: Vec<_> = by_pair.into_values().collect();
    pairs.sort_by(|a, b| a[0].game_uid.cmp(&b[0].game_uid));
    for mut list in pairs {
        list.sort_by(|a, b| a.game_date.cmp(&b.game_date).then(a.game_uid.cmp(&b.game_uid)));
        for w in list.windows(2) {
            let days = (w[1].game_date - w[0].game_date).num_days();
            if days <= 1 {
                tally.push(|| format!("{} / {} ({} days apart)", w[0].game_uid, w[1].game_uid, days));
            }
        }
    }
    tally
}

fn check_links(games: &[&Game], stats: &[TeamGameStat], teams: &[Team]) -> (Tally, Tally) {
    let team_ids: HashSet<&str> = teams.iter().map(|t| t.team_uid.as_str()).collect();
    let by_uid: HashMap<&str, &Game> = games.iter().map(|g| (g.game_uid.as_str(), *g)).collect();

    let mut orphans = Tally::default();
    let mut non_participants = Tally::default();
    for g in games {
        for team in [&g.home_team_uid, &g.away_team_uid] {
            if !team_ids.contains(team.as_str()) {
                orphans.push(|| format!("game {} references unknown team {team}", g.game_uid));
            }
        }
    }
    for s in stats {
        match by_uid.get(s.game_uid.as_str()) {
            None => orphans.push(|| format!("stat {} references unknown game {}", s.stat_uid, s.game_uid)),
            Some(g) if !g.involves(&s.team_uid) => {
                non_participants.push(|| format!("{} did not play in {}", s.team_uid, g.game_uid))
            }
            Some(_) => {
                if !team_ids.contains(s.team_uid.as_str()) {
                    orphans.push(|| format!("stat {} references unknown team {}", s.stat_uid, s.team_uid));
                }
            }
        }
    }
    (orphans, non_participants)
}

fn check_season_records(games: &[&Game], season_stats: &[TeamSeasonStat], teams: &[Team]) -> Tally {
    let mut expected: HashMap<&str, (i32, i32, i32)> = HashMap::new();
    for g in games {
        if g.game_type != GameType::Regular || g.cancelled {
            continue;
        }
        let (Some(h), Some(a)) = (g.home_score, g.away_score) else {
            continue;
        };
        for (team, ours, theirs) in [(&g.home_team_uid, h, a), (&g.away_team_uid, a, h)] {
            let rec = expected.entry(team.as_str()).or_default();
            match ours.cmp(&theirs) {
                std::cmp::Ordering::Greater => rec.0 += 1,
                std::cmp::Ordering::Less => rec.1 += 1,
                std::cmp::Ordering::Equal => rec.2 += 1,
            }
        }
    }

    let stored: HashMap<&str, &TeamSeasonStat> = season_stats
        .iter()
        .map(|s| (s.team_uid.as_str(), s))
        .collect();
    let mut tally = Tally::default();
    let mut team_ids: Vec<&str> = teams.iter().map(|t| t.team_uid.as_str()).collect();
    team_ids.sort_unstable();
    for team in team_ids {
        let want = expected.get(team).copied().unwrap_or_default();
        let have = stored
            .get(team)
            .map(|s| (s.wins, s.losses, s.ties))
            .unwrap_or_default();
        if want != have {
            tally.push(|| {
                format!(
                    "{team}: stored {}-{}-{}, games say {}-{}-{}",
                    have.0, have.1, have.2, want.0, want.1, want.2
                )
            });
        }
    }
    tally
}

fn check_quality(games: &[&Game], today: NaiveDate) -> Tally {
    let mut tally = Tally::default();
    for g in games {
        if g.home_team_uid == g.away_team_uid {
            tally.push(|| format!("{}: team plays itself", g.game_uid));
        }
        if g.home_score.is_some_and(|s| s < 0) || g.away_score.is_some_and(|s| s < 0) {
            tally.push(|| format!("{}: negative score", g.game_uid));
        }
        if let (Some(h), Some(a)) = (g.home_score, g.away_score)
            && h + a > MAX_COMBINED_SCORE
        {
            tally.push(|| format!("{}: combined score {}", g.game_uid, h + a));
        }
        if let Some(att) = g.attendance
            && att > MAX_ATTENDANCE
        {
            tally.push(|| format!("{}: attendance {att}", g.game_uid));
        }
        if !g.cancelled && g.game_date < today && !g.has_scores() {
            tally.push(|| format!("{}: played {} but has no score", g.game_uid, g.game_date));
        }
    }
    tally
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SourceTag, UidOrigin};

    fn team(uid: &str) -> Team {
        Team {
            team_uid: uid.to_string(),
            league: League::Nfl,
            city: "City".to_string(),
            name: "Name".to_string(),
            abbreviation: None,
            stadium_name: None,
            stadium_capacity: None,
            latitude: None,
            longitude: None,
            conference: None,
            division: None,
        }
    }

    fn game(uid: &str, date: NaiveDate, home: Option<i32>, away: Option<i32>) -> Game {
        Game {
            game_uid: uid.to_string(),
            league: League::Nfl,
            season: 2023,
            week: Some(1),
            game_type: GameType::Regular,
            game_date: date,
            kickoff_time: None,
            home_team_uid: "NFL_A".to_string(),
            away_team_uid: "NFL_B".to_string(),
            home_score: home,
            away_score: away,
            overtime: false,
            venue: None,
            attendance: None,
            weather_condition: None,
            weather_temp: None,
            source: SourceTag::TheSportsDb,
            cancelled: false,
            uid_origin: UidOrigin::Native,
        }
    }

    fn input<'a>(
        schedule: &'a LeagueSchedule,
        games: &'a [Game],
        stats: &'a [TeamGameStat],
        teams: &'a [Team],
        season_stats: &'a [TeamSeasonStat],
    ) -> AuditInput<'a> {
        AuditInput {
            schedule,
            season: 2023,
            games,
            stats,
            teams,
            season_stats,
            quarantined: 0,
            conflicts: 0,
            today: NaiveDate::from_ymd_opt(2024, 6, 1).expect("date"),
        }
    }

    #[test]
    fn near_duplicate_and_quality_issues_are_counted() {
        let nfl = LeagueSchedule::nfl();
        let d1 = NaiveDate::from_ymd_opt(2023, 9, 10).expect("date");
        let d2 = NaiveDate::from_ymd_opt(2023, 9, 11).expect("date");
        let games = vec![game("NFL_1", d1, Some(70), Some(40)), game("NFL_2", d2, None, None)];
        let teams = vec![team("NFL_A"), team("NFL_B")];
        let report = audit(&input(&nfl, &games, &[], &teams, &[]));

        assert_eq!(report.issues(AuditCategory::DuplicateGames), 1);
        // combined score over 100, plus a past game without a score
        assert_eq!(report.issues(AuditCategory::DataQuality), 2);
        assert!(!report.complete);
        assert!(report.health_score < 100.0);
    }

    #[test]
    fn reversed_pairing_on_the_same_day_is_a_duplicate() {
        let nfl = LeagueSchedule::nfl();
        let d = NaiveDate::from_ymd_opt(2023, 10, 15).expect("date");
        let mut flipped = game("NFL_2", d, Some(24), Some(16));
        flipped.home_team_uid = "NFL_B".to_string();
        flipped.away_team_uid = "NFL_A".to_string();
        let games = vec![game("NFL_1", d, Some(16), Some(24)), flipped];
        let teams = vec![team("NFL_A"), team("NFL_B")];
        let report = audit(&input(&nfl, &games, &[], &teams, &[]));
        assert_eq!(report.issues(AuditCategory::DuplicateGames), 1);
        assert!(!report.complete);
    }

    #[test]
    fn orphan_and_non_participant_stats_are_flagged() {
        let nfl = LeagueSchedule::nfl();
        let d = NaiveDate::from_ymd_opt(2023, 9, 10).expect("date");
        let games = vec![game("NFL_1", d, Some(21), Some(17))];
        let teams = vec![team("NFL_A"), team("NFL_B"), team("NFL_C")];
        let stat = |game_uid: &str, team_uid: &str| TeamGameStat {
            stat_uid: TeamGameStat::stat_uid_for(game_uid, team_uid),
            game_uid: game_uid.to_string(),
            team_uid: team_uid.to_string(),
            is_home: false,
            total_yards: None,
            passing_yards: None,
            rushing_yards: None,
            first_downs: None,
            turnovers: None,
            penalties: None,
            raw_payload: serde_json::Value::Null,
            source: SourceTag::Espn,
        };
        let stats = vec![stat("NFL_404", "NFL_A"), stat("NFL_1", "NFL_C")];
        let report = audit(&input(&nfl, &games, &stats, &teams, &[]));
        assert_eq!(report.issues(AuditCategory::OrphanRecords), 1);
        assert_eq!(report.issues(AuditCategory::NonParticipantStats), 1);
        // no season rows stored for the two teams that played
        assert_eq!(report.issues(AuditCategory::SeasonRecords), 2);
    }

    #[test]
    fn january_game_without_cutoff_is_flagged() {
        let mut nfl = LeagueSchedule::nfl();
        nfl.regular_tail_cutoff.remove(&2023);
        let d = NaiveDate::from_ymd_opt(2024, 1, 7).expect("date");
        let games = vec![game("NFL_1", d, Some(10), Some(3))];
        let report = audit(&input(&nfl, &games, &[], &[team("NFL_A"), team("NFL_B")], &[]));
        assert_eq!(report.issues(AuditCategory::MissingCutoff), 1);
    }
}
