use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::classifier::{classify, normalize_week};
use crate::config::{CancelledFixture, LeagueSchedule};
use crate::error::{Result, SyncError};
use crate::identity::{IdentityResolver, derived_game_uid, game_uid};
use crate::model::{
    CompositeKey, Game, GameType, League, RawBoxScore, RawGameRecord, SourceRecord, SourceTag,
    TeamGameStat, UidOrigin,
};

/// A raw record after classification and identity resolution.
#[derive(Debug, Clone)]
pub struct ResolvedRecord {
    pub raw: RawGameRecord,
    pub game_type: GameType,
    pub home_team_uid: String,
    pub away_team_uid: String,
    pub missing_cutoff: bool,
    /// Box scores whose team resolved, keyed by canonical team uid.
    pub box_scores: Vec<(String, RawBoxScore)>,
}

impl ResolvedRecord {
    pub fn cluster_key(&self) -> CompositeKey {
        CompositeKey {
            season: self.raw.season,
            home_team_uid: self.home_team_uid.clone(),
            away_team_uid: self.away_team_uid.clone(),
            date: self.raw.local_date,
        }
    }

    /// Turns the record around so the listed away side becomes home.
    fn swap_sides(&mut self) {
        std::mem::swap(&mut self.home_team_uid, &mut self.away_team_uid);
        let raw = &mut self.raw;
        std::mem::swap(&mut raw.home_ref, &mut raw.away_ref);
        std::mem::swap(&mut raw.home_score, &mut raw.away_score);
        for b in &mut raw.box_scores {
            b.is_home = !b.is_home;
        }
        for (_, b) in &mut self.box_scores {
            b.is_home = !b.is_home;
        }
    }

    fn order_key(&self) -> (u8, String, String) {
        (
            self.raw.source.priority(),
            self.raw.native_id.clone().unwrap_or_default(),
            self.raw.payload.to_string(),
        )
    }
}

pub fn resolve_record(
    resolver: &IdentityResolver,
    schedule: &LeagueSchedule,
    raw: RawGameRecord,
) -> Result<ResolvedRecord> {
    let (home, away) = resolver.resolve_pair(raw.source, &raw.home_ref, &raw.away_ref)?;
    if home == away {
        return Err(SyncError::MalformedRecord {
            source_tag: raw.source,
            message: format!("{}: team plays itself", raw.describe()),
        });
    }
    let class = classify(schedule, raw.declared_type, raw.local_date, raw.season);

    let mut box_scores = Vec::with_capacity(raw.box_scores.len());
    for b in &raw.box_scores {
        match resolver.resolve(raw.source, &b.team_ref) {
            Ok(uid) => box_scores.push((uid, b.clone())),
            Err(err) => debug!(record = %raw.describe(), error = %err, "box score team unresolved"),
        }
    }

    Ok(ResolvedRecord {
        game_type: class.game_type,
        missing_cutoff: class.missing_cutoff,
        home_team_uid: home,
        away_team_uid: away,
        box_scores,
        raw,
    })
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeConflict {
    pub game_uid: String,
    pub field: &'static str,
    pub kept: String,
    pub kept_source: SourceTag,
    pub discarded: String,
    pub discarded_source: SourceTag,
}

impl MergeConflict {
    pub fn to_error(&self) -> SyncError {
        SyncError::ConflictingAuthoritativeFields {
            game_uid: self.game_uid.clone(),
            field: self.field,
            kept: format!("{} ({})", self.kept, self.kept_source),
            discarded: format!("{} ({})", self.discarded, self.discarded_source),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MergedGame {
    pub game: Game,
    pub stats: Vec<TeamGameStat>,
    pub provenance: Vec<SourceRecord>,
    pub conflicts: Vec<MergeConflict>,
    pub sources: Vec<SourceTag>,
    pub missing_cutoff: bool,
}

/// First non-null value in priority order, remembering who supplied it.
struct Pick<T> {
    field: &'static str,
    value: Option<(T, SourceTag)>,
}

impl<T: Clone + PartialEq + ToString> Pick<T> {
    fn new(field: &'static str) -> Self {
        Self { field, value: None }
    }

    fn offer(&mut self, candidate: Option<T>, source: SourceTag) -> Option<(T, SourceTag, T)> {
        let candidate = candidate?;
        match &self.value {
            None => {
                self.value = Some((candidate, source));
                None
            }
            Some((kept, kept_source)) if *kept != candidate => {
                Some((kept.clone(), *kept_source, candidate))
            }
            Some(_) => None,
        }
    }

    fn get(&self) -> Option<T> {
        self.value.as_ref().map(|(v, _)| v.clone())
    }

    fn provenance(&self, game_uid: &str, out: &mut Vec<SourceRecord>) {
        if let Some((_, source)) = &self.value {
            out.push(SourceRecord {
                game_uid: game_uid.to_string(),
                field: self.field,
                source: *source,
            });
        }
    }
}

/// Clusters records by composite key and merges each cluster. The output is
/// independent of input order.
pub fn merge(league: League, records: Vec<ResolvedRecord>) -> Vec<MergedGame> {
    let (neutral, fixed): (Vec<_>, Vec<_>) = records.into_iter().partition(|r| r.raw.neutral_site);
    let mut clusters: BTreeMap<CompositeKey, Vec<ResolvedRecord>> = BTreeMap::new();
    for rec in fixed {
        clusters.entry(rec.cluster_key()).or_default().push(rec);
    }
    // Neutral-site listings follow whichever orientation the other sources
    // agreed on.
    let oriented: BTreeSet<CompositeKey> = clusters.keys().cloned().collect();
    for mut rec in neutral {
        let key = rec.cluster_key();
        let reversed = CompositeKey {
            home_team_uid: key.away_team_uid.clone(),
            away_team_uid: key.home_team_uid.clone(),
            ..key.clone()
        };
        if !oriented.contains(&key) && oriented.contains(&reversed) {
            debug!(record = %rec.raw.describe(), "neutral-site listing reoriented");
            rec.swap_sides();
        }
        clusters.entry(rec.cluster_key()).or_default().push(rec);
    }
    clusters
        .into_values()
        .map(|mut cluster| {
            cluster.sort_by_cached_key(ResolvedRecord::order_key);
            merge_cluster(league, &cluster)
        })
        .collect()
}

fn merge_cluster(league: League, cluster: &[ResolvedRecord]) -> MergedGame {
    let base = &cluster[0];
    let raw = &base.raw;

    let mut week = Pick::new("week");
    for rec in cluster {
        week.offer(rec.raw.week, rec.raw.source);
    }
    let week_value = normalize_week(base.game_type, week.get());

    let (uid, origin) = game_uid(
        league,
        raw.source,
        raw.native_id.as_deref(),
        raw.season,
        base.game_type,
        week_value,
        raw.local_date,
        &base.home_team_uid,
        &base.away_team_uid,
    );

    let mut kickoff = Pick::new("kickoff_time");
    let mut home_score = Pick::new("home_score");
    let mut away_score = Pick::new("away_score");
    let mut overtime = Pick::new("overtime");
    let mut venue = Pick::new("venue");
    let mut attendance = Pick::new("attendance");
    let mut weather_condition = Pick::new("weather_condition");
    let mut weather_temp = Pick::new("weather_temp");
    let mut conflicts = Vec::new();
    let mut sources = Vec::new();

    for rec in cluster {
        let r = &rec.raw;
        if !sources.contains(&r.source) {
            sources.push(r.source);
        }
        kickoff.offer(r.kickoff_time, r.source);
        for (pick, value) in [(&mut home_score, r.home_score), (&mut away_score, r.away_score)] {
            if let Some((kept, kept_source, discarded)) = pick.offer(value, r.source) {
                conflicts.push(MergeConflict {
                    game_uid: uid.clone(),
                    field: pick.field,
                    kept: kept.to_string(),
                    kept_source,
                    discarded: discarded.to_string(),
                    discarded_source: r.source,
                });
            }
        }
        overtime.offer(r.overtime, r.source);
        venue.offer(r.venue.clone(), r.source);
        attendance.offer(r.attendance, r.source);
        weather_condition.offer(r.weather_condition.clone(), r.source);
        weather_temp.offer(r.weather_temp, r.source);
    }
    for c in &conflicts {
        warn!(game_uid = %c.game_uid, field = c.field, error = %c.to_error(), "source disagreement; primary kept");
    }

    let cancelled = cluster.iter().any(|r| r.raw.cancelled);
    let game = Game {
        game_uid: uid.clone(),
        league,
        season: raw.season,
        week: week_value,
        game_type: base.game_type,
        game_date: raw.local_date,
        kickoff_time: kickoff.get(),
        home_team_uid: base.home_team_uid.clone(),
        away_team_uid: base.away_team_uid.clone(),
        home_score: if cancelled { None } else { home_score.get() },
        away_score: if cancelled { None } else { away_score.get() },
        overtime: overtime.get().unwrap_or(false),
        venue: venue.get(),
        attendance: attendance.get(),
        weather_condition: weather_condition.get(),
        weather_temp: weather_temp.get(),
        source: raw.source,
        cancelled,
        uid_origin: origin,
    };

    let mut provenance = Vec::new();
    if week_value.is_some() {
        week.provenance(&uid, &mut provenance);
    }
    kickoff.provenance(&uid, &mut provenance);
    home_score.provenance(&uid, &mut provenance);
    away_score.provenance(&uid, &mut provenance);
    overtime.provenance(&uid, &mut provenance);
    venue.provenance(&uid, &mut provenance);
    attendance.provenance(&uid, &mut provenance);
    weather_condition.provenance(&uid, &mut provenance);
    weather_temp.provenance(&uid, &mut provenance);

    MergedGame {
        stats: merge_stats(&game, cluster),
        game,
        provenance,
        conflicts,
        sources,
        missing_cutoff: cluster.iter().any(|r| r.missing_cutoff),
    }
}

fn merge_stats(game: &Game, cluster: &[ResolvedRecord]) -> Vec<TeamGameStat> {
    let mut by_team: BTreeMap<String, TeamGameStat> = BTreeMap::new();
    for rec in cluster {
        for (team_uid, b) in &rec.box_scores {
            if !game.involves(team_uid) {
                debug!(game_uid = %game.game_uid, team = %team_uid, "dropping box score for non-participant");
                continue;
            }
            let stat = by_team.entry(team_uid.clone()).or_insert_with(|| TeamGameStat {
                stat_uid: TeamGameStat::stat_uid_for(&game.game_uid, team_uid),
                game_uid: game.game_uid.clone(),
                team_uid: team_uid.clone(),
                is_home: *team_uid == game.home_team_uid,
                total_yards: None,
                passing_yards: None,
                rushing_yards: None,
                first_downs: None,
                turnovers: None,
                penalties: None,
                raw_payload: Value::Object(Default::default()),
                source: rec.raw.source,
            });
            stat.total_yards = stat.total_yards.or(b.total_yards);
            stat.passing_yards = stat.passing_yards.or(b.passing_yards);
            stat.rushing_yards = stat.rushing_yards.or(b.rushing_yards);
            stat.first_downs = stat.first_downs.or(b.first_downs);
            stat.turnovers = stat.turnovers.or(b.turnovers);
            stat.penalties = stat.penalties.or(b.penalties);
            if let Value::Object(map) = &mut stat.raw_payload
                && !b.payload.is_null()
            {
                map.entry(rec.raw.source.as_str())
                    .or_insert_with(|| b.payload.clone());
            }
        }
    }
    by_team.into_values().collect()
}

/// Marks configured never-played fixtures, creating the row when no source
/// listed the game.
pub fn apply_cancelled_fixtures<'a>(
    league: League,
    fixtures: impl IntoIterator<Item = &'a CancelledFixture>,
    merged: &mut Vec<MergedGame>,
) {
    for fixture in fixtures {
        let existing = merged.iter_mut().find(|m| {
            m.game.home_team_uid == fixture.home_team_uid
                && m.game.away_team_uid == fixture.away_team_uid
                && m.game.game_date == fixture.date
        });
        match existing {
            Some(m) => {
                m.game.cancelled = true;
                m.game.game_type = GameType::Regular;
                m.game.home_score = None;
                m.game.away_score = None;
            }
            None => {
                let slot = fixture.date.format("%Y-%m-%d").to_string();
                let uid = derived_game_uid(
                    league,
                    fixture.season,
                    &slot,
                    &fixture.home_team_uid,
                    &fixture.away_team_uid,
                );
                merged.push(MergedGame {
                    game: Game {
                        game_uid: uid,
                        league,
                        season: fixture.season,
                        week: None,
                        game_type: GameType::Regular,
                        game_date: fixture.date,
                        kickoff_time: None,
                        home_team_uid: fixture.home_team_uid.clone(),
                        away_team_uid: fixture.away_team_uid.clone(),
                        home_score: None,
                        away_score: None,
                        overtime: false,
                        venue: None,
                        attendance: None,
                        weather_condition: None,
                        weather_temp: None,
                        source: SourceTag::TheSportsDb,
                        cancelled: true,
                        uid_origin: UidOrigin::Derived,
                    },
                    stats: Vec::new(),
                    provenance: Vec::new(),
                    conflicts: Vec::new(),
                    sources: Vec::new(),
                    missing_cutoff: false,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn record(source: SourceTag, native: &str, date: NaiveDate) -> ResolvedRecord {
        let mut raw = RawGameRecord::new(source, League::Nfl, 2023, date, "h", "a");
        raw.native_id = Some(native.to_string());
        ResolvedRecord {
            raw,
            game_type: GameType::Regular,
            home_team_uid: "NFL_134944".to_string(),
            away_team_uid: "NFL_134946".to_string(),
            missing_cutoff: false,
            box_scores: Vec::new(),
        }
    }

    #[test]
    fn primary_scores_win_and_secondary_fills_attendance() {
        let date = NaiveDate::from_ymd_opt(2023, 9, 10).expect("date");
        let mut a = record(SourceTag::TheSportsDb, "1850101", date);
        a.raw.home_score = Some(21);
        a.raw.away_score = Some(17);
        let mut b = record(SourceTag::Espn, "401547353", date);
        b.raw.attendance = Some(68_000);
        b.raw.away_score = Some(17);

        let merged = merge(League::Nfl, vec![b, a]);
        assert_eq!(merged.len(), 1);
        let g = &merged[0].game;
        assert_eq!(g.game_uid, "NFL_1850101");
        assert_eq!((g.home_score, g.away_score), (Some(21), Some(17)));
        assert_eq!(g.attendance, Some(68_000));
        assert!(merged[0].conflicts.is_empty());
    }

    #[test]
    fn score_disagreement_is_recorded() {
        let date = NaiveDate::from_ymd_opt(2023, 9, 10).expect("date");
        let mut a = record(SourceTag::TheSportsDb, "1", date);
        a.raw.home_score = Some(21);
        let mut b = record(SourceTag::ProFootballReference, "x", date);
        b.raw.home_score = Some(24);
        let merged = merge(League::Nfl, vec![a, b]);
        assert_eq!(merged[0].game.home_score, Some(21));
        assert_eq!(merged[0].conflicts.len(), 1);
        assert_eq!(merged[0].conflicts[0].discarded, "24");
    }

    #[test]
    fn neutral_site_listing_joins_the_primary_orientation() {
        let date = NaiveDate::from_ymd_opt(2023, 10, 15).expect("date");
        let mut primary = record(SourceTag::TheSportsDb, "1850300", date);
        primary.home_team_uid = "NFL_134945".to_string();
        primary.away_team_uid = "NFL_134922".to_string();
        primary.raw.home_score = Some(16);
        primary.raw.away_score = Some(24);

        // winner listed first, so the designated away side appears as home
        let mut scraped = record(SourceTag::ProFootballReference, "202310150ten", date);
        scraped.raw.neutral_site = true;
        scraped.home_team_uid = "NFL_134922".to_string();
        scraped.away_team_uid = "NFL_134945".to_string();
        scraped.raw.home_score = Some(24);
        scraped.raw.away_score = Some(16);
        scraped.box_scores = vec![(
            "NFL_134922".to_string(),
            RawBoxScore { is_home: true, total_yards: Some(312), ..RawBoxScore::default() },
        )];

        for records in [vec![primary.clone(), scraped.clone()], vec![scraped, primary]] {
            let merged = merge(League::Nfl, records);
            assert_eq!(merged.len(), 1);
            let m = &merged[0];
            assert_eq!(m.game.game_uid, "NFL_1850300");
            assert_eq!(m.game.home_team_uid, "NFL_134945");
            assert_eq!((m.game.home_score, m.game.away_score), (Some(16), Some(24)));
            assert!(m.conflicts.is_empty());
            assert_eq!(m.stats.len(), 1);
            assert!(!m.stats[0].is_home);
            assert_eq!(m.stats[0].total_yards, Some(312));
        }
    }

    #[test]
    fn lone_neutral_site_listing_keeps_its_orientation() {
        let date = NaiveDate::from_ymd_opt(2024, 2, 11).expect("date");
        let mut scraped = record(SourceTag::ProFootballReference, "202402110sfo", date);
        scraped.raw.neutral_site = true;
        let merged = merge(League::Nfl, vec![scraped]);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].game.home_team_uid, "NFL_134944");
    }

    #[test]
    fn non_participant_box_scores_are_dropped() {
        let date = NaiveDate::from_ymd_opt(2023, 9, 10).expect("date");
        let mut b = record(SourceTag::Espn, "401", date);
        b.box_scores = vec![
            ("NFL_134944".to_string(), RawBoxScore { total_yards: Some(300), ..RawBoxScore::default() }),
            ("NFL_134918".to_string(), RawBoxScore { total_yards: Some(1), ..RawBoxScore::default() }),
        ];
        let merged = merge(League::Nfl, vec![b]);
        assert_eq!(merged[0].stats.len(), 1);
        assert!(merged[0].stats[0].is_home);
        assert_eq!(merged[0].game.uid_origin, UidOrigin::Derived);
    }

    #[test]
    fn cancelled_fixture_is_synthesized_when_absent() {
        let fixture = CancelledFixture {
            season: 2022,
            date: NaiveDate::from_ymd_opt(2023, 1, 2).expect("date"),
            home_team_uid: "NFL_134923".to_string(),
            away_team_uid: "NFL_134918".to_string(),
        };
        let mut merged = Vec::new();
        apply_cancelled_fixtures(League::Nfl, [&fixture], &mut merged);
        assert_eq!(merged.len(), 1);
        assert!(merged[0].game.cancelled);
        assert_eq!(merged[0].game.game_type, GameType::Regular);
        assert_eq!(merged[0].game.home_score, None);
    }
}
