use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::auditor::AuditReport;
use crate::classifier::{classify, normalize_week};
use crate::config::LeagueSchedule;
use crate::error::{Result, SyncError};
use crate::identity::TeamAlias;
use crate::merger::{MergeConflict, MergedGame};
use crate::model::{
    Game, GameType, League, SeasonState, SourceRecord, SourceTag, Team, TeamGameStat,
    TeamSeasonStat, UidOrigin,
};

const DATE_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

const GAME_COLUMNS: &str = "game_uid, league, season, week, game_type, game_date, kickoff_time, \
    home_team_uid, away_team_uid, home_score, away_score, overtime, venue, attendance, \
    weather_condition, weather_temp, source, cancelled, uid_origin";

// Once stored, only an equal or higher-priority source may replace these.
const AUTHORITATIVE_FIELDS: [&str; 4] = ["home_score", "away_score", "kickoff_time", "week"];

const STAT_COLUMNS: &str = "stat_uid, game_uid, team_uid, is_home, total_yards, passing_yards, \
    rushing_yards, first_downs, turnovers, penalties, raw_payload, source";

/// Outcome of writing one game row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameWrite {
    /// The uid the row is stored under; differs from the input when an
    /// existing row for the same fixture was adopted.
    pub game_uid: String,
    pub rekeyed_from: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ApplySummary {
    pub games_upserted: usize,
    pub stats_upserted: usize,
    pub rekeyed: usize,
    pub conflicts: usize,
    pub rejected: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RunOutcome {
    pub status: String,
    pub games_upserted: usize,
    pub stats_upserted: usize,
    pub quarantined: usize,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct QuarantinedRecord {
    pub source: SourceTag,
    pub native_ref: String,
    pub reason: String,
}

/// Single-writer SQLite store. Every write goes through the one connection.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        init_schema(&conn)?;
        info!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| SyncError::Config("store connection lock poisoned".to_string()))
    }

    pub fn upsert_team(&self, team: &Team) -> Result<()> {
        let conn = self.lock()?;
        write_team(&conn, team)
    }

    pub fn upsert_game(&self, game: &Game) -> Result<GameWrite> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let write = write_game(&tx, game)?;
        tx.commit()?;
        Ok(write)
    }

    pub fn upsert_team_game_stat(&self, stat: &TeamGameStat) -> Result<()> {
        let conn = self.lock()?;
        write_stat(&conn, stat)
    }

    /// Writes merged games, their stats, provenance and conflicts in one
    /// transaction. Record-level integrity failures are collected, not fatal.
    pub fn apply_merged(&self, league: League, season: i32, merged: &[MergedGame]) -> Result<ApplySummary> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut summary = ApplySummary::default();

        for m in merged {
            let (game, provenance) = guard_authoritative(&tx, m)?;
            let write = match write_game(&tx, &game) {
                Ok(w) => w,
                Err(err) if err.is_record_local() => {
                    warn!(game_uid = %m.game.game_uid, error = %err, "game rejected");
                    summary.rejected.push(err.to_string());
                    continue;
                }
                Err(err) => return Err(err),
            };
            summary.games_upserted += 1;
            if write.rekeyed_from.is_some() {
                summary.rekeyed += 1;
            }

            for stat in &m.stats {
                let mut stat = stat.clone();
                if stat.game_uid != write.game_uid {
                    stat.stat_uid = TeamGameStat::stat_uid_for(&write.game_uid, &stat.team_uid);
                    stat.game_uid = write.game_uid.clone();
                }
                match write_stat(&tx, &stat) {
                    Ok(()) => summary.stats_upserted += 1,
                    Err(err) if err.is_record_local() => {
                        warn!(stat_uid = %stat.stat_uid, error = %err, "stat rejected");
                        summary.rejected.push(err.to_string());
                    }
                    Err(err) => return Err(err),
                }
            }
            for p in &provenance {
                write_provenance(&tx, &write.game_uid, p)?;
            }
            for c in &m.conflicts {
                summary.conflicts += write_conflict(&tx, league, season, &write.game_uid, c)?;
            }
        }
        tx.commit()?;
        debug!(%league, season, games = summary.games_upserted, stats = summary.stats_upserted, "merged games applied");
        Ok(summary)
    }

    pub fn recompute_season_stats(&self, team_uid: &str, season: i32) -> Result<TeamSeasonStat> {
        let conn = self.lock()?;
        recompute_team_season(&conn, team_uid, season)
    }

    pub fn recompute_league_season(&self, league: League, season: i32) -> Result<Vec<TeamSeasonStat>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let team_uids = {
            let mut stmt = tx.prepare("SELECT team_uid FROM teams WHERE league = ?1 ORDER BY team_uid")?;
            let rows = stmt.query_map(params![league.as_str()], |r| r.get::<_, String>(0))?;
            rows.collect::<rusqlite::Result<Vec<_>>>()?
        };
        let mut out = Vec::with_capacity(team_uids.len());
        for uid in &team_uids {
            out.push(recompute_team_season(&tx, uid, season)?);
        }
        tx.commit()?;
        Ok(out)
    }

    /// Non-cancelled games per phase.
    pub fn count_by_phase(&self, league: League, season: i32) -> Result<BTreeMap<GameType, u32>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT game_type, COUNT(*) FROM games
             WHERE league = ?1 AND season = ?2 AND cancelled = 0
             GROUP BY game_type",
        )?;
        let rows = stmt.query_map(params![league.as_str(), season], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?))
        })?;
        let mut out = BTreeMap::new();
        for row in rows {
            let (kind, n) = row?;
            if let Ok(kind) = kind.parse::<GameType>() {
                out.insert(kind, u32::try_from(n).unwrap_or(u32::MAX));
            }
        }
        Ok(out)
    }

    /// Re-applies the classifier to stored games. Returns how many changed.
    pub fn reclassify_season(&self, schedule: &LeagueSchedule, season: i32) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let games = query_games(
            &tx,
            "WHERE league = ?1 AND season = ?2",
            params![schedule.league.as_str(), season],
        )?;
        let mut changed = 0;
        for g in games {
            let class = classify(schedule, Some(g.game_type), g.game_date, g.season);
            let week = normalize_week(class.game_type, g.week);
            if class.game_type == g.game_type && week == g.week {
                continue;
            }
            tx.execute(
                "UPDATE games SET game_type = ?2, week = ?3, updated_at = ?4 WHERE game_uid = ?1",
                params![g.game_uid, class.game_type.as_str(), week, now()],
            )?;
            debug!(game_uid = %g.game_uid, from = %g.game_type, to = %class.game_type, "reclassified");
            changed += 1;
        }
        tx.commit()?;
        Ok(changed)
    }

    pub fn season_state(&self, league: League, season: i32) -> Result<SeasonState> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT state FROM season_sync_state WHERE league = ?1 AND season = ?2",
                params![league.as_str(), season],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        Ok(raw
            .and_then(|s| s.parse::<SeasonState>().ok())
            .unwrap_or(SeasonState::NotStarted))
    }

    pub fn set_season_state(&self, league: League, season: i32, state: SeasonState) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO season_sync_state (league, season, state, updated_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(league, season) DO UPDATE SET
               state = excluded.state,
               updated_at = excluded.updated_at",
            params![league.as_str(), season, state.as_str(), now()],
        )?;
        Ok(())
    }

    /// Persists an alias. Re-pointing an existing alias is refused.
    pub fn insert_alias(&self, alias: &TeamAlias) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO team_aliases (source_name, source_native_id, canonical_team_uid, created_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(source_name, source_native_id) DO NOTHING",
            params![alias.source.as_str(), alias.native_id, alias.team_uid, now()],
        )?;
        let stored: String = conn.query_row(
            "SELECT canonical_team_uid FROM team_aliases WHERE source_name = ?1 AND source_native_id = ?2",
            params![alias.source.as_str(), alias.native_id],
            |r| r.get(0),
        )?;
        if stored != alias.team_uid {
            return Err(SyncError::AliasReassignment {
                source_tag: alias.source,
                native_id: alias.native_id.clone(),
                existing: stored,
            });
        }
        Ok(())
    }

    pub fn load_aliases(&self) -> Result<Vec<TeamAlias>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source_name, source_native_id, canonical_team_uid FROM team_aliases
             ORDER BY source_name, source_native_id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok(TeamAlias {
                source: parse_col(r, 0)?,
                native_id: r.get(1)?,
                team_uid: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn quarantine(
        &self,
        league: League,
        season: i32,
        source: SourceTag,
        native_ref: &str,
        reason: &str,
        payload: &Value,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "INSERT INTO quarantined_records (league, season, source, native_ref, reason, payload, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(league, season, source, native_ref, reason) DO NOTHING",
            params![
                league.as_str(),
                season,
                source.as_str(),
                native_ref,
                reason,
                payload.to_string(),
                now()
            ],
        )?;
        Ok(n > 0)
    }

    pub fn quarantined(&self, league: League, season: i32) -> Result<Vec<QuarantinedRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT source, native_ref, reason FROM quarantined_records
             WHERE league = ?1 AND season = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![league.as_str(), season], |r| {
            Ok(QuarantinedRecord {
                source: parse_col(r, 0)?,
                native_ref: r.get(1)?,
                reason: r.get(2)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn conflicts(&self, league: League, season: i32) -> Result<Vec<MergeConflict>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT game_uid, field, kept, kept_source, discarded, discarded_source
             FROM merge_conflicts WHERE league = ?1 AND season = ?2 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![league.as_str(), season], |r| {
            let field: String = r.get(1)?;
            Ok(MergeConflict {
                game_uid: r.get(0)?,
                field: conflict_field(&field),
                kept: r.get(2)?,
                kept_source: parse_col(r, 3)?,
                discarded: r.get(4)?,
                discarded_source: parse_col(r, 5)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn provenance(&self, game_uid: &str) -> Result<Vec<(String, SourceTag)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT field, source FROM field_provenance WHERE game_uid = ?1 ORDER BY field",
        )?;
        let rows = stmt.query_map(params![game_uid], |r| Ok((r.get(0)?, parse_col(r, 1)?)))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn save_audit_report(&self, report: &AuditReport) -> Result<()> {
        let json = serde_json::to_string(report)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO audit_reports (league, season, health_score, complete, report_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                report.league.as_str(),
                report.season,
                report.health_score,
                bool_to_i64(report.complete),
                json,
                report.generated_at
            ],
        )?;
        Ok(())
    }

    pub fn latest_audit_report(&self, league: League, season: i32) -> Result<Option<AuditReport>> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT report_json FROM audit_reports
                 WHERE league = ?1 AND season = ?2 ORDER BY id DESC LIMIT 1",
                params![league.as_str(), season],
                |r| r.get::<_, String>(0),
            )
            .optional()?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    pub fn begin_run(&self, league: League, season: i32, plan: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (started_at, league, season, plan, status, games_upserted, stats_upserted, quarantined, errors_json)
             VALUES (?1, ?2, ?3, ?4, 'running', 0, 0, 0, '[]')",
            params![now(), league.as_str(), season, plan],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, outcome: &RunOutcome) -> Result<()> {
        let errors_json = serde_json::to_string(&outcome.errors)?;
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET finished_at = ?2, status = ?3, games_upserted = ?4,
               stats_upserted = ?5, quarantined = ?6, errors_json = ?7
             WHERE run_id = ?1",
            params![
                run_id,
                now(),
                outcome.status,
                outcome.games_upserted as i64,
                outcome.stats_upserted as i64,
                outcome.quarantined as i64,
                errors_json
            ],
        )?;
        Ok(())
    }

    pub fn run_statuses(&self, league: League, season: i32) -> Result<Vec<String>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT status FROM sync_runs WHERE league = ?1 AND season = ?2 ORDER BY run_id",
        )?;
        let rows = stmt.query_map(params![league.as_str(), season], |r| r.get::<_, String>(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn teams(&self, league: League) -> Result<Vec<Team>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT team_uid, league, city, name, abbreviation, stadium_name, stadium_capacity,
                    latitude, longitude, conference, division
             FROM teams WHERE league = ?1 ORDER BY team_uid",
        )?;
        let rows = stmt.query_map(params![league.as_str()], row_to_team)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn team(&self, team_uid: &str) -> Result<Option<Team>> {
        let conn = self.lock()?;
        Ok(conn
            .query_row(
                "SELECT team_uid, league, city, name, abbreviation, stadium_name, stadium_capacity,
                        latitude, longitude, conference, division
                 FROM teams WHERE team_uid = ?1",
                params![team_uid],
                row_to_team,
            )
            .optional()?)
    }

    pub fn game(&self, game_uid: &str) -> Result<Option<Game>> {
        let conn = self.lock()?;
        let mut games = query_games(&conn, "WHERE game_uid = ?1", params![game_uid])?;
        Ok(games.pop())
    }

    pub fn games_for_season(&self, league: League, season: i32) -> Result<Vec<Game>> {
        let conn = self.lock()?;
        query_games(
            &conn,
            "WHERE league = ?1 AND season = ?2",
            params![league.as_str(), season],
        )
    }

    pub fn games_for_team(&self, team_uid: &str, season: i32) -> Result<Vec<Game>> {
        let conn = self.lock()?;
        query_games(
            &conn,
            "WHERE season = ?2 AND (home_team_uid = ?1 OR away_team_uid = ?1)",
            params![team_uid, season],
        )
    }

    pub fn stats_for_game(&self, game_uid: &str) -> Result<Vec<TeamGameStat>> {
        let conn = self.lock()?;
        query_stats(&conn, "WHERE game_uid = ?1", params![game_uid])
    }

    /// Every stat row whose game belongs to the season, plus stats that
    /// reference no stored game at all.
    pub fn stats_for_season(&self, league: League, season: i32) -> Result<Vec<TeamGameStat>> {
        let conn = self.lock()?;
        query_stats(
            &conn,
            "WHERE game_uid IN (SELECT game_uid FROM games WHERE league = ?1 AND season = ?2)
                OR game_uid NOT IN (SELECT game_uid FROM games)",
            params![league.as_str(), season],
        )
    }

    pub fn team_season_stats(&self, season: i32) -> Result<Vec<TeamSeasonStat>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT season_stat_uid, team_uid, season, wins, losses, ties, win_percentage,
                    points_for_per_game, points_against_per_game, total_yards_per_game
             FROM team_season_stats WHERE season = ?1 ORDER BY team_uid",
        )?;
        let rows = stmt.query_map(params![season], |r| {
            Ok(TeamSeasonStat {
                season_stat_uid: r.get(0)?,
                team_uid: r.get(1)?,
                season: r.get(2)?,
                wins: r.get(3)?,
                losses: r.get(4)?,
                ties: r.get(5)?,
                win_percentage: r.get(6)?,
                points_for_per_game: r.get(7)?,
                points_against_per_game: r.get(8)?,
                total_yards_per_game: r.get(9)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        CREATE TABLE IF NOT EXISTS teams (
            team_uid TEXT PRIMARY KEY,
            league TEXT NOT NULL,
            city TEXT NOT NULL,
            name TEXT NOT NULL,
            abbreviation TEXT NULL,
            stadium_name TEXT NULL,
            stadium_capacity INTEGER NULL,
            latitude REAL NULL,
            longitude REAL NULL,
            conference TEXT NULL,
            division TEXT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_teams_league ON teams(league);

        CREATE TABLE IF NOT EXISTS games (
            game_uid TEXT PRIMARY KEY,
            league TEXT NOT NULL,
            season INTEGER NOT NULL,
            week INTEGER NULL,
            game_type TEXT NOT NULL,
            game_date TEXT NOT NULL,
            kickoff_time TEXT NULL,
            home_team_uid TEXT NOT NULL,
            away_team_uid TEXT NOT NULL,
            home_score INTEGER NULL,
            away_score INTEGER NULL,
            overtime INTEGER NOT NULL DEFAULT 0,
            venue TEXT NULL,
            attendance INTEGER NULL,
            weather_condition TEXT NULL,
            weather_temp REAL NULL,
            source TEXT NOT NULL,
            cancelled INTEGER NOT NULL DEFAULT 0,
            uid_origin TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE UNIQUE INDEX IF NOT EXISTS idx_games_fixture
            ON games(league, season, home_team_uid, away_team_uid, game_date);
        CREATE INDEX IF NOT EXISTS idx_games_season ON games(league, season, game_type);
        CREATE INDEX IF NOT EXISTS idx_games_home ON games(home_team_uid);
        CREATE INDEX IF NOT EXISTS idx_games_away ON games(away_team_uid);

        CREATE TABLE IF NOT EXISTS team_game_stats (
            stat_uid TEXT PRIMARY KEY,
            game_uid TEXT NOT NULL,
            team_uid TEXT NOT NULL,
            is_home INTEGER NOT NULL,
            total_yards INTEGER NULL,
            passing_yards INTEGER NULL,
            rushing_yards INTEGER NULL,
            first_downs INTEGER NULL,
            turnovers INTEGER NULL,
            penalties INTEGER NULL,
            raw_payload TEXT NOT NULL,
            source TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            UNIQUE (game_uid, team_uid)
        );

        CREATE TABLE IF NOT EXISTS team_season_stats (
            season_stat_uid TEXT PRIMARY KEY,
            team_uid TEXT NOT NULL,
            season INTEGER NOT NULL,
            wins INTEGER NOT NULL,
            losses INTEGER NOT NULL,
            ties INTEGER NOT NULL,
            win_percentage REAL NOT NULL,
            points_for_per_game REAL NULL,
            points_against_per_game REAL NULL,
            total_yards_per_game REAL NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_season_stats_season ON team_season_stats(season);

        CREATE TABLE IF NOT EXISTS team_aliases (
            source_name TEXT NOT NULL,
            source_native_id TEXT NOT NULL,
            canonical_team_uid TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (source_name, source_native_id)
        );

        CREATE TABLE IF NOT EXISTS field_provenance (
            game_uid TEXT NOT NULL,
            field TEXT NOT NULL,
            source TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (game_uid, field)
        );

        CREATE TABLE IF NOT EXISTS merge_conflicts (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            league TEXT NOT NULL,
            season INTEGER NOT NULL,
            game_uid TEXT NOT NULL,
            field TEXT NOT NULL,
            kept TEXT NOT NULL,
            kept_source TEXT NOT NULL,
            discarded TEXT NOT NULL,
            discarded_source TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            UNIQUE (game_uid, field, discarded_source, discarded)
        );

        CREATE TABLE IF NOT EXISTS quarantined_records (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            league TEXT NOT NULL,
            season INTEGER NOT NULL,
            source TEXT NOT NULL,
            native_ref TEXT NOT NULL,
            reason TEXT NOT NULL,
            payload TEXT NOT NULL,
            recorded_at TEXT NOT NULL,
            UNIQUE (league, season, source, native_ref, reason)
        );

        CREATE TABLE IF NOT EXISTS season_sync_state (
            league TEXT NOT NULL,
            season INTEGER NOT NULL,
            state TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (league, season)
        );

        CREATE TABLE IF NOT EXISTS audit_reports (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            league TEXT NOT NULL,
            season INTEGER NOT NULL,
            health_score REAL NOT NULL,
            complete INTEGER NOT NULL,
            report_json TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_runs (
            run_id INTEGER PRIMARY KEY AUTOINCREMENT,
            started_at TEXT NOT NULL,
            finished_at TEXT NULL,
            league TEXT NOT NULL,
            season INTEGER NOT NULL,
            plan TEXT NOT NULL,
            status TEXT NOT NULL,
            games_upserted INTEGER NOT NULL,
            stats_upserted INTEGER NOT NULL,
            quarantined INTEGER NOT NULL,
            errors_json TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn write_team(conn: &Connection, t: &Team) -> Result<()> {
    conn.execute(
        "INSERT INTO teams (team_uid, league, city, name, abbreviation, stadium_name, stadium_capacity,
                            latitude, longitude, conference, division, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
         ON CONFLICT(team_uid) DO UPDATE SET
           city = excluded.city,
           name = excluded.name,
           abbreviation = COALESCE(excluded.abbreviation, teams.abbreviation),
           stadium_name = COALESCE(excluded.stadium_name, teams.stadium_name),
           stadium_capacity = COALESCE(excluded.stadium_capacity, teams.stadium_capacity),
           latitude = COALESCE(excluded.latitude, teams.latitude),
           longitude = COALESCE(excluded.longitude, teams.longitude),
           conference = COALESCE(excluded.conference, teams.conference),
           division = COALESCE(excluded.division, teams.division),
           updated_at = excluded.updated_at",
        params![
            t.team_uid,
            t.league.as_str(),
            t.city,
            t.name,
            t.abbreviation,
            t.stadium_name,
            t.stadium_capacity,
            t.latitude,
            t.longitude,
            t.conference,
            t.division,
            now()
        ],
    )?;
    Ok(())
}

fn team_exists(conn: &Connection, team_uid: &str) -> Result<bool> {
    Ok(conn
        .query_row(
            "SELECT 1 FROM teams WHERE team_uid = ?1",
            params![team_uid],
            |_| Ok(()),
        )
        .optional()?
        .is_some())
}

fn write_game(conn: &Connection, game: &Game) -> Result<GameWrite> {
    if game.home_team_uid == game.away_team_uid {
        return Err(SyncError::integrity("game", &game.game_uid, "team plays itself"));
    }
    for team in [&game.home_team_uid, &game.away_team_uid] {
        if !team_exists(conn, team)? {
            return Err(SyncError::integrity(
                "game",
                &game.game_uid,
                format!("unknown team {team}"),
            ));
        }
    }

    let existing = conn
        .query_row(
            "SELECT game_uid, uid_origin FROM games
             WHERE league = ?1 AND season = ?2 AND home_team_uid = ?3 AND away_team_uid = ?4 AND game_date = ?5",
            params![
                game.league.as_str(),
                game.season,
                game.home_team_uid,
                game.away_team_uid,
                game.game_date.format(DATE_FMT).to_string()
            ],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;

    let mut write = GameWrite {
        game_uid: game.game_uid.clone(),
        rekeyed_from: None,
    };
    if let Some((existing_uid, existing_origin)) = existing
        && existing_uid != game.game_uid
    {
        let existing_native = existing_origin == UidOrigin::Native.as_str();
        if game.uid_origin == UidOrigin::Native && !existing_native {
            rekey_game(conn, &existing_uid, &game.game_uid)?;
            info!(from = %existing_uid, to = %game.game_uid, "derived game uid replaced by native uid");
            write.rekeyed_from = Some(existing_uid);
        } else {
            debug!(incoming = %game.game_uid, stored = %existing_uid, "adopting stored uid for fixture");
            write.game_uid = existing_uid;
        }
    }

    conn.execute(
        &format!(
            "INSERT INTO games ({GAME_COLUMNS}, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)
             ON CONFLICT(game_uid) DO UPDATE SET
               season = excluded.season,
               game_type = excluded.game_type,
               game_date = excluded.game_date,
               week = CASE WHEN excluded.game_type = 'playoff' THEN NULL
                           ELSE COALESCE(excluded.week, games.week) END,
               kickoff_time = COALESCE(excluded.kickoff_time, games.kickoff_time),
               cancelled = MAX(excluded.cancelled, games.cancelled),
               home_score = CASE WHEN MAX(excluded.cancelled, games.cancelled) = 1 THEN NULL
                                 ELSE COALESCE(excluded.home_score, games.home_score) END,
               away_score = CASE WHEN MAX(excluded.cancelled, games.cancelled) = 1 THEN NULL
                                 ELSE COALESCE(excluded.away_score, games.away_score) END,
               overtime = MAX(excluded.overtime, games.overtime),
               venue = COALESCE(excluded.venue, games.venue),
               attendance = COALESCE(excluded.attendance, games.attendance),
               weather_condition = COALESCE(excluded.weather_condition, games.weather_condition),
               weather_temp = COALESCE(excluded.weather_temp, games.weather_temp),
               source = CASE WHEN games.source = ?21 THEN games.source ELSE excluded.source END,
               uid_origin = CASE WHEN games.uid_origin = 'native' THEN games.uid_origin ELSE excluded.uid_origin END,
               updated_at = excluded.updated_at"
        ),
        params![
            write.game_uid,
            game.league.as_str(),
            game.season,
            game.week,
            game.game_type.as_str(),
            game.game_date.format(DATE_FMT).to_string(),
            game.kickoff_time.map(|t| t.format(TIME_FMT).to_string()),
            game.home_team_uid,
            game.away_team_uid,
            game.home_score,
            game.away_score,
            bool_to_i64(game.overtime),
            game.venue,
            game.attendance,
            game.weather_condition,
            game.weather_temp,
            game.source.as_str(),
            bool_to_i64(game.cancelled),
            game.uid_origin.as_str(),
            now(),
            SourceTag::TheSportsDb.as_str()
        ],
    )
    .map_err(|e| match e {
        rusqlite::Error::SqliteFailure(f, msg) if f.code == rusqlite::ErrorCode::ConstraintViolation => {
            SyncError::integrity(
                "game",
                &write.game_uid,
                msg.unwrap_or_else(|| "fixture already stored under another uid".to_string()),
            )
        }
        other => SyncError::Storage(other),
    })?;
    Ok(write)
}

/// Stored authoritative values win over a lower-priority source. Returns
/// the game to write and the provenance that still applies to it.
fn guard_authoritative(conn: &Connection, m: &MergedGame) -> Result<(Game, Vec<SourceRecord>)> {
    let mut game = m.game.clone();
    let mut provenance = m.provenance.clone();
    let candidates = query_games(
        conn,
        "WHERE game_uid = ?1
            OR (league = ?2 AND season = ?3 AND home_team_uid = ?4 AND away_team_uid = ?5 AND game_date = ?6)",
        params![
            game.game_uid,
            game.league.as_str(),
            game.season,
            game.home_team_uid,
            game.away_team_uid,
            game.game_date.format(DATE_FMT).to_string()
        ],
    )?;
    let Some(stored) = candidates
        .iter()
        .find(|g| g.game_uid == game.game_uid)
        .or_else(|| candidates.first())
    else {
        return Ok((game, provenance));
    };

    let holders = field_sources(conn, &stored.game_uid)?;
    for field in AUTHORITATIVE_FIELDS {
        let Some(incoming) = provenance.iter().find(|p| p.field == field).map(|p| p.source) else {
            continue;
        };
        // values written without provenance came from a direct upsert
        let holder = holders.get(field).copied().unwrap_or(SourceTag::TheSportsDb);
        if incoming.priority() <= holder.priority() {
            continue;
        }
        let kept = match field {
            "home_score" => keep_stored(&mut game.home_score, stored.home_score),
            "away_score" => keep_stored(&mut game.away_score, stored.away_score),
            "kickoff_time" => keep_stored(&mut game.kickoff_time, stored.kickoff_time),
            "week" => keep_stored(&mut game.week, stored.week),
            _ => false,
        };
        if kept {
            debug!(game_uid = %stored.game_uid, field, %incoming, %holder, "stored value kept");
            provenance.retain(|p| p.field != field);
        }
    }
    Ok((game, provenance))
}

fn keep_stored<T>(incoming: &mut Option<T>, stored: Option<T>) -> bool {
    match stored {
        Some(value) => {
            *incoming = Some(value);
            true
        }
        None => false,
    }
}

fn field_sources(conn: &Connection, game_uid: &str) -> Result<HashMap<String, SourceTag>> {
    let mut stmt = conn.prepare("SELECT field, source FROM field_provenance WHERE game_uid = ?1")?;
    let rows = stmt.query_map(params![game_uid], |r| Ok((r.get::<_, String>(0)?, parse_col(r, 1)?)))?;
    Ok(rows.collect::<rusqlite::Result<HashMap<_, _>>>()?)
}

fn rekey_game(conn: &Connection, from: &str, to: &str) -> Result<()> {
    let taken = conn
        .query_row("SELECT 1 FROM games WHERE game_uid = ?1", params![to], |_| Ok(()))
        .optional()?
        .is_some();
    if taken {
        return Err(SyncError::integrity(
            "game",
            to,
            format!("cannot re-key {from}: uid already stored for another fixture"),
        ));
    }
    conn.execute(
        "UPDATE games SET game_uid = ?2, uid_origin = 'native' WHERE game_uid = ?1",
        params![from, to],
    )?;
    conn.execute(
        "UPDATE team_game_stats SET game_uid = ?2, stat_uid = ?2 || '_' || team_uid WHERE game_uid = ?1",
        params![from, to],
    )?;
    conn.execute(
        "UPDATE field_provenance SET game_uid = ?2 WHERE game_uid = ?1",
        params![from, to],
    )?;
    conn.execute(
        "UPDATE merge_conflicts SET game_uid = ?2 WHERE game_uid = ?1",
        params![from, to],
    )?;
    Ok(())
}

fn write_stat(conn: &Connection, s: &TeamGameStat) -> Result<()> {
    let teams = conn
        .query_row(
            "SELECT home_team_uid, away_team_uid FROM games WHERE game_uid = ?1",
            params![s.game_uid],
            |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
        )
        .optional()?;
    let Some((home, away)) = teams else {
        return Err(SyncError::integrity(
            "team_game_stat",
            &s.stat_uid,
            format!("unknown game {}", s.game_uid),
        ));
    };
    if !team_exists(conn, &s.team_uid)? {
        return Err(SyncError::integrity(
            "team_game_stat",
            &s.stat_uid,
            format!("unknown team {}", s.team_uid),
        ));
    }
    if s.team_uid != home && s.team_uid != away {
        return Err(SyncError::integrity(
            "team_game_stat",
            &s.stat_uid,
            format!("{} did not play in {}", s.team_uid, s.game_uid),
        ));
    }

    let stat_uid = TeamGameStat::stat_uid_for(&s.game_uid, &s.team_uid);
    let stored_payload = conn
        .query_row(
            "SELECT raw_payload FROM team_game_stats WHERE stat_uid = ?1",
            params![stat_uid],
            |r| r.get::<_, String>(0),
        )
        .optional()?
        .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
    let payload = merge_payloads(stored_payload, &s.raw_payload);

    conn.execute(
        &format!(
            "INSERT INTO team_game_stats ({STAT_COLUMNS}, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(stat_uid) DO UPDATE SET
               is_home = excluded.is_home,
               total_yards = COALESCE(excluded.total_yards, team_game_stats.total_yards),
               passing_yards = COALESCE(excluded.passing_yards, team_game_stats.passing_yards),
               rushing_yards = COALESCE(excluded.rushing_yards, team_game_stats.rushing_yards),
               first_downs = COALESCE(excluded.first_downs, team_game_stats.first_downs),
               turnovers = COALESCE(excluded.turnovers, team_game_stats.turnovers),
               penalties = COALESCE(excluded.penalties, team_game_stats.penalties),
               raw_payload = excluded.raw_payload,
               source = excluded.source,
               updated_at = excluded.updated_at"
        ),
        params![
            stat_uid,
            s.game_uid,
            s.team_uid,
            bool_to_i64(s.team_uid == home),
            s.total_yards,
            s.passing_yards,
            s.rushing_yards,
            s.first_downs,
            s.turnovers,
            s.penalties,
            payload.to_string(),
            s.source.as_str(),
            now()
        ],
    )?;
    Ok(())
}

// Payloads are keyed by source; a run without one source keeps its entry.
fn merge_payloads(stored: Option<Value>, incoming: &Value) -> Value {
    match (stored, incoming) {
        (Some(Value::Object(mut base)), Value::Object(update)) => {
            for (source, payload) in update {
                base.insert(source.clone(), payload.clone());
            }
            Value::Object(base)
        }
        (Some(stored), Value::Null) => stored,
        _ => incoming.clone(),
    }
}

fn write_provenance(conn: &Connection, game_uid: &str, p: &SourceRecord) -> Result<()> {
    conn.execute(
        "INSERT INTO field_provenance (game_uid, field, source, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(game_uid, field) DO UPDATE SET
           source = excluded.source,
           updated_at = excluded.updated_at",
        params![game_uid, p.field, p.source.as_str(), now()],
    )?;
    Ok(())
}

fn write_conflict(
    conn: &Connection,
    league: League,
    season: i32,
    game_uid: &str,
    c: &MergeConflict,
) -> Result<usize> {
    let n = conn.execute(
        "INSERT INTO merge_conflicts (league, season, game_uid, field, kept, kept_source, discarded, discarded_source, recorded_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(game_uid, field, discarded_source, discarded) DO NOTHING",
        params![
            league.as_str(),
            season,
            game_uid,
            c.field,
            c.kept,
            c.kept_source.as_str(),
            c.discarded,
            c.discarded_source.as_str(),
            now()
        ],
    )?;
    Ok(n)
}

fn recompute_team_season(conn: &Connection, team_uid: &str, season: i32) -> Result<TeamSeasonStat> {
    let mut stmt = conn.prepare(
        "SELECT g.game_uid, g.home_team_uid, g.home_score, g.away_score, s.total_yards
         FROM games g
         LEFT JOIN team_game_stats s ON s.game_uid = g.game_uid AND s.team_uid = ?1
         WHERE g.season = ?2
           AND g.game_type = 'regular'
           AND g.cancelled = 0
           AND g.home_score IS NOT NULL
           AND g.away_score IS NOT NULL
           AND (g.home_team_uid = ?1 OR g.away_team_uid = ?1)",
    )?;
    let rows = stmt.query_map(params![team_uid, season], |r| {
        Ok((
            r.get::<_, String>(1)?,
            r.get::<_, i32>(2)?,
            r.get::<_, i32>(3)?,
            r.get::<_, Option<i32>>(4)?,
        ))
    })?;

    let (mut wins, mut losses, mut ties) = (0, 0, 0);
    let (mut points_for, mut points_against) = (0i64, 0i64);
    let (mut yards, mut yard_games) = (0i64, 0i64);
    for row in rows {
        let (home, home_score, away_score, total_yards) = row?;
        let (ours, theirs) = if home == team_uid {
            (home_score, away_score)
        } else {
            (away_score, home_score)
        };
        match ours.cmp(&theirs) {
            std::cmp::Ordering::Greater => wins += 1,
            std::cmp::Ordering::Less => losses += 1,
            std::cmp::Ordering::Equal => ties += 1,
        }
        points_for += i64::from(ours);
        points_against += i64::from(theirs);
        if let Some(y) = total_yards {
            yards += i64::from(y);
            yard_games += 1;
        }
    }

    let played = wins + losses + ties;
    let per_game = |total: i64, n: i64| (n > 0).then(|| total as f64 / n as f64);
    let stat = TeamSeasonStat {
        season_stat_uid: format!("{team_uid}_{season}"),
        team_uid: team_uid.to_string(),
        season,
        wins,
        losses,
        ties,
        win_percentage: if played > 0 {
            (f64::from(wins) + 0.5 * f64::from(ties)) / f64::from(played)
        } else {
            0.0
        },
        points_for_per_game: per_game(points_for, i64::from(played)),
        points_against_per_game: per_game(points_against, i64::from(played)),
        total_yards_per_game: per_game(yards, yard_games),
    };

    conn.execute(
        "INSERT INTO team_season_stats (season_stat_uid, team_uid, season, wins, losses, ties,
             win_percentage, points_for_per_game, points_against_per_game, total_yards_per_game, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
         ON CONFLICT(season_stat_uid) DO UPDATE SET
           wins = excluded.wins,
           losses = excluded.losses,
           ties = excluded.ties,
           win_percentage = excluded.win_percentage,
           points_for_per_game = excluded.points_for_per_game,
           points_against_per_game = excluded.points_against_per_game,
           total_yards_per_game = excluded.total_yards_per_game,
           updated_at = excluded.updated_at",
        params![
            stat.season_stat_uid,
            stat.team_uid,
            stat.season,
            stat.wins,
            stat.losses,
            stat.ties,
            stat.win_percentage,
            stat.points_for_per_game,
            stat.points_against_per_game,
            stat.total_yards_per_game,
            now()
        ],
    )?;
    Ok(stat)
}

fn query_games(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Vec<Game>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {GAME_COLUMNS} FROM games {filter} ORDER BY game_date, kickoff_time, game_uid"
    ))?;
    let rows = stmt.query_map(args, row_to_game)?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn query_stats(conn: &Connection, filter: &str, args: impl rusqlite::Params) -> Result<Vec<TeamGameStat>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {STAT_COLUMNS} FROM team_game_stats {filter} ORDER BY stat_uid"
    ))?;
    let rows = stmt.query_map(args, |r| {
        let payload: String = r.get(10)?;
        Ok(TeamGameStat {
            stat_uid: r.get(0)?,
            game_uid: r.get(1)?,
            team_uid: r.get(2)?,
            is_home: r.get::<_, i64>(3)? != 0,
            total_yards: r.get(4)?,
            passing_yards: r.get(5)?,
            rushing_yards: r.get(6)?,
            first_downs: r.get(7)?,
            turnovers: r.get(8)?,
            penalties: r.get(9)?,
            raw_payload: serde_json::from_str(&payload).unwrap_or(Value::Null),
            source: parse_col(r, 11)?,
        })
    })?;
    Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
}

fn row_to_team(r: &Row<'_>) -> rusqlite::Result<Team> {
    Ok(Team {
        team_uid: r.get(0)?,
        league: parse_col(r, 1)?,
        city: r.get(2)?,
        name: r.get(3)?,
        abbreviation: r.get(4)?,
        stadium_name: r.get(5)?,
        stadium_capacity: r.get(6)?,
        latitude: r.get(7)?,
        longitude: r.get(8)?,
        conference: r.get(9)?,
        division: r.get(10)?,
    })
}

fn row_to_game(r: &Row<'_>) -> rusqlite::Result<Game> {
    let date: String = r.get(5)?;
    let time: Option<String> = r.get(6)?;
    Ok(Game {
        game_uid: r.get(0)?,
        league: parse_col(r, 1)?,
        season: r.get(2)?,
        week: r.get(3)?,
        game_type: parse_col(r, 4)?,
        game_date: NaiveDate::parse_from_str(&date, DATE_FMT)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        kickoff_time: time.and_then(|t| NaiveTime::parse_from_str(&t, TIME_FMT).ok()),
        home_team_uid: r.get(7)?,
        away_team_uid: r.get(8)?,
        home_score: r.get(9)?,
        away_score: r.get(10)?,
        overtime: r.get::<_, i64>(11)? != 0,
        venue: r.get(12)?,
        attendance: r.get(13)?,
        weather_condition: r.get(14)?,
        weather_temp: r.get(15)?,
        source: parse_col(r, 16)?,
        cancelled: r.get::<_, i64>(17)? != 0,
        uid_origin: parse_col(r, 18)?,
    })
}

fn parse_col<T>(r: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: std::str::FromStr<Err = String>,
{
    let raw: String = r.get(idx)?;
    raw.parse::<T>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into()))
}

// Conflicts are only recorded for a fixed set of fields.
fn conflict_field(raw: &str) -> &'static str {
    match raw {
        "home_score" => "home_score",
        "away_score" => "away_score",
        "kickoff_time" => "kickoff_time",
        _ => "other",
    }
}

fn bool_to_i64(v: bool) -> i64 {
    if v { 1 } else { 0 }
}

fn now() -> String {
    Utc::now().to_rfc3339()
}
