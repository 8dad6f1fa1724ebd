use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use rayon::prelude::*;
use tracing::{debug, info, warn};

use crate::auditor::{AuditInput, AuditReport, audit};
use crate::config::{LeagueSchedule, SyncConfig};
use crate::connectors::{
    EspnConnector, FetchBatch, FetchScope, PfrConnector, SourceConnector, TheSportsDbConnector,
};
use crate::error::{Result, SyncError};
use crate::http_cache::HttpCache;
use crate::identity::{IdentityResolver, TeamAlias, enrich_team, franchise_seed};
use crate::merger::{ResolvedRecord, apply_cancelled_fixtures, merge, resolve_record};
use crate::model::{League, SeasonState, SourceTag};
use crate::planner::{SyncPlan, completeness_percent, phase_gaps, plan};
use crate::store::{RunOutcome, Store};
use crate::transport::{ReqwestTransport, Transport};

/// What one `collect_season` call did.
#[derive(Debug, Clone)]
pub struct SeasonSummary {
    pub league: League,
    pub season: i32,
    pub plan: String,
    pub state: SeasonState,
    pub games_upserted: usize,
    pub stats_upserted: usize,
    pub rekeyed: usize,
    pub quarantined: usize,
    pub malformed: usize,
    pub rejected: usize,
    pub source_failures: Vec<String>,
    pub report: Option<AuditReport>,
}

impl SeasonSummary {
    fn skipped(league: League, season: i32, state: SeasonState) -> Self {
        Self {
            league,
            season,
            plan: SyncPlan::Skip.label(),
            state,
            games_upserted: 0,
            stats_upserted: 0,
            rekeyed: 0,
            quarantined: 0,
            malformed: 0,
            rejected: 0,
            source_failures: Vec::new(),
            report: None,
        }
    }
}

/// Owns the store, the connectors and the per-season run state.
pub struct DataCollectionManager {
    config: SyncConfig,
    store: Arc<Store>,
    connectors: Vec<Arc<dyn SourceConnector>>,
    pool: Option<rayon::ThreadPool>,
    resolvers: Mutex<HashMap<League, Arc<IdentityResolver>>>,
    enriched: Mutex<HashSet<League>>,
    cancel_flags: Mutex<HashMap<(League, i32), Arc<AtomicBool>>>,
}

impl DataCollectionManager {
    pub fn new(
        config: SyncConfig,
        store: Arc<Store>,
        connectors: Vec<Arc<dyn SourceConnector>>,
    ) -> Result<Self> {
        config.validate()?;
        if !connectors.iter().any(|c| c.source().is_primary()) {
            return Err(SyncError::Config("no primary connector supplied".to_string()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.fetch_parallelism.clamp(2, 32))
            .build()
            .ok();
        Ok(Self {
            config,
            store,
            connectors,
            pool,
            resolvers: Mutex::new(HashMap::new()),
            enriched: Mutex::new(HashSet::new()),
            cancel_flags: Mutex::new(HashMap::new()),
        })
    }

    /// Live HTTP connectors for every enabled source.
    pub fn from_config(config: SyncConfig, store: Arc<Store>) -> Result<Self> {
        let transport: Arc<dyn Transport> = Arc::new(
            ReqwestTransport::new(config.request_timeout_secs, HttpCache::at_default_location())
                .map_err(|e| SyncError::Config(format!("http client: {e:#}")))?,
        );
        let connectors = build_connectors(&config, transport);
        Self::new(config, store, connectors)
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn primary_request_count(&self) -> u64 {
        self.connectors
            .iter()
            .filter(|c| c.source().is_primary())
            .map(|c| c.request_count())
            .sum()
    }

    pub fn collect_season(&self, league: League, season: i32) -> Result<SeasonSummary> {
        self.collect_season_with(league, season, false)
    }

    /// `force` refetches every phase even when the season already audited
    /// complete.
    pub fn collect_season_with(&self, league: League, season: i32, force: bool) -> Result<SeasonSummary> {
        self.check_cancelled(league, season)?;
        let schedule = self.config.schedule(league)?;

        let counts = self.store.count_by_phase(league, season)?;
        let state = self.store.season_state(league, season)?;
        let sync_plan = plan(schedule, season, &counts, state, force);
        let Some(scope) = sync_plan.scope() else {
            info!(%league, season, state = %state, "season complete; skipping");
            return Ok(SeasonSummary::skipped(league, season, state));
        };
        info!(%league, season, plan = %sync_plan.label(), "collecting season");

        let run_id = self.store.begin_run(league, season, &sync_plan.label())?;
        match self.run_season(schedule, season, &sync_plan, &scope) {
            Ok(summary) => {
                self.store.finish_run(
                    run_id,
                    &RunOutcome {
                        status: summary.state.as_str().to_string(),
                        games_upserted: summary.games_upserted,
                        stats_upserted: summary.stats_upserted,
                        quarantined: summary.quarantined,
                        errors: summary.source_failures.clone(),
                    },
                )?;
                Ok(summary)
            }
            Err(err) => {
                warn!(%league, season, error = %err, "season sync aborted");
                self.store.set_season_state(league, season, SeasonState::NotStarted)?;
                let status = if matches!(err, SyncError::Cancelled { .. }) {
                    "cancelled"
                } else {
                    "failed"
                };
                self.store.finish_run(
                    run_id,
                    &RunOutcome {
                        status: status.to_string(),
                        errors: vec![err.to_string()],
                        ..RunOutcome::default()
                    },
                )?;
                Err(err)
            }
        }
    }

    fn run_season(
        &self,
        schedule: &LeagueSchedule,
        season: i32,
        sync_plan: &SyncPlan,
        scope: &FetchScope,
    ) -> Result<SeasonSummary> {
        let league = schedule.league;
        self.store.set_season_state(league, season, SeasonState::Syncing)?;
        let resolver = self.resolver(league)?;
        self.enrich_teams(league)?;

        let results: Vec<(SourceTag, Result<FetchBatch>)> = with_fetch_pool(&self.pool, || {
            self.connectors
                .par_iter()
                .map(|c| (c.source(), c.fetch_games(league, season, scope)))
                .collect()
        });

        let mut summary = SeasonSummary::skipped(league, season, SeasonState::Syncing);
        summary.plan = sync_plan.label();
        let mut records = Vec::new();
        for (source, result) in results {
            match result {
                Ok(batch) => {
                    debug!(%league, season, %source, records = batch.records.len(), "fetch finished");
                    summary.malformed += batch.malformed.len();
                    for m in &batch.malformed {
                        debug!(%source, detail = %m, "malformed record skipped");
                    }
                    records.extend(batch.records);
                }
                Err(err) if source.is_primary() => return Err(err),
                Err(err) => {
                    warn!(%league, season, %source, error = %err, "secondary source failed; continuing");
                    summary.source_failures.push(err.to_string());
                }
            }
        }
        self.check_cancelled(league, season)?;

        self.store.set_season_state(league, season, SeasonState::Reconciling)?;
        let mut resolved: Vec<ResolvedRecord> = Vec::with_capacity(records.len());
        for rec in records {
            let raw = rec.into_game_record();
            let native_ref = raw.native_id.clone().unwrap_or_else(|| raw.describe());
            let (source, payload) = (raw.source, raw.payload.clone());
            match resolve_record(&resolver, schedule, raw) {
                Ok(r) => resolved.push(r),
                Err(err @ SyncError::UnresolvedIdentity { .. }) => {
                    if self.store.quarantine(league, season, source, &native_ref, &err.to_string(), &payload)? {
                        summary.quarantined += 1;
                    }
                    debug!(%source, native_ref = %native_ref, error = %err, "record quarantined");
                }
                Err(err) if err.is_record_local() => {
                    summary.malformed += 1;
                    debug!(%source, native_ref = %native_ref, error = %err, "record skipped");
                }
                Err(err) => return Err(err),
            }
        }

        let mut merged = merge(league, resolved);
        apply_cancelled_fixtures(league, schedule.cancelled_in(season), &mut merged);
        self.check_cancelled(league, season)?;

        let applied = self.store.apply_merged(league, season, &merged)?;
        summary.games_upserted = applied.games_upserted;
        summary.stats_upserted = applied.stats_upserted;
        summary.rekeyed = applied.rekeyed;
        summary.rejected = applied.rejected.len();
        self.store.recompute_league_season(league, season)?;

        let report = self.audit_season(schedule, season)?;
        self.store.save_audit_report(&report)?;
        let state = SeasonState::audited(report.complete);
        self.store.set_season_state(league, season, state)?;
        info!(
            %league,
            season,
            games = summary.games_upserted,
            health = report.health_score,
            complete = report.complete,
            "season reconciled"
        );
        summary.state = state;
        summary.report = Some(report);
        Ok(summary)
    }

    /// Collects every configured season, in parallel across seasons.
    pub fn collect_all_seasons(&self, league: League) -> Result<BTreeMap<i32, Result<SeasonSummary>>> {
        let seasons = self.config.schedule(league)?.seasons();
        let outcomes: Vec<(i32, Result<SeasonSummary>)> = with_fetch_pool(&self.pool, || {
            seasons
                .par_iter()
                .map(|&season| (season, self.collect_season(league, season)))
                .collect()
        });
        Ok(outcomes.into_iter().collect())
    }

    /// Audits stored data without fetching anything.
    pub fn verify_season(&self, league: League, season: i32) -> Result<AuditReport> {
        let schedule = self.config.schedule(league)?;
        let report = self.audit_season(schedule, season)?;
        self.store.save_audit_report(&report)?;
        Ok(report)
    }

    /// Recomputes aggregates, re-audits and resets the season state, so a
    /// season previously marked complete is planned again if it no longer is.
    pub fn force_reaudit(&self, league: League, season: i32) -> Result<AuditReport> {
        let schedule = self.config.schedule(league)?;
        self.store.recompute_league_season(league, season)?;
        let report = self.audit_season(schedule, season)?;
        self.store.save_audit_report(&report)?;
        self.store
            .set_season_state(league, season, SeasonState::audited(report.complete))?;
        info!(%league, season, health = report.health_score, "season re-audited");
        Ok(report)
    }

    /// Completeness percentage per configured season.
    pub fn status_overview(&self, league: League) -> Result<BTreeMap<i32, f64>> {
        let schedule = self.config.schedule(league)?;
        let mut out = BTreeMap::new();
        for season in schedule.seasons() {
            let counts = self.store.count_by_phase(league, season)?;
            let pct = completeness_percent(&phase_gaps(schedule, season, &counts));
            out.insert(season, (pct * 10.0).round() / 10.0);
        }
        Ok(out)
    }

    /// Takes effect at the next task boundary of a running sync.
    pub fn cancel_season(&self, league: League, season: i32) {
        self.cancel_flag(league, season).store(true, Ordering::SeqCst);
        info!(%league, season, "cancellation requested");
    }

    /// Re-applies the classifier to every stored game of the league.
    pub fn backfill_classification(&self, league: League) -> Result<usize> {
        let schedule = self.config.schedule(league)?;
        let mut total = 0;
        for season in schedule.seasons() {
            let changed = self.store.reclassify_season(schedule, season)?;
            if changed > 0 {
                self.store.recompute_league_season(league, season)?;
                info!(%league, season, changed, "classification backfilled");
            }
            total += changed;
        }
        Ok(total)
    }

    fn audit_season(&self, schedule: &LeagueSchedule, season: i32) -> Result<AuditReport> {
        let league = schedule.league;
        let teams = self.store.teams(league)?;
        let team_ids: HashSet<&str> = teams.iter().map(|t| t.team_uid.as_str()).collect();
        let season_stats: Vec<_> = self
            .store
            .team_season_stats(season)?
            .into_iter()
            .filter(|s| team_ids.contains(s.team_uid.as_str()))
            .collect();
        let games = self.store.games_for_season(league, season)?;
        let stats = self.store.stats_for_season(league, season)?;
        let quarantined = self.store.quarantined(league, season)?.len();
        let conflicts = self.store.conflicts(league, season)?.len();
        Ok(audit(&AuditInput {
            schedule,
            season,
            games: &games,
            stats: &stats,
            teams: &teams,
            season_stats: &season_stats,
            quarantined,
            conflicts,
            today: Utc::now().date_naive(),
        }))
    }

    fn cancel_flag(&self, league: League, season: i32) -> Arc<AtomicBool> {
        let mut flags = match self.cancel_flags.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        flags
            .entry((league, season))
            .or_insert_with(|| Arc::new(AtomicBool::new(false)))
            .clone()
    }

    fn check_cancelled(&self, league: League, season: i32) -> Result<()> {
        if self.cancel_flag(league, season).swap(false, Ordering::SeqCst) {
            return Err(SyncError::Cancelled {
                league: league.to_string(),
                season,
            });
        }
        Ok(())
    }

    /// Seeded resolver plus every alias persisted by earlier runs. Seed
    /// teams and aliases are written on first use.
    fn resolver(&self, league: League) -> Result<Arc<IdentityResolver>> {
        let mut resolvers = self
            .resolvers
            .lock()
            .map_err(|_| SyncError::Config("resolver lock poisoned".to_string()))?;
        if let Some(r) = resolvers.get(&league) {
            return Ok(Arc::clone(r));
        }

        for team in franchise_seed(league) {
            if self.store.team(&team.team_uid)?.is_none() {
                self.store.upsert_team(&team)?;
            }
        }
        let resolver = IdentityResolver::seeded(league);
        for alias in resolver.aliases() {
            match self.store.insert_alias(&alias) {
                Ok(()) => {}
                Err(err @ SyncError::AliasReassignment { .. }) => {
                    warn!(%league, error = %err, "seed alias already points elsewhere")
                }
                Err(err) => return Err(err),
            }
        }
        let prefix = format!("{}_", league.as_str());
        for TeamAlias { source, native_id, team_uid } in self.store.load_aliases()? {
            if !team_uid.starts_with(&prefix) {
                continue;
            }
            if let Err(err) = resolver.add_alias(source, &native_id, &team_uid) {
                warn!(%league, error = %err, "stored alias disagrees with seed");
            }
        }
        let resolver = Arc::new(resolver);
        resolvers.insert(league, Arc::clone(&resolver));
        Ok(resolver)
    }

    // Fills team gaps from the primary's team list once per league.
    fn enrich_teams(&self, league: League) -> Result<()> {
        {
            let mut done = self
                .enriched
                .lock()
                .map_err(|_| SyncError::Config("enrichment lock poisoned".to_string()))?;
            if !done.insert(league) {
                return Ok(());
            }
        }
        let resolver = self.resolver(league)?;
        for connector in self.connectors.iter().filter(|c| c.source().is_primary()) {
            let raw_teams = match connector.fetch_teams(league) {
                Ok(teams) => teams,
                Err(err) => {
                    warn!(%league, source = %connector.source(), error = %err, "team list unavailable");
                    continue;
                }
            };
            for raw in raw_teams {
                let Ok(uid) = resolver.resolve(raw.source, &raw.native_id) else {
                    debug!(%league, native_id = %raw.native_id, "team list entry without alias");
                    continue;
                };
                if let Some(mut team) = self.store.team(&uid)?
                    && enrich_team(&mut team, &raw)
                {
                    self.store.upsert_team(&team)?;
                }
            }
        }
        Ok(())
    }
}

pub fn build_connectors(config: &SyncConfig, transport: Arc<dyn Transport>) -> Vec<Arc<dyn SourceConnector>> {
    let mut connectors: Vec<Arc<dyn SourceConnector>> = Vec::new();
    for settings in config.sources.iter().filter(|s| s.enabled) {
        let connector: Arc<dyn SourceConnector> = match settings.source {
            SourceTag::TheSportsDb => Arc::new(TheSportsDbConnector::new(
                settings,
                Arc::clone(&transport),
                config.leagues.clone(),
            )),
            SourceTag::Espn => Arc::new(EspnConnector::new(
                settings,
                Arc::clone(&transport),
                config.leagues.clone(),
                config.fetch_box_scores,
            )),
            SourceTag::ProFootballReference => {
                Arc::new(PfrConnector::new(settings, Arc::clone(&transport)))
            }
        };
        connectors.push(connector);
    }
    connectors
}

fn with_fetch_pool<T>(pool: &Option<rayon::ThreadPool>, action: impl FnOnce() -> T + Send) -> T
where
    T: Send,
{
    if let Some(pool) = pool.as_ref() {
        pool.install(action)
    } else {
        action()
    }
}
