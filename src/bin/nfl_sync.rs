use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use tracing_subscriber::EnvFilter;

use gridiron_sync::config::SyncConfig;
use gridiron_sync::manager::SeasonSummary;
use gridiron_sync::model::League;
use gridiron_sync::store::Store;
use gridiron_sync::DataCollectionManager;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let mut config = SyncConfig::load()?;
    if let Some(path) = parse_db_path_arg() {
        config.db_path = Some(path);
    }
    let db_path = config
        .resolved_db_path()
        .context("unable to resolve sqlite path")?;
    let league = League::Nfl;
    let schedule = config.schedule(league)?.clone();

    let seasons = parse_seasons_arg().unwrap_or_else(|| schedule.seasons());
    if seasons.is_empty() {
        return Err(anyhow!("no seasons resolved for sync"));
    }
    let force = has_flag("--force");
    let verify_only = has_flag("--verify");

    let store = Arc::new(Store::open(&db_path)?);
    let manager = DataCollectionManager::from_config(config, Arc::clone(&store))?;

    println!("DB: {}", db_path.display());
    if verify_only {
        for season in &seasons {
            let report = manager.verify_season(league, *season)?;
            println!(
                "season {season}: health {:.1} complete={} completeness {:.1}%",
                report.health_score, report.complete, report.completeness_percent
            );
            for (category, issues) in report.summary() {
                println!("   - {category:?}: {issues}");
            }
        }
        return Ok(());
    }

    let mut failed = 0usize;
    for season in &seasons {
        match manager.collect_season_with(league, *season, force) {
            Ok(summary) => print_summary(&summary),
            Err(err) => {
                failed += 1;
                eprintln!("season {season}: failed: {err}");
            }
        }
    }

    println!("Sync complete");
    println!("Seasons: {}/{}", seasons.len() - failed, seasons.len());
    println!(
        "Primary requests: {}",
        manager.primary_request_count()
    );
    let overview = manager.status_overview(league)?;
    for season in &seasons {
        if let Some(pct) = overview.get(season) {
            println!("  {season}: {pct:.1}% complete");
        }
    }
    Ok(())
}

fn print_summary(summary: &SeasonSummary) {
    println!(
        "season {}: plan={} state={} games={} stats={} rekeyed={} quarantined={} malformed={} rejected={}",
        summary.season,
        summary.plan,
        summary.state,
        summary.games_upserted,
        summary.stats_upserted,
        summary.rekeyed,
        summary.quarantined,
        summary.malformed,
        summary.rejected
    );
    if let Some(report) = summary.report.as_ref() {
        println!("  health {:.1}", report.health_score);
    }
    if !summary.source_failures.is_empty() {
        println!("  source errors: {}", summary.source_failures.len());
        for err in summary.source_failures.iter().take(6) {
            println!("   - {err}");
        }
    }
}

fn has_flag(flag: &str) -> bool {
    std::env::args().skip(1).any(|arg| arg == flag)
}

fn parse_db_path_arg() -> Option<PathBuf> {
    arg_value("--db").map(PathBuf::from)
}

// `--season 2023` or `--seasons 2019-2023` / `--seasons 2019,2021`.
fn parse_seasons_arg() -> Option<Vec<i32>> {
    if let Some(raw) = arg_value("--season") {
        return raw.trim().parse::<i32>().ok().map(|s| vec![s]);
    }
    let raw = arg_value("--seasons")?;
    let mut out = BTreeSet::new();
    for part in raw.split([',', ';', ' ']) {
        let part = part.trim();
        if let Some((from, to)) = part.split_once('-')
            && let (Ok(from), Ok(to)) = (from.trim().parse::<i32>(), to.trim().parse::<i32>())
        {
            out.extend(from.min(to)..=from.max(to));
        } else if let Ok(season) = part.parse::<i32>() {
            out.insert(season);
        }
    }
    (!out.is_empty()).then(|| out.into_iter().collect())
}

fn arg_value(name: &str) -> Option<String> {
    let args = std::env::args().skip(1).collect::<Vec<_>>();
    let prefix = format!("{name}=");
    for (idx, arg) in args.iter().enumerate() {
        if let Some(raw) = arg.strip_prefix(&prefix) {
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
        if arg == name
            && let Some(next) = args.get(idx + 1)
            && !next.trim().is_empty()
        {
            return Some(next.trim().to_string());
        }
    }
    None
}
