use chrono::{Days, NaiveDate};
use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use gridiron_sync::classifier::classify;
use gridiron_sync::config::LeagueSchedule;
use gridiron_sync::identity::IdentityResolver;
use gridiron_sync::merger::{ResolvedRecord, merge, resolve_record};
use gridiron_sync::model::{League, RawGameRecord, SourceTag};

const TSDB_IDS: [&str; 8] = [
    "134944", "134946", "134918", "134923", "134920", "134930", "134934", "134931",
];
const ESPN_CODES: [&str; 8] = ["kc", "ari", "buf", "cin", "mia", "den", "dal", "phi"];

// A season-sized batch: every game listed by the primary and the stats source.
fn season_records() -> Vec<ResolvedRecord> {
    let nfl = LeagueSchedule::nfl();
    let resolver = IdentityResolver::seeded(League::Nfl);
    let opener = NaiveDate::from_ymd_opt(2023, 9, 7).expect("valid fixture date");
    let mut out = Vec::new();
    for n in 0..272u64 {
        let date = opener + Days::new(n / 16 * 7);
        let home = (n % 8) as usize;
        let away = (home + 1 + (n as usize / 8) % 7) % 8;

        let mut primary = RawGameRecord::new(
            SourceTag::TheSportsDb,
            League::Nfl,
            2023,
            date,
            TSDB_IDS[home],
            TSDB_IDS[away],
        );
        primary.native_id = Some(format!("18{n:05}"));
        primary.home_score = Some(20);
        primary.away_score = Some(17);

        let mut stats = RawGameRecord::new(
            SourceTag::Espn,
            League::Nfl,
            2023,
            date,
            ESPN_CODES[home],
            ESPN_CODES[away],
        );
        stats.native_id = Some(format!("4015{n:05}"));
        stats.attendance = Some(65_000);

        for raw in [primary, stats] {
            if let Ok(rec) = resolve_record(&resolver, &nfl, raw) {
                out.push(rec);
            }
        }
    }
    out
}

fn bench_classify(c: &mut Criterion) {
    let nfl = LeagueSchedule::nfl();
    let start = NaiveDate::from_ymd_opt(2023, 7, 1).expect("valid fixture date");
    let dates: Vec<NaiveDate> = (0..240).map(|d| start + Days::new(d)).collect();
    c.bench_function("classify_season_calendar", |b| {
        b.iter(|| {
            for date in &dates {
                black_box(classify(&nfl, None, black_box(*date), 2023));
            }
        })
    });
}

fn bench_merge(c: &mut Criterion) {
    let records = season_records();
    c.bench_function("merge_season", |b| {
        b.iter(|| {
            let merged = merge(League::Nfl, black_box(records.clone()));
            black_box(merged.len());
        })
    });
}

criterion_group!(benches, bench_classify, bench_merge);
criterion_main!(benches);
