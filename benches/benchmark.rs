use contact_harvester::{
    classify_website, find_email, location_table_name, parse_listing_markup, Config,
    SelectorTable,
};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::time::Duration;

#[cfg(feature = "integration_benchmarks")]
use contact_harvester::{
    run_discovery, BusinessRecord, ChromeSessionFactory, Metrics, RecordStore, SessionSource,
};
#[cfg(feature = "integration_benchmarks")]
use std::sync::Arc;
#[cfg(feature = "integration_benchmarks")]
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

const LISTING_MARKUP: &str = r#"<div class="Nv2PK"><a href="https://maps.example/place"></a><div class="qBF1Pd">Blue Elephant</div><span class="MW4etd">4.6</span><span class="UY7F9">(1,204)</span><div class="W4Efsd"><span>Thai</span><span>·</span><span>96 Krabi Rd</span></div></div>"#;

// === UNIT BENCHMARKS ===

fn benchmark_config_creation(c: &mut Criterion) {
    let mut group = c.benchmark_group("config");
    configure_fast_group(&mut group);

    group.bench_function("creation", |b| {
        b.iter(|| {
            let config = Config::default();
            black_box(config);
        });
    });

    group.finish();
}

fn benchmark_website_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("website_classification");
    configure_fast_group(&mut group);

    let blocklist = Config::default().discovery.blocklist;
    let websites = vec![
        Some("example.com"),
        Some("https://www.example.co.th/menu"),
        Some("facebook.com/bluebistro"),
        Some("   "),
        None,
    ];

    group.bench_function("classify", |b| {
        b.iter(|| {
            for website in &websites {
                let result = classify_website(*website, &blocklist);
                let _ = black_box(result);
            }
        });
    });

    group.finish();
}

fn benchmark_email_matching(c: &mut Criterion) {
    let mut group = c.benchmark_group("email_matching");
    configure_fast_group(&mut group);

    let page_without = "Opening hours Mon-Sun 10:00-22:00. Call us to book a table. ".repeat(200);
    let page_with = format!("{page_without} Reservations: booking@blue-elephant.example");

    group.bench_function("match", |b| {
        b.iter(|| black_box(find_email(&page_with)));
    });

    group.bench_function("no_match", |b| {
        b.iter(|| black_box(find_email(&page_without)));
    });

    group.finish();
}

fn benchmark_listing_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("listing_parsing");
    configure_fast_group(&mut group);

    let selectors = SelectorTable::default();

    group.bench_function("parse", |b| {
        b.iter(|| {
            let fields = parse_listing_markup(LISTING_MARKUP, &selectors);
            black_box(fields);
        });
    });

    group.finish();
}

fn benchmark_table_naming(c: &mut Criterion) {
    let mut group = c.benchmark_group("table_naming");
    configure_fast_group(&mut group);

    group.bench_function("location_table_name", |b| {
        b.iter(|| black_box(location_table_name("patong beach", "restaurants")));
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (require Chrome) ===

#[cfg(feature = "integration_benchmarks")]
fn benchmark_single_site_discovery(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("single_site_discovery");
    configure_fast_group(&mut group);

    group.bench_function("example_com", |b| {
        b.iter(|| {
            rt.block_on(async {
                let config = Config::default();
                let mut store = RecordStore::from_records(vec![BusinessRecord::with_website(
                    Some("example.com"),
                )]);
                let sessions = SessionSource::Fresh {
                    factory: Arc::new(ChromeSessionFactory::new(None)),
                    config: config.session.clone(),
                };

                let report =
                    run_discovery(&mut store, sessions, &config, Arc::new(Metrics::new())).await;
                black_box(report.is_ok());
            })
        });
    });

    group.finish();
}

// === BENCHMARK GROUPS ===

criterion_group!(
    unit_benches,
    benchmark_config_creation,
    benchmark_website_classification,
    benchmark_email_matching,
    benchmark_listing_parsing,
    benchmark_table_naming,
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(integration_benches, benchmark_single_site_discovery);

#[cfg(feature = "integration_benchmarks")]
criterion_main!(unit_benches, integration_benches);

#[cfg(not(feature = "integration_benchmarks"))]
criterion_main!(unit_benches);
