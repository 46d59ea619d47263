use buildsearch::query::{escape_query, QueryBuilder};
use buildsearch::{
    BuildRecordData, ManagerProgress, RebuildRequest, SearchBackendManager, SearchSettings,
};
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tempfile::TempDir;

fn console(i: usize) -> String {
    format!(
        "Started by user admin\n+ make -j8 target{}\ncompiling module {}\nERROR: linker failed\nFinished: FAILURE",
        i, i
    )
}

fn record(job: &str, i: usize) -> BuildRecordData {
    let mut b = BuildRecordData::new(job, i as i64, console(i));
    b.start_time_millis = 1_700_000_000_000 + i as i64;
    b.result = Some(if i % 3 == 0 { "FAILURE" } else { "SUCCESS" }.to_string());
    b
}

fn setup_manager(temp: &TempDir, num_builds: usize) -> Arc<SearchBackendManager> {
    let manager = SearchBackendManager::new(SearchSettings::local(temp.path()));
    for i in 0..num_builds {
        manager
            .store_build(&record(&format!("folder/job{}", i % 10), i))
            .unwrap();
    }
    manager
}

fn bench_query_builder(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_builder");
    let queries = [
        "echo",
        "folder/job c:something",
        "linker AND (failed OR error) -r:SUCCESS",
        "n:[10 TO 200] c:\"linker failed\"",
    ];
    for q in queries {
        group.bench_with_input(BenchmarkId::new("escape", q), q, |b, q| {
            b.iter(|| escape_query(q))
        });
        group.bench_with_input(BenchmarkId::new("parse", q), q, |b, q| {
            b.iter(|| QueryBuilder::parse(q))
        });
    }
    group.finish();
}

fn bench_local_query(c: &mut Criterion) {
    let temp = TempDir::new().unwrap();
    let manager = setup_manager(&temp, 2000);

    let mut group = c.benchmark_group("local_query");
    group.throughput(Throughput::Elements(2000));

    group.bench_function("single_term", |b| {
        b.iter(|| manager.hits("linker", false))
    });

    group.bench_function("single_term_highlight", |b| {
        b.iter(|| manager.hits("linker", true))
    });

    group.bench_function("job_plus_term", |b| {
        b.iter(|| manager.hits("folder/job3 failed", true))
    });

    group.bench_function("numeric_range", |b| {
        b.iter(|| manager.hits("n:[100 TO 900] make", false))
    });

    group.bench_function("second_page", |b| {
        let first = manager.hits("compiling", false).unwrap();
        let cursor = first.last().map(|h| h.cursor());
        b.iter(|| manager.hits_after("compiling", false, cursor.as_ref()))
    });

    group.finish();
}

fn bench_indexing(c: &mut Criterion) {
    let mut group = c.benchmark_group("indexing");
    group.sample_size(10);

    for batch_size in [10, 100] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(
            BenchmarkId::new("store", batch_size),
            &batch_size,
            |b, &size| {
                b.iter_with_setup(
                    || {
                        let temp = TempDir::new().unwrap();
                        let manager = SearchBackendManager::new(SearchSettings::local(temp.path()));
                        (temp, manager)
                    },
                    |(_temp, manager)| {
                        for i in 0..size {
                            manager.store_build(&record("bench", i)).unwrap();
                        }
                    },
                )
            },
        );
    }

    group.bench_function("search_help_refresh", |b| {
        let temp = TempDir::new().unwrap();
        let manager = setup_manager(&temp, 500);
        b.iter(|| manager.search_field_definitions(true))
    });

    group.finish();
}

fn bench_rebuild(c: &mut Criterion) {
    use buildsearch::{BuildRecord, RecordSource, Result};

    struct Generated(usize);

    impl RecordSource for Generated {
        fn job_names(&self) -> Result<Vec<String>> {
            Ok((0..5).map(|j| format!("job{}", j)).collect())
        }

        fn builds(&self, job: &str) -> Result<Vec<Arc<dyn BuildRecord>>> {
            Ok((1..=self.0)
                .map(|i| Arc::new(record(job, i)) as Arc<dyn BuildRecord>)
                .collect())
        }
    }

    let mut group = c.benchmark_group("rebuild");
    group.sample_size(10);
    for workers in [1, 5] {
        group.bench_with_input(BenchmarkId::new("overwrite", workers), &workers, |b, &w| {
            let temp = TempDir::new().unwrap();
            let manager = SearchBackendManager::new(SearchSettings::local(temp.path()));
            let source: Arc<dyn RecordSource> = Arc::new(Generated(50));
            let request = RebuildRequest::full().with_workers(w).with_overwrite(true);
            b.iter(|| manager.rebuild_database(Arc::clone(&source), &request, &ManagerProgress::new()))
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_query_builder,
    bench_local_query,
    bench_indexing,
    bench_rebuild
);
criterion_main!(benches);
