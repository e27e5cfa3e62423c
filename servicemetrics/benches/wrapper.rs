use std::{
    cmp::{max, min},
    time::{Duration, Instant},
};

use criterion::Criterion;
use servicemetrics::{Config, PrometheusWrapper};

fn wrapper() -> PrometheusWrapper {
    PrometheusWrapper::new(Config {
        log_api: vec!["/test".to_string()],
        log_method: vec!["GET".to_string()],
        ..Config::new("test")
    })
    .expect("config is valid")
}

pub fn auto_log(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("auto_log");
    group.throughput(criterion::Throughput::Elements(1));

    let metrics = wrapper();
    group.bench_function("allowed", |bencher| {
        bencher.iter(|| metrics.log("/test", "GET", "200", 0, 0, Duration::ZERO))
    });
    group.bench_function("filtered", |bencher| {
        bencher.iter(|| metrics.log("/other", "GET", "200", 0, 0, Duration::ZERO))
    });
}

pub fn request_log(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("request_log");
    group.throughput(criterion::Throughput::Elements(1));

    let metrics = wrapper();

    for threads in [1, 2, 4, 8] {
        group.bench_function(format!("concurrency-{threads:02}"), |bencher| {
            bencher.iter_custom(|iterations| {
                let thread_count = max(1, min(threads, iterations));
                let iterations_per_thread = iterations / thread_count;

                let start = Instant::now();
                std::thread::scope(|scope| {
                    for _ in 0..thread_count {
                        scope.spawn(|| {
                            for _ in 0..iterations_per_thread {
                                metrics.request_log("backend", "/test1", "GET", "200");
                            }
                        });
                    }
                });

                start.elapsed()
            });
        });
    }
}

pub fn latency_log(criterion: &mut Criterion) {
    let mut group = criterion.benchmark_group("latency_log");
    group.throughput(criterion::Throughput::Elements(1));

    let metrics = wrapper();
    let mut i: u64 = 0;
    group.bench_function("histogram_and_summary", |bencher| {
        bencher.iter(|| {
            i = (i + 7) % 200;
            metrics.latency_log("backend", "/test1", "GET", Duration::from_millis(i))
        })
    });
}

criterion::criterion_group!(benches, auto_log, request_log, latency_log);
criterion::criterion_main!(benches);
