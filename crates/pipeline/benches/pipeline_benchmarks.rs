use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use std::sync::Arc;
use std::time::Duration;

use marketsync_pipeline::{
    CreateListing, GatewayError, InMemoryDeadLetterStore, InMemoryOperationLog, OperationPayload,
    PipelineCoordinator, RetryScheduler, SandboxGateway, SubmitRequest,
};

fn coordinator() -> (PipelineCoordinator, Arc<SandboxGateway>) {
    let gateway = Arc::new(SandboxGateway::instant());
    let coordinator = PipelineCoordinator::new(
        InMemoryOperationLog::arc(),
        InMemoryDeadLetterStore::arc(),
        gateway.clone(),
    )
    .with_scheduler(RetryScheduler::new(Duration::ZERO));
    (coordinator, gateway)
}

fn listing(n: usize) -> SubmitRequest {
    SubmitRequest::new(
        Some(format!("product-{n}")),
        OperationPayload::CreateListing(CreateListing {
            title: format!("Benchmark item {n}"),
            price_cents: 1999,
            quantity: 5,
            category: "bench".into(),
            brand: None,
            sku: None,
        }),
    )
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .expect("failed to build tokio runtime")
}

fn bench_submit_throughput(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("submit_throughput");

    for batch_size in [1usize, 10, 100].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let (coordinator, _) = coordinator();
                b.iter(|| {
                    rt.block_on(async {
                        for n in 0..batch_size {
                            black_box(coordinator.submit(listing(n)).await.unwrap());
                        }
                    })
                });
            },
        );
    }

    group.finish();
}

fn bench_retry_to_exhaustion(c: &mut Criterion) {
    let rt = runtime();
    let mut group = c.benchmark_group("retry_to_exhaustion");

    group.bench_function("ceiling_3_always_failing", |b| {
        let (coordinator, gateway) = coordinator();
        gateway.fail_always(Some(GatewayError::Network("down".into())));

        b.iter(|| {
            rt.block_on(async {
                let record = coordinator.submit(listing(0)).await.unwrap();
                let record = coordinator.retry(record.id).await.unwrap();
                black_box(coordinator.retry(record.id).await.unwrap())
            })
        });
    });

    group.finish();
}

criterion_group!(benches, bench_submit_throughput, bench_retry_to_exhaustion);
criterion_main!(benches);
