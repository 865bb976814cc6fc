use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};

use causeway_core::{Actor, CommandMetadata, EventId, ManualClock};
use causeway_events::{EventMetadata, NewEvent};
use causeway_infra::{InMemoryBackend, OutboxStore, RetryPolicy};

fn new_event(i: usize) -> NewEvent {
    let meta = CommandMetadata::new(
        format!("corr-{i}"),
        Actor::new("u1", "u1@example.com"),
        chrono::Utc::now(),
    );
    NewEvent {
        event_id: EventId::new(),
        aggregate_type: "policy".into(),
        aggregate_id: format!("p-{i}"),
        event_type: "policy.created".into(),
        schema_version: 1,
        payload: serde_json::json!({"name": "P", "status": "draft"}),
        metadata: EventMetadata::from_command(&meta, 1),
        occurred_at: meta.timestamp,
    }
}

fn bench_backoff(c: &mut Criterion) {
    let policy = RetryPolicy::outbox_default();
    c.bench_function("retry_backoff_schedule", |b| {
        b.iter(|| {
            let mut total = std::time::Duration::ZERO;
            for failures in 0..16 {
                total += policy.backoff_after(std::hint::black_box(failures));
            }
            total
        })
    });
}

fn bench_claim_batch(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("runtime");

    c.bench_function("in_memory_claim_batch_100_of_1000", |b| {
        b.iter_batched(
            || {
                let backend =
                    Arc::new(InMemoryBackend::new(Arc::new(ManualClock::starting_now())));
                let events: Vec<NewEvent> = (0..1000).map(new_event).collect();
                backend.seed_events(&events);
                backend
            },
            |backend| {
                rt.block_on(async {
                    backend
                        .claim_batch(100, std::time::Duration::from_secs(30))
                        .await
                        .expect("claim")
                })
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_backoff, bench_claim_batch);
criterion_main!(benches);
