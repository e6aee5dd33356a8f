use conversation_middleware_core::{
    CharEstimateCounter, InMemoryRateLimitStore, Message, RateLimitPair, RateLimiter,
    TokenAccountant, trim,
};
use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};

fn create_messages(count: usize, text_size: usize) -> Vec<Message> {
    let text = "a".repeat(text_size);
    (0..count)
        .map(|i| {
            if i == 0 {
                Message::system(&text)
            } else if i % 2 == 0 {
                Message::user(&text)
            } else {
                Message::assistant(&text)
            }
        })
        .collect()
}

// Benchmark: TokenAccountant::count_messages with varying message counts
fn bench_count_messages_by_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_messages_by_count");

    for count in [10, 50, 200, 1000].iter() {
        let messages = create_messages(*count, 200);
        let accountant: TokenAccountant<CharEstimateCounter> = TokenAccountant::default();

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(accountant.count_messages(black_box(&messages))));
        });
    }

    group.finish();
}

// Benchmark: TokenAccountant::count on a repeated key, exercising the memoization cache
fn bench_count_memoized_repeat(c: &mut Criterion) {
    let mut group = c.benchmark_group("count_memoized_repeat");
    let accountant: TokenAccountant<CharEstimateCounter> = TokenAccountant::default();
    let text = "a".repeat(4000);

    accountant.count(&text);

    group.bench_function("repeated_lookup", |b| {
        b.iter(|| black_box(accountant.count(black_box(&text))));
    });

    group.finish();
}

// Benchmark: trim with varying message counts, well above the soft limit
fn bench_trim_by_message_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("trim_by_message_count");

    for count in [50, 200, 1000].iter() {
        let messages = create_messages(*count, 200);
        let accountant: TokenAccountant<CharEstimateCounter> = TokenAccountant::default();

        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, _| {
            b.iter(|| black_box(trim(&accountant, black_box(&messages), 2000, 20)));
        });
    }

    group.finish();
}

// Benchmark: RateLimiter::check, the per-turn hot path against an in-memory store
fn bench_rate_limiter_check(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let limiter = RateLimiter::new(
        Box::new(InMemoryRateLimitStore::new()),
        RateLimitPair::new(1_000_000, 1_000_000),
    );

    c.bench_function("rate_limiter_check_and_increment", |b| {
        b.to_async(&runtime).iter(|| async {
            black_box(limiter.check(black_box("bench-user"), true, None).await.unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_count_messages_by_count,
    bench_count_memoized_repeat,
    bench_trim_by_message_count,
    bench_rate_limiter_check,
);
criterion_main!(benches);
