use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use nezuko_core::telegram::{ChatRateLimiter, SlidingWindowRateLimiter};

fn bench_sliding_window(c: &mut Criterion) {
    let limiter: SlidingWindowRateLimiter<i64> = SlidingWindowRateLimiter::new(1_000, Duration::from_secs(60));
    let mut key = 0i64;
    c.bench_function("sliding_window_check_distinct_keys", |b| {
        b.iter(|| {
            key = key.wrapping_add(1);
            limiter.check(key)
        })
    });
}

fn bench_chat_rate_limiter(c: &mut Criterion) {
    let limiter = ChatRateLimiter::new();
    let mut chat_id = 0i64;
    c.bench_function("chat_rate_limiter_check_distinct_chats", |b| {
        b.iter(|| {
            chat_id = chat_id.wrapping_add(1);
            limiter.check(1, chat_id)
        })
    });
}

criterion_group!(benches, bench_sliding_window, bench_chat_rate_limiter);
criterion_main!(benches);
