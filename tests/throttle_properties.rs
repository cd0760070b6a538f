// Behavioral properties of the per-agent throttle engine
//
// Timing tests run on Tokio's paused clock, so waits are exact and fast.

use dispatch_throttle::throttle::{
    Metadata, ThrottleConfig, ThrottleError, ThrottleOverrides, ThrottleRegistry,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;

fn registry(interval_ms: u64) -> ThrottleRegistry {
    ThrottleRegistry::new(
        ThrottleConfig::default()
            .with_min_interval(Duration::from_millis(interval_ms))
            .with_retry_delay(Duration::from_millis(10)),
        None,
    )
}

#[tokio::test(start_paused = true)]
async fn agents_are_isolated() {
    let registry = registry(20_000);
    let a = registry.get("agent-a", None).await.unwrap();
    let b = registry.get("agent-b", None).await.unwrap();

    a.send(|| async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
    assert!(!a.gate().is_ready());

    // Agent B is not slowed down by A's pacing
    let start = Instant::now();
    b.send(|| async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
    assert!(start.elapsed() < Duration::from_millis(1));

    assert_eq!(a.status().total_sent, 1);
    assert_eq!(b.status().total_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn consecutive_attempts_respect_min_interval() {
    let registry = registry(100);
    let throttle = registry.get("agent-1", None).await.unwrap();
    let spans = Arc::new(Mutex::new(Vec::new()));

    let mut completions = Vec::new();
    for _ in 0..4 {
        let spans = spans.clone();
        let completion = throttle
            .enqueue(
                move || {
                    let spans = spans.clone();
                    async move {
                        let start = Instant::now();
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        spans.lock().unwrap().push((start, Instant::now()));
                        Ok::<_, anyhow::Error>(())
                    }
                },
                Metadata::new(),
            )
            .unwrap();
        completions.push(completion);
    }
    for completion in completions {
        completion.await.unwrap();
    }

    // The interval runs from the end of one attempt to the start of the next
    let spans = spans.lock().unwrap();
    assert_eq!(spans.len(), 4);
    for pair in spans.windows(2) {
        let (_, prev_end) = pair[0];
        let (next_start, _) = pair[1];
        assert!(next_start - prev_end >= Duration::from_millis(100));
    }
}

#[tokio::test(start_paused = true)]
async fn direct_sends_share_the_clock_with_the_queue() {
    let registry = registry(100);
    let throttle = registry.get("agent-1", None).await.unwrap();

    let queued = throttle
        .enqueue(|| async { Ok::<_, anyhow::Error>(()) }, Metadata::new())
        .unwrap();
    queued.await.unwrap();

    let start = Instant::now();
    throttle.send(|| async { Ok::<_, anyhow::Error>(()) }).await.unwrap();
    assert!(start.elapsed() >= Duration::from_millis(100));
}

#[tokio::test(start_paused = true)]
async fn queue_is_fifo() {
    let registry = registry(10);
    let throttle = registry.get("agent-1", None).await.unwrap();
    let order = Arc::new(Mutex::new(Vec::new()));

    let mut completions = Vec::new();
    for n in 0..5 {
        let order = order.clone();
        completions.push(
            throttle
                .enqueue(
                    move || {
                        order.lock().unwrap().push(n);
                        async move { Ok::<_, anyhow::Error>(n) }
                    },
                    Metadata::new(),
                )
                .unwrap(),
        );
    }

    let mut results = Vec::new();
    for completion in completions {
        results.push(completion.await.unwrap());
    }

    assert_eq!(results, vec![0, 1, 2, 3, 4]);
    assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
}

#[tokio::test(start_paused = true)]
async fn enqueue_beyond_capacity_is_rejected() {
    let registry = registry(1_000);
    let overrides = ThrottleOverrides {
        max_queue_size: Some(3),
        ..ThrottleOverrides::default()
    };
    let throttle = registry.get("agent-1", Some(overrides)).await.unwrap();

    let mut accepted = Vec::new();
    for _ in 0..3 {
        accepted.push(
            throttle
                .enqueue(|| async { Ok::<_, anyhow::Error>(()) }, Metadata::new())
                .unwrap(),
        );
    }

    let err = throttle
        .enqueue(|| async { Ok::<_, anyhow::Error>(()) }, Metadata::new())
        .unwrap_err();
    assert!(matches!(
        err,
        ThrottleError::QueueFull { capacity: 3, ref agent_id } if agent_id == "agent-1"
    ));
    assert_eq!(throttle.queue_len(), 3);

    // Accepted items are unaffected by the rejection
    for completion in accepted {
        completion.await.unwrap();
    }
}

#[tokio::test(start_paused = true)]
async fn always_failing_task_runs_exactly_max_retries_times() {
    let registry = registry(0);
    let throttle = registry.get("agent-1", None).await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let err = throttle
        .send(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(anyhow::anyhow!("HTTP 503")) }
        })
        .await
        .unwrap_err();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(err.attempts(), Some(3));
    assert!(err.to_string().contains("HTTP 503"));

    let status = throttle.status();
    assert_eq!(status.total_failed, 1);
    assert_eq!(status.total_sent, 0);
    let last_error = status.last_error.unwrap();
    assert!(last_error.message.contains("HTTP 503"));
    assert_eq!(last_error.attempts, 3);
}

#[tokio::test(start_paused = true)]
async fn failing_once_then_succeeding_counts_one_retry() {
    let registry = registry(0);
    let throttle = registry.get("agent-1", None).await.unwrap();
    let calls = Arc::new(AtomicU32::new(0));

    let counter = calls.clone();
    let completion = throttle
        .enqueue(
            move || {
                let call = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if call == 0 {
                        anyhow::bail!("transient");
                    }
                    Ok("ok")
                }
            },
            Metadata::new(),
        )
        .unwrap();

    assert_eq!(completion.await.unwrap(), "ok");

    let status = throttle.status();
    assert_eq!(status.total_sent, 1);
    assert_eq!(status.total_retries, 1);
    assert_eq!(status.total_failed, 0);
    assert_eq!(status.success_rate_pct, 100.0);
}

#[tokio::test(start_paused = true)]
async fn slow_attempt_times_out_and_counts_as_failure() {
    let registry = ThrottleRegistry::new(
        ThrottleConfig::default()
            .with_min_interval(Duration::ZERO)
            .with_max_retries(1)
            .with_send_timeout(Duration::from_millis(50)),
        None,
    );
    let throttle = registry.get("agent-1", None).await.unwrap();

    let err = throttle
        .send(|| async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok::<_, anyhow::Error>(())
        })
        .await
        .unwrap_err();

    match err {
        ThrottleError::ExhaustedRetries { attempts, last } => {
            assert_eq!(attempts, 1);
            assert!(matches!(*last, ThrottleError::Timeout(_)));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(throttle.status().total_failed, 1);
}

#[tokio::test(start_paused = true)]
async fn idle_throttle_reports_ready_and_never_sent() {
    let registry = registry(20_000);
    let throttle = registry.get("agent-idle", None).await.unwrap();

    let status = throttle.status();
    assert!(status.gate_ready);
    assert_eq!(status.wait_ms, 0);
    assert_eq!(status.queue_length, 0);
    assert!(!status.processing);
    assert_eq!(status.total_sent, 0);
    assert_eq!(status.last_send_time_iso, "never");
}

#[tokio::test(start_paused = true)]
async fn three_items_drain_in_two_intervals() {
    let registry = registry(100);
    let throttle = registry.get("agent-1", None).await.unwrap();

    let start = Instant::now();
    let completions: Vec<_> = (0..3)
        .map(|_| {
            throttle
                .enqueue(|| async { Ok::<_, anyhow::Error>(()) }, Metadata::new())
                .unwrap()
        })
        .collect();
    for completion in completions {
        completion.await.unwrap();
    }

    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(200));
    assert!(elapsed < Duration::from_millis(300));

    // Worker goes idle once the queue is drained
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(!throttle.is_processing());
    assert_eq!(throttle.status().total_sent, 3);
}

#[tokio::test(start_paused = true)]
async fn worker_restarts_after_going_idle() {
    let registry = registry(50);
    let throttle = registry.get("agent-1", None).await.unwrap();

    let first = throttle
        .enqueue(|| async { Ok::<_, anyhow::Error>(1) }, Metadata::new())
        .unwrap();
    assert_eq!(first.await.unwrap(), 1);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(!throttle.is_processing());

    let second = throttle
        .enqueue(|| async { Ok::<_, anyhow::Error>(2) }, Metadata::new())
        .unwrap();
    assert_eq!(second.await.unwrap(), 2);
}

#[tokio::test(start_paused = true)]
async fn panicking_task_does_not_wedge_the_queue() {
    let registry = registry(100);
    let throttle = registry.get("agent-1", None).await.unwrap();
    let calls = Arc::new(Mutex::new(Vec::new()));

    let recorded = calls.clone();
    let boom = throttle
        .enqueue(
            move || {
                recorded.lock().unwrap().push(Instant::now());
                async {
                    if true {
                        panic!("task blew up");
                    }
                    Ok::<_, anyhow::Error>(())
                }
            },
            Metadata::new(),
        )
        .unwrap();
    let next_start = Arc::new(Mutex::new(None));
    let started = next_start.clone();
    let next = throttle
        .enqueue(
            move || {
                *started.lock().unwrap() = Some(Instant::now());
                async { Ok::<_, anyhow::Error>("after") }
            },
            Metadata::new(),
        )
        .unwrap();

    // The panic is an ordinary failure: retried, counted and paced
    let err = boom.await.unwrap_err();
    assert!(!err.is_cancelled());
    assert_eq!(err.attempts(), Some(3));
    assert!(err.to_string().contains("task blew up"));
    assert_eq!(next.await.unwrap(), "after");

    let calls = calls.lock().unwrap();
    assert_eq!(calls.len(), 3);
    let last_panic = calls[2];
    let next_start = next_start.lock().unwrap().unwrap();
    assert!(next_start - last_panic >= Duration::from_millis(100));

    let status = throttle.status();
    assert_eq!(status.total_failed, 1);
    assert_eq!(status.total_retries, 2);
    assert_eq!(status.total_sent, 1);
}

#[tokio::test(start_paused = true)]
async fn removed_agent_cancels_pending_items() {
    let registry = registry(1_000);
    let throttle = registry.get("agent-1", None).await.unwrap();
    throttle.send(|| async { Ok::<_, anyhow::Error>(()) }).await.unwrap();

    let first = throttle
        .enqueue(|| async { Ok::<_, anyhow::Error>(()) }, Metadata::new())
        .unwrap();
    let second = throttle
        .enqueue(|| async { Ok::<_, anyhow::Error>(()) }, Metadata::new())
        .unwrap();

    assert!(registry.remove("agent-1").await);
    assert!(second.await.unwrap_err().is_cancelled());
    let _ = first.await;

    // A fresh throttle is created on the next lookup
    let fresh = registry.get("agent-1", None).await.unwrap();
    assert!(!fresh.same_as(&throttle));
    assert_eq!(fresh.status().total_sent, 0);
}
