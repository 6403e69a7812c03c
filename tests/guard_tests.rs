mod common;

use idempotency_guard::error::IdempotencyError;
use idempotency_guard::idempotency::{IdempotentOptions, Invocation, RecordKeys};
use idempotency_guard::live_config::{keys, LiveConfig, StaticConfigSource};
use idempotency_guard::store::StateStore;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

const REJECT: &str = "Request is already being processed, please do not resubmit";

#[tokio::test(start_paused = true)]
async fn test_concurrent_fail_fast_runs_once() {
    let (guard, _store) = common::setup_guard();
    let runs = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..10 {
        let guard = Arc::clone(&guard);
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            let request = common::sync_request(Some("T1"));
            let invocation = Invocation::new("create_order").with_request(&request);
            let options = IdempotentOptions::new().with_expire_time(300).with_max_retry_count(3);

            guard
                .execute(&options, &invocation, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, anyhow::Error>("order-1".to_string())
                })
                .await
        }));
    }

    let mut succeeded = Vec::new();
    let mut rejected = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(value) => succeeded.push(value),
            Err(IdempotencyError::DuplicateRejected(message)) => {
                assert_eq!(message, REJECT);
                rejected += 1;
            }
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(succeeded, vec!["order-1".to_string()]);
    assert_eq!(rejected, 9);
    assert_eq!(guard.stats().snapshot().duplicates, 9);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_wait_and_replay_share_one_result() {
    let (guard, _store) = common::setup_guard();
    let runs = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for i in 0..5u64 {
        let guard = Arc::clone(&guard);
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(i * 10)).await;
            let headers = common::message(Some("T-replay"));
            let invocation = Invocation::new("charge").with_message(&headers);
            let options = IdempotentOptions::new().wait_and_replay(true);

            guard
                .execute(&options, &invocation, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    Ok::<_, anyhow::Error>(4200u64 + i)
                })
                .await
        }));
    }

    let mut values = Vec::new();
    for handle in handles {
        values.push(handle.await.unwrap().unwrap());
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(values.iter().all(|v| *v == values[0]));
    assert_eq!(guard.stats().snapshot().replayed, 4);
}

#[tokio::test(start_paused = true)]
async fn test_wait_and_replay_reopens_after_failure() {
    let (guard, store) = common::setup_guard();
    let options = IdempotentOptions::new().wait_and_replay(true);
    let keys = RecordKeys::new("idempotent:", "T2");

    // First caller fails after holding the record for a while.
    let first = {
        let guard = Arc::clone(&guard);
        let options = options.clone();
        tokio::spawn(async move {
            let headers = common::message(Some("T2"));
            let invocation = Invocation::new("ship").with_message(&headers);
            guard
                .execute(&options, &invocation, || async {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Err::<String, _>(anyhow::anyhow!("carrier unavailable"))
                })
                .await
        })
    };

    // Arrives mid-flight, waits, then takes over once the record is FAILED.
    let third = {
        let guard = Arc::clone(&guard);
        let options = options.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let request = common::sync_request(Some("T2"));
            let invocation = Invocation::new("ship").with_request(&request);
            guard
                .execute(&options, &invocation, || async {
                    Ok::<_, anyhow::Error>("shipped-by-third".to_string())
                })
                .await
        })
    };

    let first = first.await.unwrap();
    assert!(matches!(first, Err(IdempotencyError::OperationFailed(_))));

    let third = third.await.unwrap().unwrap();
    assert_eq!(third, "shipped-by-third");
    assert_eq!(store.get(&keys.record).await.unwrap().as_deref(), Some("SUCCESS"));

    // A resubmission now replays the new owner's result.
    let resubmit_runs = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&resubmit_runs);
    let headers = common::message(Some("T2"));
    let invocation = Invocation::new("ship").with_message(&headers);
    let replayed = guard
        .execute(&options, &invocation, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>("shipped-again".to_string())
        })
        .await
        .unwrap();

    assert_eq!(replayed, "shipped-by-third");
    assert_eq!(resubmit_runs.load(Ordering::SeqCst), 0);
    assert!(guard.stats().snapshot().reopened >= 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_record_is_cleared_of_cached_result() {
    let (guard, store) = common::setup_guard();
    let keys = RecordKeys::new("idempotent:", "T-stale");
    let options = IdempotentOptions::new().wait_and_replay(true).with_max_retry_count(0);

    let headers = common::message(Some("T-stale"));
    let invocation = Invocation::new("ship").with_message(&headers);
    let writer = Arc::clone(&store);
    let result_key = keys.result.clone();
    let result = guard
        .execute(&options, &invocation, || async move {
            // A payload left behind by an earlier generation.
            writer
                .set_with_ttl(&result_key, "17", Duration::from_secs(300))
                .await
                .unwrap();
            Err::<u32, _>(anyhow::anyhow!("boom"))
        })
        .await;

    assert!(matches!(result, Err(IdempotencyError::OperationFailed(_))));
    assert_eq!(store.get(&keys.record).await.unwrap().as_deref(), Some("FAILED"));
    assert_eq!(store.get(&keys.result).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_reopen_until_retry_limit() {
    let (guard, _store) = common::setup_guard();
    let options = IdempotentOptions::new().with_max_retry_count(3);
    let runs = Arc::new(AtomicU32::new(0));

    let mut outcomes = Vec::new();
    for _ in 0..5 {
        let request = common::sync_request(Some("T-retry"));
        let invocation = Invocation::new("debit").with_request(&request);
        let runs = Arc::clone(&runs);
        let outcome = guard
            .execute(&options, &invocation, || async move {
                runs.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(anyhow::anyhow!("ledger locked"))
            })
            .await;
        outcomes.push(outcome);
    }

    // The first attempt plus three reopened retries.
    assert_eq!(runs.load(Ordering::SeqCst), 4);
    assert!(outcomes[..4]
        .iter()
        .all(|o| matches!(o, Err(IdempotencyError::OperationFailed(_)))));
    assert!(matches!(outcomes[4], Err(IdempotencyError::RetryExhausted)));
}

#[tokio::test(start_paused = true)]
async fn test_retry_exhaustion_is_silent_for_async_callers() {
    let (guard, _store) = common::setup_guard();
    let options = IdempotentOptions::new().with_max_retry_count(0);
    let headers = common::message(Some("T-async-retry"));
    let invocation = Invocation::new("debit").with_message(&headers);

    let first = guard
        .execute(&options, &invocation, || async {
            Err::<u32, _>(anyhow::anyhow!("ledger locked"))
        })
        .await;
    assert!(matches!(first, Err(IdempotencyError::OperationFailed(_))));

    let second = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(9u32) })
        .await
        .unwrap();
    assert_eq!(second, 0);
    assert_eq!(guard.stats().snapshot().retry_exhausted, 1);
}

#[tokio::test(start_paused = true)]
async fn test_success_resets_retry_counter() {
    let (guard, store) = common::setup_guard();
    let options = IdempotentOptions::new().with_max_retry_count(2).with_expire_time(10);
    let keys = RecordKeys::new("idempotent:", "T-reset");
    let request = common::sync_request(Some("T-reset"));
    let invocation = Invocation::new("debit").with_request(&request);

    let _ = guard
        .execute(&options, &invocation, || async { Err::<u32, _>(anyhow::anyhow!("first")) })
        .await;
    let value = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(5u32) })
        .await
        .unwrap();

    assert_eq!(value, 5);
    assert_eq!(store.get(&keys.retry_count).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn test_record_expiry_allows_fresh_execution() {
    let (guard, _store) = common::setup_guard();
    let options = IdempotentOptions::new().with_expire_time(300);
    let runs = Arc::new(AtomicU32::new(0));
    let request = common::sync_request(Some("T-ttl"));
    let invocation = Invocation::new("create_order").with_request(&request);

    let call = || {
        let runs = Arc::clone(&runs);
        move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(1u32)
        }
    };

    assert!(guard.execute(&options, &invocation, call()).await.is_ok());
    assert!(matches!(
        guard.execute(&options, &invocation, call()).await,
        Err(IdempotencyError::DuplicateRejected(_))
    ));

    tokio::time::advance(Duration::from_secs(301)).await;

    assert!(guard.execute(&options, &invocation, call()).await.is_ok());
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_missing_token_diverges_by_caller_kind() {
    let (guard, _store) = common::setup_guard();
    let options = IdempotentOptions::new();
    let runs = Arc::new(AtomicU32::new(0));

    let request = common::sync_request(None);
    let sync = Invocation::new("create_order").with_request(&request);
    let counter = Arc::clone(&runs);
    let sync_result = guard
        .execute(&options, &sync, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;
    assert!(matches!(sync_result, Err(IdempotencyError::Validation(_))));

    let headers = common::message(None);
    let asynchronous = Invocation::new("create_order").with_message(&headers);
    let counter = Arc::clone(&runs);
    let async_result = guard
        .execute(&options, &asynchronous, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;
    let err = async_result.unwrap_err();
    assert!(matches!(err, IdempotencyError::Discard(_)));
    assert!(!err.should_requeue());

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(guard.stats().snapshot().tokens_missing, 2);
}

#[tokio::test]
async fn test_suppressed_failure_returns_default() {
    let (guard, store) = common::setup_guard();
    let options = IdempotentOptions::new().suppress_failure();
    let request = common::sync_request(Some("T-quiet"));
    let invocation = Invocation::new("notify").with_request(&request);

    let value: Vec<String> = guard
        .execute(&options, &invocation, || async {
            Err::<Vec<String>, _>(anyhow::anyhow!("smtp down"))
        })
        .await
        .unwrap();

    assert!(value.is_empty());
    assert_eq!(
        store.get("idempotent:T-quiet").await.unwrap().as_deref(),
        Some("FAILED")
    );
}

#[tokio::test]
async fn test_operation_scoping_separates_records() {
    let (guard, store) = common::setup_guard();
    let options = IdempotentOptions::new().scoped_by_operation();
    let request = common::sync_request(Some("42"));

    for operation in ["create_order", "create_invoice"] {
        let invocation = Invocation::new(operation).with_request(&request);
        let value = guard
            .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(operation.len()) })
            .await
            .unwrap();
        assert_eq!(value, operation.len());
    }

    assert_eq!(
        store.get("idempotent:create_order:42").await.unwrap().as_deref(),
        Some("SUCCESS")
    );
    assert_eq!(
        store.get("idempotent:create_invoice:42").await.unwrap().as_deref(),
        Some("SUCCESS")
    );
}

#[tokio::test]
async fn test_global_config_drives_prefix_and_message() {
    let config = Arc::new(StaticConfigSource::from_pairs([
        (keys::KEY_PREFIX, "billing:"),
        (keys::EXPIRE_TIME, "60"),
    ]));
    let (guard, store) = common::setup_guard_with(config);
    let options = IdempotentOptions::new().with_reject_message("Payment already in progress");
    let request = common::sync_request(Some("P-1"));
    let invocation = Invocation::new("pay").with_request(&request);

    store
        .set_if_absent("billing:P-1", "PROCESSING", Duration::from_secs(60))
        .await
        .unwrap();

    let result = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(()) })
        .await;
    match result {
        Err(IdempotencyError::DuplicateRejected(message)) => {
            assert_eq!(message, "Payment already in progress")
        }
        other => panic!("expected duplicate rejection, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_config_change_applies_to_next_invocation() {
    let live = Arc::new(LiveConfig::new(HashMap::from([(
        keys::WAIT_AND_REPLAY.to_string(),
        "true".to_string(),
    )])));
    let (guard, _store) = common::setup_guard_with(live.clone());
    let options = IdempotentOptions::new();
    let request = common::sync_request(Some("T-live"));
    let invocation = Invocation::new("quote").with_request(&request);

    let first = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(11u32) })
        .await
        .unwrap();
    // Wait-and-replay from the live snapshot: the duplicate replays.
    let replayed = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(12u32) })
        .await
        .unwrap();
    assert_eq!((first, replayed), (11, 11));

    live.replace(HashMap::from([(
        keys::WAIT_AND_REPLAY.to_string(),
        "false".to_string(),
    )]));

    let rejected = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(13u32) })
        .await;
    assert!(matches!(rejected, Err(IdempotencyError::DuplicateRejected(_))));
}

#[tokio::test(start_paused = true)]
async fn test_mismatched_reader_does_not_evict_owner_result() {
    let (guard, store) = common::setup_guard();
    let options = IdempotentOptions::new().wait_and_replay(true);
    let keys = RecordKeys::new("idempotent:", "T9");
    let headers = common::message(Some("T9"));
    let invocation = Invocation::new("price").with_message(&headers);

    let owned = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(7u32) })
        .await
        .unwrap();
    assert_eq!(owned, 7);

    let mismatched = guard
        .execute(&options, &invocation, || async {
            Ok::<_, anyhow::Error>("never".to_string())
        })
        .await;
    assert!(matches!(mismatched, Err(IdempotencyError::Serialization(_))));
    assert_eq!(store.get(&keys.result).await.unwrap().as_deref(), Some("7"));

    let replayed = guard
        .execute(&options, &invocation, || async { Ok::<_, anyhow::Error>(8u32) })
        .await
        .unwrap();
    assert_eq!(replayed, 7);
    assert_eq!(store.get(&keys.result).await.unwrap().as_deref(), Some("7"));
    assert_eq!(guard.stats().snapshot().acquired, 1);
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_while_record_stays_processing() {
    let config = Arc::new(StaticConfigSource::from_pairs([(keys::MAX_WAIT_ATTEMPTS, "2")]));
    let (guard, store) = common::setup_guard_with(config);
    let options = IdempotentOptions::new().wait_and_replay(true);
    let runs = Arc::new(AtomicU32::new(0));

    store
        .set_if_absent("idempotent:T-stuck", "PROCESSING", Duration::from_secs(300))
        .await
        .unwrap();

    let request = common::sync_request(Some("T-stuck"));
    let sync = Invocation::new("reserve").with_request(&request);
    let counter = Arc::clone(&runs);
    let sync_result = guard
        .execute(&options, &sync, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;
    assert!(matches!(sync_result, Err(IdempotencyError::WaitTimedOut)));

    let headers = common::message(Some("T-stuck"));
    let asynchronous = Invocation::new("reserve").with_message(&headers);
    let counter = Arc::clone(&runs);
    let async_result = guard
        .execute(&options, &asynchronous, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(1u32)
        })
        .await
        .unwrap();
    assert_eq!(async_result, 0);

    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(guard.stats().snapshot().wait_timeouts, 2);
    assert_eq!(
        store.get("idempotent:T-stuck").await.unwrap().as_deref(),
        Some("PROCESSING")
    );
}

#[tokio::test(start_paused = true)]
async fn test_success_without_cached_result_times_out() {
    let config = Arc::new(StaticConfigSource::from_pairs([(keys::MAX_WAIT_ATTEMPTS, "3")]));
    let (guard, store) = common::setup_guard_with(config);
    let options = IdempotentOptions::new().wait_and_replay(true);
    let runs = Arc::new(AtomicU32::new(0));

    // Written by a fail-fast owner, so no payload was ever published.
    store
        .set_if_absent("idempotent:T-bare", "SUCCESS", Duration::from_secs(300))
        .await
        .unwrap();

    let request = common::sync_request(Some("T-bare"));
    let invocation = Invocation::new("reserve").with_request(&request);
    let counter = Arc::clone(&runs);
    let result = guard
        .execute(&options, &invocation, || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, anyhow::Error>(1u32)
        })
        .await;

    assert!(matches!(result, Err(IdempotencyError::WaitTimedOut)));
    assert_eq!(runs.load(Ordering::SeqCst), 0);
    assert_eq!(guard.stats().snapshot().replayed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_reopen_of_failed_record_runs_once() {
    let (guard, store) = common::setup_guard();
    let runs = Arc::new(AtomicU32::new(0));

    store
        .set_if_absent("idempotent:T-reopen", "FAILED", Duration::from_secs(300))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..10 {
        let guard = Arc::clone(&guard);
        let runs = Arc::clone(&runs);
        handles.push(tokio::spawn(async move {
            let request = common::sync_request(Some("T-reopen"));
            let invocation = Invocation::new("refund").with_request(&request);
            let options = IdempotentOptions::new().with_max_retry_count(3);

            guard
                .execute(&options, &invocation, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    Ok::<_, anyhow::Error>(1u32)
                })
                .await
        }));
    }

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(value) => {
                assert_eq!(value, 1);
                succeeded += 1;
            }
            Err(IdempotencyError::DuplicateRejected(_) | IdempotencyError::RetryExhausted) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(succeeded, 1);
    assert_eq!(guard.stats().snapshot().reopened, 1);
    assert_eq!(
        store.get("idempotent:T-reopen").await.unwrap().as_deref(),
        Some("SUCCESS")
    );
}
