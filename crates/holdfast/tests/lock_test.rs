//! Lock property tests
//!
//! Exercises the full acquire/hold/release lifecycle against the in-memory
//! coordination engine. One shared engine with several `LockService`
//! instances stands in for independent processes contending over the same
//! coordination service.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use holdfast::{Coordination, LockError, LockOptions, LockService, MemoryCoordination};

fn contender(engine: &Arc<MemoryCoordination>, options: LockOptions) -> LockService {
    LockService::new(engine.clone()).with_options(options)
}

#[tokio::test]
async fn test_five_contenders_single_winner() {
    let engine = Arc::new(MemoryCoordination::new());
    let key = "/app/lock/single-winner";

    let mut attempts = Vec::new();
    for _ in 0..5 {
        let service = contender(&engine, LockOptions::default());
        attempts.push(tokio::spawn(
            async move { service.try_acquire(key).await },
        ));
    }

    let mut held = Vec::new();
    let mut contended = 0;
    for attempt in attempts {
        match attempt.await.unwrap() {
            Ok(handle) => held.push(handle),
            Err(LockError::NotAcquired { .. }) => contended += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(held.len(), 1);
    assert_eq!(contended, 4);
    // Losing attempts reclaimed their leases; only the winner's remains.
    assert_eq!(engine.alive_leases(), 1);

    held[0].release().await;
    assert_eq!(engine.alive_leases(), 0);
}

#[tokio::test]
async fn test_release_then_reacquire() {
    let engine = Arc::new(MemoryCoordination::new());
    let service = contender(&engine, LockOptions::default());
    let key = "/app/lock/reacquire";

    let mut first = service.try_acquire(key).await.unwrap();
    assert!(first.is_held());
    first.release().await;

    let mut second = service.try_acquire(key).await.unwrap();
    assert!(second.is_held());
    second.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_severed_keep_alive_frees_lock_only_after_ttl() {
    let engine = Arc::new(MemoryCoordination::new());
    let holder = contender(&engine, LockOptions::default().with_ttl(2));
    let other = contender(&engine, LockOptions::default().with_ttl(2));
    let key = "/app/lock/ttl-backstop";

    let handle = holder.try_acquire(key).await.unwrap();
    let lease = handle.lease_id().expect("ttl lock carries a lease");

    // Simulated disconnection: no explicit release, no further renewal.
    assert!(engine.disconnect_lease(lease));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(matches!(
        other.try_acquire(key).await,
        Err(LockError::NotAcquired { .. })
    ));

    tokio::time::sleep(Duration::from_secs(2)).await;
    let mut taken_over = other.try_acquire(key).await.unwrap();
    assert!(taken_over.is_held());

    // The original holder observed the loss through its worker.
    assert!(handle.is_lost());
    taken_over.release().await;
}

#[tokio::test]
async fn test_panicking_body_still_releases() {
    let engine = Arc::new(MemoryCoordination::new());
    let service = contender(&engine, LockOptions::default());
    let key = "/app/lock/panic";

    let result = service
        .with_lock::<(), _, _>(key, || async { panic!("boom") })
        .await;
    match result {
        Err(LockError::BodyPanic(msg)) => assert!(msg.contains("boom")),
        other => panic!("expected BodyPanic, got {other:?}"),
    }

    // The panic did not skip release: the key is immediately free.
    let mut handle = service.try_acquire(key).await.unwrap();
    handle.release().await;
}

#[tokio::test]
async fn test_double_release_is_noop() {
    let engine = Arc::new(MemoryCoordination::new());
    let service = contender(&engine, LockOptions::default());
    let key = "/app/lock/double-release";

    let mut handle = service.try_acquire(key).await.unwrap();
    handle.release().await;
    assert_eq!(service.stats().total_releases, 1);
    assert_eq!(engine.alive_leases(), 0);

    // Second release: no error, no second revoke.
    handle.release().await;
    assert_eq!(service.stats().total_releases, 1);
    assert_eq!(engine.alive_leases(), 0);
}

#[tokio::test]
async fn test_with_lock_on_held_key_skips_body() {
    let engine = Arc::new(MemoryCoordination::new());
    let holder = contender(
        &engine,
        LockOptions::default().with_value(b"holder-1".as_slice()),
    );
    let other = contender(&engine, LockOptions::default());
    let key = "/app/lock/held";

    let mut guard = holder.try_acquire(key).await.unwrap();

    let invocations = Arc::new(AtomicUsize::new(0));
    let counter = invocations.clone();
    let result: Result<(), LockError> = other
        .with_lock(key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;

    match result {
        Err(LockError::NotAcquired { holder }) => {
            assert_eq!(holder.as_deref(), Some(b"holder-1".as_slice()));
        }
        other => panic!("expected NotAcquired, got {other:?}"),
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 0);

    guard.release().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_lease_reported_over_body_result() {
    let engine = Arc::new(MemoryCoordination::new());
    let service = contender(&engine, LockOptions::default().with_ttl(2));
    let key = "/app/lock/lost-mid-body";

    let body_engine = engine.clone();
    let result: Result<(), LockError> = service
        .with_lock(key, move || async move {
            // Sever our own lease's connectivity, then outlive the TTL.
            let lease = body_engine
                .lease_ids()
                .into_iter()
                .next()
                .expect("holder lease");
            assert!(body_engine.disconnect_lease(lease));
            tokio::time::sleep(Duration::from_secs(3)).await;
            Ok(())
        })
        .await;

    // The body succeeded, but exclusivity was gone: Lost wins.
    assert!(matches!(result, Err(LockError::Lost)));
    assert_eq!(service.stats().locks_lost, 1);

    // Release still ran and the key expired with its lease.
    let mut handle = service.try_acquire(key).await.unwrap();
    handle.release().await;
}

#[tokio::test]
async fn test_invalid_ttl_is_a_config_error() {
    let engine = Arc::new(MemoryCoordination::new());
    let key = "/app/lock/bad-ttl";

    let zero = contender(&engine, LockOptions::default().with_ttl(0));
    assert!(matches!(
        zero.try_acquire(key).await,
        Err(LockError::InvalidTtl(0))
    ));

    let negative = contender(&engine, LockOptions::default().with_ttl(-2));
    assert!(matches!(
        negative.try_acquire(key).await,
        Err(LockError::InvalidTtl(-2))
    ));

    // Rejected before any lease was granted.
    assert_eq!(engine.alive_leases(), 0);
}

#[tokio::test]
async fn test_plain_lock_without_lease() {
    let engine = Arc::new(MemoryCoordination::new());
    let service = contender(
        &engine,
        LockOptions::default()
            .without_lease()
            .with_value(b"plain".as_slice()),
    );
    let key = "/app/lock/plain";

    let mut handle = service.try_acquire(key).await.unwrap();
    assert_eq!(handle.lease_id(), None);
    assert_eq!(engine.alive_leases(), 0);
    assert_eq!(
        engine.get(key).await.unwrap().as_deref(),
        Some(b"plain".as_slice())
    );

    // Without a lease the key is deleted on release.
    handle.release().await;
    assert_eq!(engine.get(key).await.unwrap(), None);

    let mut again = service.try_acquire(key).await.unwrap();
    again.release().await;
}

#[tokio::test]
async fn test_local_gate_refuses_without_second_grant() {
    let engine = Arc::new(MemoryCoordination::new());
    let service = contender(&engine, LockOptions::default());
    let key = "/app/lock/local-gate";

    let mut held = service.try_acquire(key).await.unwrap();
    assert_eq!(engine.alive_leases(), 1);

    // Same-process second attempt is refused at the gate: no lease grant,
    // no transaction, no holder value.
    match service.try_acquire(key).await {
        Err(LockError::NotAcquired { holder }) => assert!(holder.is_none()),
        other => panic!("expected NotAcquired, got {other:?}"),
    }
    assert_eq!(engine.alive_leases(), 1);

    held.release().await;

    // The gate frees with the handle.
    let mut reacquired = service.try_acquire(key).await.unwrap();
    reacquired.release().await;

    let stats = service.stats();
    assert_eq!(stats.total_acquisitions, 2);
    assert_eq!(stats.failed_acquisitions, 1);
}
