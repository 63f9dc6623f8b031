// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use soulseek_client_rs::{
    error::SlskError,
    waiter::{WaitKey, Waiter},
};
use tokio_util::sync::CancellationToken;

fn key(code: u32, parts: &[&str]) -> WaitKey {
    let mut k = WaitKey::new(code);
    for p in parts {
        k = k.with(p);
    }
    k
}

#[tokio::test]
async fn test_complete_resolves_registered_wait() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let fut = waiter.wait::<u32>(key(3, &["bob"]), None, &cancel);
    assert!(waiter.complete(&key(3, &["bob"]), 7u32));
    assert_eq!(fut.await.expect("resolved"), 7);
    assert_eq!(waiter.pending_keys(), 0);
}

#[tokio::test]
async fn test_multiple_waiters_resolve_fifo() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();
    let k = key(40, &["bob", "1"]);

    let first = waiter.wait::<&'static str>(k.clone(), None, &cancel);
    let second = waiter.wait::<&'static str>(k.clone(), None, &cancel);

    assert!(waiter.complete(&k, "one"));
    assert!(waiter.complete(&k, "two"));
    assert_eq!(first.await.expect("first"), "one");
    assert_eq!(second.await.expect("second"), "two");
}

#[tokio::test]
async fn test_complete_on_unknown_key_is_noop() {
    let waiter = Waiter::new(Duration::from_secs(5));
    assert!(!waiter.complete(&key(99, &[]), 1u32));
}

#[tokio::test(start_paused = true)]
async fn test_wait_times_out_and_unregisters() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let res = waiter
        .wait::<u32>(key(1, &[]), Some(Duration::from_millis(50)), &cancel)
        .await;
    assert!(matches!(res, Err(SlskError::Timeout(_))));
    assert_eq!(waiter.pending_keys(), 0);
}

#[tokio::test]
async fn test_cancellation_fails_the_wait() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let fut = waiter.wait::<u32>(key(1, &[]), None, &cancel);
    cancel.cancel();
    assert!(matches!(fut.await, Err(SlskError::Cancelled(_))));
    assert_eq!(waiter.pending_keys(), 0);
}

#[tokio::test]
async fn test_throw_resolves_head_with_error() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();
    let k = key(41, &["bob", "5"]);

    let fut = waiter.wait::<u32>(k.clone(), None, &cancel);
    assert!(waiter.throw(&k, SlskError::UserOffline("bob".into())));
    assert!(matches!(fut.await, Err(SlskError::UserOffline(_))));
}

#[tokio::test]
async fn test_throw_matching_fails_all_keys_mentioning_user() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let doomed = waiter.wait::<u32>(key(40, &["bob", "f.mp3"]), None, &cancel);
    let survivor = waiter.wait::<u32>(key(40, &["carol", "g.mp3"]), None, &cancel);

    waiter.throw_matching("bob", || SlskError::connection("bob went away"));

    assert!(matches!(doomed.await, Err(SlskError::Connection { .. })));
    assert!(waiter.complete(&key(40, &["carol", "g.mp3"]), 1u32));
    assert_eq!(survivor.await.expect("survives"), 1);
}

#[tokio::test]
async fn test_dropped_wait_leaves_no_orphan_slot() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let fut = waiter.wait::<u32>(key(1, &[]), None, &cancel);
    assert_eq!(waiter.pending_keys(), 1);
    drop(fut);
    assert_eq!(waiter.pending_keys(), 0);
}

#[tokio::test]
async fn test_registration_is_eager() {
    // The slot must exist before the future is first polled, so a response
    // racing the request cannot be lost.
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let fut = waiter.wait::<u32>(key(2, &[]), None, &cancel);
    assert_eq!(waiter.pending_keys(), 1);
    assert!(waiter.complete(&key(2, &[]), 11u32));
    assert_eq!(fut.await.expect("resolved"), 11);
}

#[tokio::test]
async fn test_cancel_all_drains_everything() {
    let waiter = Waiter::new(Duration::from_secs(5));
    let cancel = CancellationToken::new();

    let a = waiter.wait::<u32>(key(1, &[]), None, &cancel);
    let b = waiter.wait::<u32>(key(2, &["x"]), None, &cancel);
    waiter.cancel_all();
    assert!(matches!(a.await, Err(SlskError::Cancelled(_))));
    assert!(matches!(b.await, Err(SlskError::Cancelled(_))));
    assert_eq!(waiter.pending_keys(), 0);
}

#[tokio::test]
async fn test_zero_timeout_means_indefinite() {
    let waiter = Waiter::new(Duration::ZERO);
    let cancel = CancellationToken::new();
    let k = key(9, &[]);

    // Default timeout of zero disables the bound entirely; resolve it from
    // another task after a real delay.
    let fut = waiter.wait::<u32>(k.clone(), None, &cancel);
    let waiter_ref = &waiter;
    let resolve = async {
        tokio::time::sleep(Duration::from_millis(20)).await;
        waiter_ref.complete(&k, 5u32);
    };
    let (res, ()) = tokio::join!(fut, resolve);
    assert_eq!(res.expect("resolved"), 5);
}
