use std::time::Duration;

use npio_enumerator::{Cancellable, IOErrorEnum};
use tokio::time::timeout;

#[test]
fn test_check_reports_cancellation() {
    let cancellable = Cancellable::new();
    assert!(cancellable.check().is_ok());

    cancellable.cancel();
    cancellable.cancel();
    assert!(cancellable.is_cancelled());
    let err = cancellable.check().unwrap_err();
    assert_eq!(err.kind(), IOErrorEnum::Cancelled);
    assert!(err.is_cancelled());
}

#[test]
fn test_clones_share_state() {
    let cancellable = Cancellable::new();
    let clone = cancellable.clone();
    clone.cancel();
    assert!(cancellable.is_cancelled());
    assert!(cancellable.ptr_eq(&clone));
    assert!(!cancellable.ptr_eq(&Cancellable::new()));
}

#[test]
fn test_current_scopes_nest() {
    let outer = Cancellable::new();
    let inner = Cancellable::new();
    assert!(Cancellable::current().is_none());

    {
        let _outer = outer.push_current();
        assert!(Cancellable::current().unwrap().ptr_eq(&outer));
        {
            let _inner = inner.push_current();
            assert!(Cancellable::current().unwrap().ptr_eq(&inner));
        }
        assert!(Cancellable::current().unwrap().ptr_eq(&outer));
    }
    assert!(Cancellable::current().is_none());
}

#[test]
fn test_current_is_per_thread() {
    let cancellable = Cancellable::new();
    let _guard = cancellable.push_current();

    let seen = std::thread::spawn(|| Cancellable::current().is_some())
        .join()
        .unwrap();
    assert!(!seen);
    assert!(Cancellable::current().is_some());
}

#[test]
fn test_out_of_order_guards_remove_their_own_entry() {
    let first = Cancellable::new();
    let second = Cancellable::new();

    let first_guard = first.push_current();
    let second_guard = second.push_current();
    drop(first_guard);
    assert!(Cancellable::current().unwrap().ptr_eq(&second));
    drop(second_guard);
    assert!(Cancellable::current().is_none());
}

#[tokio::test]
async fn test_cancelled_future_wakes_on_cancel() {
    let cancellable = Cancellable::new();
    let waiter = cancellable.clone();
    let task = tokio::spawn(async move { waiter.cancelled().await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    cancellable.cancel();
    timeout(Duration::from_secs(2), task)
        .await
        .expect("cancelled() never resolved")
        .unwrap();
}

#[tokio::test]
async fn test_cancelled_future_resolves_when_already_cancelled() {
    let cancellable = Cancellable::new();
    cancellable.cancel();
    timeout(Duration::from_millis(500), cancellable.cancelled())
        .await
        .expect("cancelled() should resolve immediately");
}
