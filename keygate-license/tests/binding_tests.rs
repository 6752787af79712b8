mod common;

use common::{configured_session, machine, Harness, DAY, START};
use keygate_license::{
    CapacityResource, ErrorCode, LicenseError, MachineFingerprint, UnbindAllowance, UnixTimestamp,
};
use proptest::prelude::*;
use std::time::Duration;

// ── Listing ──────────────────────────────────────────────────────

#[tokio::test]
async fn fresh_credential_has_no_bindings() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;

    let view = session.list_bindings().await.unwrap();
    assert_eq!(view.count(), 0);
    assert!(view.records.is_empty());
    assert_eq!(view.limit, 1);
    assert_eq!(view.unbind_limit, 3);
    assert_eq!(view.remaining_unbind_count_this_period, 3);
    assert!(!view.ip_binding_enabled);
    assert!(!session.machine_bound());
}

#[tokio::test]
async fn listing_requires_login() {
    let h = Harness::new();
    let session = h.configured().await;

    let err = session.list_bindings().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotAuthenticated);
}

// ── Bind ─────────────────────────────────────────────────────────

#[tokio::test]
async fn bind_records_this_machine() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;

    let view = session.bind_current_machine().await.unwrap();
    assert_eq!(view.count(), 1);
    let record = view.find(&machine("home").fingerprint).unwrap();
    assert_eq!(record.computer_name, "home");
    assert_eq!(record.os_version, "linux 6.1");
    assert_eq!(record.bind_timestamp, UnixTimestamp::from_secs(START));
    assert!(session.machine_bound());
}

#[tokio::test]
async fn binding_twice_is_a_no_op() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;

    session.bind_current_machine().await.unwrap();
    let view = session.bind_current_machine().await.unwrap();
    assert_eq!(view.count(), 1);
}

#[tokio::test]
async fn bind_beyond_limit_fails_and_leaves_set_unchanged() {
    let h = Harness::new();
    let home = h.logged_in("ABCD-1234").await;
    home.bind_current_machine().await.unwrap();

    let office = configured_session(&h.client_on("office")).await;
    office.login_with_card("ABCD-1234").await.unwrap();
    let err = office.bind_current_machine().await.unwrap_err();
    assert!(matches!(
        err,
        LicenseError::Capacity {
            resource: CapacityResource::Bindings,
            limit: 1
        }
    ));
    assert!(err.is_retryable());

    let view = office.list_bindings().await.unwrap();
    assert_eq!(view.count(), 1);
    assert!(view.contains(&machine("home").fingerprint));
    assert!(!view.contains(&machine("office").fingerprint));
    assert!(view.is_full());
}

#[tokio::test]
async fn login_refreshes_last_login_of_bound_machine() {
    let h = Harness::new();
    let first = h.logged_in("ABCD-1234").await;
    first.bind_current_machine().await.unwrap();
    first.logout().await.unwrap();

    h.advance(100);
    let second = h.configured().await;
    let outcome = second.login_with_card("ABCD-1234").await.unwrap();
    assert!(outcome.machine_bound);
    assert!(second.machine_bound());

    let view = second.list_bindings().await.unwrap();
    let record = view.find(&machine("home").fingerprint).unwrap();
    assert_eq!(record.bind_timestamp, UnixTimestamp::from_secs(START));
    assert_eq!(record.last_login_timestamp, UnixTimestamp::from_secs(START + 100));
}

// ── Unbind ───────────────────────────────────────────────────────

#[tokio::test]
async fn unbind_limit_holds_until_period_refreshes() {
    let h = Harness::new();
    let session = h.logged_in("TWO-SEATS").await;
    let home = machine("home").fingerprint;

    session.bind_current_machine().await.unwrap();
    let view = session.unbind(&home).await.unwrap();
    assert_eq!(view.count(), 0);
    assert_eq!(view.remaining_unbind_count_this_period, 0);
    assert!(!session.machine_bound());

    session.bind_current_machine().await.unwrap();
    let err = session.unbind(&home).await.unwrap_err();
    assert!(matches!(
        err,
        LicenseError::LimitExceeded {
            unbind_limit: 1,
            countdown_secs
        } if countdown_secs == DAY
    ));
    assert_eq!(err.retry_after(), Some(Duration::from_secs(DAY)));

    h.advance(DAY / 2);
    let view = session.list_bindings().await.unwrap();
    assert_eq!(view.count(), 1);
    assert_eq!(view.remaining_unbind_count_this_period, 0);
    assert_eq!(view.countdown_seconds_until_refresh, DAY / 2);
    assert!(session.unbind(&home).await.is_err());

    h.advance(DAY / 2);
    let view = session.unbind(&home).await.unwrap();
    assert_eq!(view.count(), 0);
    assert_eq!(view.remaining_unbind_count_this_period, 0);
    assert_eq!(view.countdown_seconds_until_refresh, DAY);
}

#[tokio::test]
async fn unbinding_an_unknown_machine_consumes_nothing() {
    let h = Harness::new();
    let session = h.logged_in("TWO-SEATS").await;

    let err = session
        .unbind(&MachineFingerprint::from_raw("fp-nowhere"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BindingNotFound);

    let view = session.list_bindings().await.unwrap();
    assert_eq!(view.remaining_unbind_count_this_period, 1);
}

#[tokio::test]
async fn another_machine_can_free_a_seat() {
    let h = Harness::new();
    let home = h.logged_in("ABCD-1234").await;
    home.bind_current_machine().await.unwrap();

    let office = configured_session(&h.client_on("office")).await;
    office.login_with_card("ABCD-1234").await.unwrap();
    office.unbind(&machine("home").fingerprint).await.unwrap();
    let view = office.bind_current_machine().await.unwrap();

    assert!(view.contains(&machine("office").fingerprint));
    assert_eq!(view.remaining_unbind_count_this_period, 2);
}

// ── Rebind and remarks ───────────────────────────────────────────

#[tokio::test]
async fn rebind_swaps_machines_in_one_step() {
    let h = Harness::new();
    let home = h.logged_in("ABCD-1234").await;
    home.bind_current_machine().await.unwrap();
    home.set_remark(&machine("home").fingerprint, "desk").await.unwrap();

    let office = configured_session(&h.client_on("office")).await;
    let outcome = office.login_with_card("ABCD-1234").await.unwrap();
    assert!(!outcome.machine_bound);

    let view = office.rebind(&machine("home").fingerprint).await.unwrap();
    assert_eq!(view.count(), 1);
    let record = view.find(&machine("office").fingerprint).unwrap();
    assert_eq!(record.remark, "desk");
    assert_eq!(view.remaining_unbind_count_this_period, 2);
    assert!(office.machine_bound());
}

#[tokio::test]
async fn rebind_of_unbound_machine_fails() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;

    let err = session
        .rebind(&MachineFingerprint::from_raw("fp-nowhere"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::BindingNotFound);
}

#[tokio::test]
async fn remark_is_stored_on_the_record() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;
    session.bind_current_machine().await.unwrap();

    let view = session
        .set_remark(&machine("home").fingerprint, "living room")
        .await
        .unwrap();
    assert_eq!(view.records[0].remark, "living room");
}

// ── Allowance ────────────────────────────────────────────────────

#[test]
fn allowance_resets_lazily_at_period_end() {
    let start = UnixTimestamp::from_secs(START);
    let mut allowance = UnbindAllowance::new(2, Duration::from_secs(DAY), start);

    allowance.consume(start).unwrap();
    allowance.consume(start.saturating_add(Duration::from_secs(10))).unwrap();
    assert_eq!(allowance.remaining(), 0);
    assert_eq!(allowance.countdown(start), DAY);

    let later = start.saturating_add(Duration::from_secs(DAY + 5));
    allowance.refresh(later);
    assert_eq!(allowance.remaining(), 2);
    assert_eq!(allowance.countdown(later), DAY);
}

#[test]
fn zero_limit_never_allows_unbind() {
    let start = UnixTimestamp::from_secs(START);
    let mut allowance = UnbindAllowance::new(0, Duration::from_secs(DAY), start);
    assert!(allowance.consume(start).is_err());
    let later = start.saturating_add(Duration::from_secs(3 * DAY));
    assert!(allowance.consume(later).is_err());
}

proptest! {
    #[test]
    fn allowance_stays_within_limit(
        limit in 0u32..5,
        steps in prop::collection::vec((0u64..50_000, any::<bool>()), 0..60),
    ) {
        let mut now = UnixTimestamp::from_secs(START);
        let mut allowance = UnbindAllowance::new(limit, Duration::from_secs(DAY), now);

        for (dt, attempt) in steps {
            now = now.saturating_add(Duration::from_secs(dt));
            allowance.refresh(now);
            prop_assert!(allowance.remaining() <= limit);
            prop_assert!(allowance.countdown(now) <= DAY);

            if attempt {
                let before = allowance.remaining();
                match allowance.consume(now) {
                    Ok(()) => prop_assert_eq!(allowance.remaining(), before - 1),
                    Err(LicenseError::LimitExceeded { unbind_limit, countdown_secs }) => {
                        prop_assert_eq!(before, 0);
                        prop_assert_eq!(unbind_limit, limit);
                        prop_assert!(countdown_secs > 0);
                    }
                    Err(e) => prop_assert!(false, "unexpected error: {}", e),
                }
            }
        }
    }
}
