mod common;

use common::{demo_conn, Harness, DAY, SOFTWARE_ID, START};
use keygate_license::{
    AuthReason, ConnectionConfig, ErrorCode, Identity, LicenseError, LoginMethod, PolicyFlag,
    PolicyFlags, SessionState, UnixTimestamp, Validation,
};
use std::time::Duration;

// ── Scenarios ────────────────────────────────────────────────────

#[tokio::test]
async fn card_login_grants_thirty_days_and_hundred_points() {
    let h = Harness::new();
    let session = h.configured().await;

    let result = session.login_with_card("ABCD-1234").await;
    let validation = Validation::from_result(&result);
    assert!(validation.success);
    assert_eq!(validation.code, ErrorCode::Ok);
    assert_eq!(validation.code.as_i32(), 0);

    let entitlement = session.get_entitlement().await.unwrap();
    assert_eq!(
        entitlement.expiry_timestamp,
        UnixTimestamp::from_secs(START + 30 * DAY)
    );
    assert_eq!(entitlement.balance, 100);
}

#[tokio::test]
async fn expired_card_is_rejected_and_no_session_is_established() {
    let h = Harness::new();
    let session = h.configured().await;

    let result = session.login_with_card("EXPIRED-CODE").await;
    let validation = Validation::from_result(&result);
    assert!(!validation.success);
    assert_eq!(validation.code, ErrorCode::Expired);
    assert_eq!(session.state(), SessionState::Configured);

    let err = session.get_entitlement().await.unwrap_err();
    assert!(matches!(err, LicenseError::Auth(_)));
    assert_eq!(err.code(), ErrorCode::NotAuthenticated);
}

#[tokio::test]
async fn forbidden_recharge_never_reaches_the_authority() {
    let h = Harness::new();
    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidRecharge, true));
    let session = h.logged_in("ABCD-1234").await;

    let calls_before = h.authority.call_count();
    let err = session.apply_recharge("RC-MONTH").await.unwrap_err();
    assert!(matches!(
        err,
        LicenseError::PolicyForbidden(PolicyFlag::ForbidRecharge)
    ));
    assert_eq!(h.authority.call_count(), calls_before);
}

// ── Creation ─────────────────────────────────────────────────────

#[tokio::test]
async fn new_session_starts_uninitialized_with_handshake_policy() {
    let h = Harness::new();
    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidTrial, true));
    let session = h.client.create_session().await.unwrap();

    assert_eq!(session.state(), SessionState::Uninitialized);
    assert!(session.connection().is_none());
    assert!(!session.is_allowed(PolicyFlag::ForbidTrial));
    assert!(session.is_allowed(PolicyFlag::ForbidLogin));
}

#[tokio::test]
async fn unreachable_authority_fails_allocation() {
    let h = Harness::new();
    h.authority.set_reachable(false);

    let err = h.client.create_session().await.unwrap_err();
    assert!(matches!(err, LicenseError::Allocation(_)));
    assert_eq!(err.code(), ErrorCode::Allocation);
}

#[tokio::test]
async fn sessions_have_distinct_ids() {
    let h = Harness::new();
    let a = h.client.create_session().await.unwrap();
    let b = h.client.create_session().await.unwrap();
    assert_ne!(a.id(), b.id());
}

// ── Connection ───────────────────────────────────────────────────

#[tokio::test]
async fn configure_moves_to_configured_and_may_repeat() {
    let h = Harness::new();
    let session = h.client.create_session().await.unwrap();

    session.configure_connection(demo_conn()).unwrap();
    assert_eq!(session.state(), SessionState::Configured);

    let other = ConnectionConfig::new(SOFTWARE_ID, "backup.example.com", 8443, Duration::from_secs(2))
        .with_interactive_prompt(true);
    session.configure_connection(other.clone()).unwrap();
    assert_eq!(session.connection(), Some(other));
}

#[tokio::test]
async fn invalid_connection_is_rejected() {
    let h = Harness::new();
    let session = h.client.create_session().await.unwrap();

    let zero_timeout = ConnectionConfig::new(SOFTWARE_ID, "auth.example.com", 443, Duration::ZERO);
    let err = session.configure_connection(zero_timeout).unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));

    let no_host = ConnectionConfig::new(SOFTWARE_ID, " ", 443, Duration::from_secs(1));
    assert!(session.configure_connection(no_host).is_err());

    let no_port = ConnectionConfig::new(SOFTWARE_ID, "auth.example.com", 0, Duration::from_secs(1));
    assert!(session.configure_connection(no_port).is_err());

    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn configure_after_login_is_misuse() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;

    let err = session.configure_connection(demo_conn()).unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn login_before_configure_is_misuse() {
    let h = Harness::new();
    let session = h.client.create_session().await.unwrap();

    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
    assert_eq!(session.state(), SessionState::Uninitialized);
}

#[tokio::test]
async fn unknown_software_id_is_a_protocol_error() {
    let h = Harness::new();
    let session = h.client.create_session().await.unwrap();
    session
        .configure_connection(ConnectionConfig::new(
            "other-app",
            "auth.example.com",
            443,
            Duration::from_secs(5),
        ))
        .unwrap();

    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Protocol);
    assert_eq!(session.state(), SessionState::Configured);
}

#[tokio::test]
async fn newer_protocol_version_is_rejected() {
    let h = Harness::new();
    let session = h.client.create_session().await.unwrap();
    session
        .configure_connection(demo_conn().with_protocol_version(99))
        .unwrap();

    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Protocol);
}

// ── Login exclusivity ────────────────────────────────────────────

#[tokio::test]
async fn second_login_after_card_login_is_misuse() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;

    let err = session
        .login_with_credentials("alice", "s3cret")
        .await
        .unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));

    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));

    let err = session.start_trial().await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));

    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.login_method(), Some(LoginMethod::Card));
}

#[tokio::test]
async fn card_login_after_user_login_is_misuse() {
    let h = Harness::new();
    let session = h.configured().await;
    session
        .login_with_credentials("alice", "s3cret")
        .await
        .unwrap();

    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
    assert_eq!(session.login_method(), Some(LoginMethod::User));
}

#[tokio::test]
async fn failed_login_leaves_other_method_available() {
    let h = Harness::new();
    let session = h.configured().await;

    let err = session.login_with_card("NO-SUCH-CARD").await.unwrap_err();
    assert!(matches!(
        err,
        LicenseError::Auth(AuthReason::InvalidCredential)
    ));
    assert_eq!(session.state(), SessionState::Configured);

    session
        .login_with_credentials("alice", "s3cret")
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
}

#[tokio::test]
async fn wrong_password_is_invalid_credential() {
    let h = Harness::new();
    let session = h.configured().await;

    let err = session
        .login_with_credentials("alice", "wrong")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCredential);
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn empty_card_key_is_rejected_without_a_call() {
    let h = Harness::new();
    let session = h.configured().await;
    let calls_before = h.authority.call_count();

    let err = session.login_with_card("   ").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidCredential);
    assert_eq!(h.authority.call_count(), calls_before);
}

#[tokio::test]
async fn banned_card_closes_the_session() {
    let h = Harness::new();
    let session = h.configured().await;

    let err = session.login_with_card("BANNED-CARD").await.unwrap_err();
    assert!(err.is_fatal());
    assert_eq!(err.code(), ErrorCode::Banned);
    assert_eq!(session.state(), SessionState::Closed);

    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
}

#[tokio::test]
async fn ban_during_session_closes_it_on_next_call() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;
    assert!(h.authority.set_banned(&Identity::card("ABCD-1234"), true));

    let err = session.get_entitlement().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Banned);
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn login_reports_connection_id_and_entitlement() {
    let h = Harness::new();
    let session = h.configured().await;

    let outcome = session.login_with_card("ABCD-1234").await.unwrap();
    assert_eq!(session.connection_id(), Some(outcome.connection_id));
    assert_eq!(session.cached_entitlement(), Some(outcome.entitlement));
    assert!(!outcome.machine_bound);
}

// ── Trial ────────────────────────────────────────────────────────

#[tokio::test]
async fn trial_grants_three_days() {
    let h = Harness::new();
    let session = h.configured().await;

    let outcome = session.start_trial().await.unwrap();
    assert_eq!(
        outcome.entitlement.expiry_timestamp,
        UnixTimestamp::from_secs(START + 3 * DAY)
    );
    assert_eq!(session.login_method(), Some(LoginMethod::Trial));
}

#[tokio::test]
async fn trial_cannot_be_restarted_after_it_runs_out() {
    let h = Harness::new();
    let first = h.configured().await;
    first.start_trial().await.unwrap();
    first.logout().await.unwrap();

    h.advance(4 * DAY);
    let second = h.configured().await;
    let err = second.start_trial().await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Expired);
}

#[tokio::test]
async fn forbidden_trial_short_circuits() {
    let h = Harness::new();
    let session = h.configured().await;
    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidTrial, true));
    session.refresh_policy().await.unwrap();

    let calls_before = h.authority.call_count();
    let err = session.start_trial().await.unwrap_err();
    assert!(matches!(
        err,
        LicenseError::PolicyForbidden(PolicyFlag::ForbidTrial)
    ));
    assert_eq!(h.authority.call_count(), calls_before);
    assert_eq!(session.state(), SessionState::Configured);
}

// ── Policy ───────────────────────────────────────────────────────

#[tokio::test]
async fn refreshed_policy_forbids_login() {
    let h = Harness::new();
    let session = h.configured().await;
    assert!(session.is_allowed(PolicyFlag::ForbidLogin));

    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidLogin, true));
    let flags = session.refresh_policy().await.unwrap();
    assert!(flags.forbid_login);

    let calls_before = h.authority.call_count();
    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::PolicyForbidden);
    assert_eq!(h.authority.call_count(), calls_before);
}

#[tokio::test]
async fn login_refreshes_policy() {
    let h = Harness::new();
    let session = h.configured().await;
    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidCloudCountQuery, true));

    session.login_with_card("ABCD-1234").await.unwrap();
    assert!(session.policy().forbid_cloud_count_query);
}

#[tokio::test]
async fn authority_enforces_policy_for_stale_snapshots() {
    let h = Harness::new();
    let session = h.configured().await;
    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidLogin, true));

    // The local snapshot still allows login; the authority refuses.
    let err = session.login_with_card("ABCD-1234").await.unwrap_err();
    assert!(matches!(
        err,
        LicenseError::PolicyForbidden(PolicyFlag::ForbidLogin)
    ));
    assert_eq!(session.state(), SessionState::Configured);
}

#[tokio::test]
async fn policy_snapshots_are_per_session() {
    let h = Harness::new();
    let a = h.configured().await;
    let b = h.configured().await;

    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidLogin, true));
    a.refresh_policy().await.unwrap();

    assert!(!a.is_allowed(PolicyFlag::ForbidLogin));
    assert!(b.is_allowed(PolicyFlag::ForbidLogin));
}

// ── Validation ───────────────────────────────────────────────────

#[tokio::test]
async fn validate_reports_structured_outcomes() {
    let h = Harness::new();
    let session = h.configured().await;

    let ok = session.validate(&Identity::card("ABCD-1234")).await;
    assert_eq!(ok, Validation::ok());

    let unknown = session.validate(&Identity::card("NOPE")).await;
    assert!(!unknown.success);
    assert_eq!(unknown.code, ErrorCode::InvalidCredential);
    assert!(!unknown.is_retryable());

    let expired = session.validate(&Identity::card("EXPIRED-CODE")).await;
    assert_eq!(expired.code, ErrorCode::Expired);

    let banned = session.validate(&Identity::card("BANNED-CARD")).await;
    assert_eq!(banned.code, ErrorCode::Banned);
    assert!(banned.code.is_fatal());

    // Validation never logs in.
    assert_eq!(session.state(), SessionState::Configured);
}

#[tokio::test]
async fn validate_distinguishes_network_failure() {
    let h = Harness::new();
    let session = h.configured().await;
    h.authority.set_reachable(false);

    let validation = session.validate(&Identity::user("alice", "s3cret")).await;
    assert!(!validation.success);
    assert_eq!(validation.code, ErrorCode::NetworkUnavailable);
    assert!(validation.is_retryable());
}

#[tokio::test]
async fn validate_before_configure_is_misuse() {
    let h = Harness::new();
    let session = h.client.create_session().await.unwrap();

    let validation = session.validate(&Identity::card("ABCD-1234")).await;
    assert_eq!(validation.code, ErrorCode::ProtocolMisuse);
}

#[tokio::test]
async fn validate_does_not_activate_a_card() {
    let h = Harness::new();
    let session = h.configured().await;
    session.validate(&Identity::card("ABCD-1234")).await;

    h.advance(5 * DAY);
    let outcome = session.login_with_card("ABCD-1234").await.unwrap();
    assert_eq!(
        outcome.entitlement.expiry_timestamp,
        UnixTimestamp::from_secs(START + 35 * DAY)
    );
}

// ── Registration ─────────────────────────────────────────────────

#[tokio::test]
async fn registered_user_inherits_card_value() {
    let h = Harness::new();
    let session = h.configured().await;
    session
        .register_user("bob", "hunter2", "FRESH-CARD")
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Configured);

    let outcome = session
        .login_with_credentials("bob", "hunter2")
        .await
        .unwrap();
    assert_eq!(
        outcome.entitlement.expiry_timestamp,
        UnixTimestamp::from_secs(START + 7 * DAY)
    );
    assert_eq!(outcome.entitlement.balance, 5);
}

#[tokio::test]
async fn registration_rejections() {
    let h = Harness::new();
    let session = h.configured().await;
    session
        .register_user("bob", "hunter2", "FRESH-CARD")
        .await
        .unwrap();

    let taken = session
        .register_user("bob", "other", "ABCD-1234")
        .await
        .unwrap_err();
    assert_eq!(taken.code(), ErrorCode::AlreadyExists);

    let spent = session
        .register_user("carol", "pw", "FRESH-CARD")
        .await
        .unwrap_err();
    assert_eq!(spent.code(), ErrorCode::AlreadyRedeemed);

    let unknown = session
        .register_user("carol", "pw", "NO-SUCH-CARD")
        .await
        .unwrap_err();
    assert_eq!(unknown.code(), ErrorCode::InvalidCode);

    let card_login = session.login_with_card("FRESH-CARD").await.unwrap_err();
    assert_eq!(card_login.code(), ErrorCode::InvalidCredential);
}

#[tokio::test]
async fn forbidden_registration_short_circuits() {
    let h = Harness::new();
    h.authority
        .set_policy(PolicyFlags::default().with(PolicyFlag::ForbidRegister, true));
    let session = h.configured().await;

    let calls_before = h.authority.call_count();
    let err = session
        .register_user("bob", "hunter2", "FRESH-CARD")
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::PolicyForbidden);
    assert_eq!(h.authority.call_count(), calls_before);
}

// ── Logout ───────────────────────────────────────────────────────

#[tokio::test]
async fn logout_is_idempotent_and_releases_the_connection() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;
    assert_eq!(h.authority.connection_count(), 1);

    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(h.authority.connection_count(), 0);
    assert!(session.connection_id().is_none());

    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn logout_succeeds_when_authority_is_gone() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;
    h.authority.set_reachable(false);

    session.logout().await.unwrap();
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn logout_from_any_state_closes() {
    let h = Harness::new();
    let fresh = h.client.create_session().await.unwrap();
    fresh.logout().await.unwrap();
    assert_eq!(fresh.state(), SessionState::Closed);

    let configured = h.configured().await;
    configured.close();
    assert_eq!(configured.state(), SessionState::Closed);
}

#[tokio::test]
async fn closed_session_rejects_operations() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;
    session.logout().await.unwrap();

    let err = session.get_entitlement().await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
    let err = session.configure_connection(demo_conn()).unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
    let err = session.refresh_policy().await.unwrap_err();
    assert!(matches!(err, LicenseError::ProtocolMisuse(_)));
}

#[tokio::test]
async fn dropping_an_authenticated_session_logs_out() {
    let h = Harness::new();
    let session = h.logged_in("ABCD-1234").await;
    assert_eq!(h.authority.connection_count(), 1);

    drop(session);
    for _ in 0..10 {
        if h.authority.connection_count() == 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(h.authority.connection_count(), 0);
}

// ── Isolation ────────────────────────────────────────────────────

#[tokio::test]
async fn sessions_do_not_share_state() {
    let h = Harness::new();
    let a = h.configured().await;
    let b = h.configured().await;

    a.login_with_card("ABCD-1234").await.unwrap();
    assert_eq!(a.state(), SessionState::Authenticated);
    assert_eq!(b.state(), SessionState::Configured);

    b.login_with_credentials("alice", "s3cret").await.unwrap();
    assert_eq!(a.login_method(), Some(LoginMethod::Card));
    assert_eq!(b.login_method(), Some(LoginMethod::User));
    assert_ne!(a.connection_id(), b.connection_id());

    let ea = a.get_entitlement().await.unwrap();
    let eb = b.get_entitlement().await.unwrap();
    assert_eq!(ea.balance, 100);
    assert_eq!(eb.balance, 20);
}
