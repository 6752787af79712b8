//! Sessions: the owned, per-caller view of one login at the authority.
//!
//! A [`Client`] holds what every session shares (the authority handle, the
//! process config, the machine identity). Each [`Session`] it creates is an
//! isolated state machine:
//!
//! ```text
//! Uninitialized -> Configured -> AuthPending -> Authenticated -> Closed
//! ```
//!
//! Authority calls made through one session are serialized, bounded by the
//! session's connection timeout, and preceded by a policy check that fails
//! without a round-trip when the action is forbidden.

use crate::authority::{bounded, with_timeout, Authority, LoginGrant};
use crate::binding::BindingSetView;
use crate::cache::{CachedEntitlement, EntitlementCache, OfflineEntitlement};
use crate::config::{ClientConfig, ConnectionConfig};
use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{mask, LicenseError, LicenseResult};
use crate::ledger::{Entitlement, RechargeTransaction};
use crate::policy::{PolicyFlag, PolicyFlags, PolicyGate};
use crate::presence::OnlineSessionRecord;
use crate::validator::{CredentialValidator, Identity, LoginMethod, Validation};
use keygate_types::{Clock, ConnectionId, SessionId, SessionToken, SystemClock};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created, no connection configured yet.
    #[default]
    Uninitialized,
    /// Connection configured, not logged in.
    Configured,
    /// A login call is in flight.
    AuthPending,
    Authenticated,
    /// Terminal.
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Uninitialized => "uninitialized",
            Self::Configured => "configured",
            Self::AuthPending => "auth_pending",
            Self::Authenticated => "authenticated",
            Self::Closed => "closed",
        })
    }
}

/// Result of a successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginOutcome {
    pub connection_id: ConnectionId,
    pub entitlement: Entitlement,
    /// Whether this machine is already bound to the credential.
    pub machine_bound: bool,
}

/// Entry point: creates sessions against one authority.
pub struct Client {
    authority: Arc<dyn Authority>,
    config: ClientConfig,
    machine: MachineInfo,
    clock: Arc<dyn Clock>,
}

impl Client {
    /// Creates a client. The machine identity is collected now unless the
    /// config overrides it.
    pub fn new(authority: Arc<dyn Authority>, config: ClientConfig) -> Self {
        let machine = config.machine.clone().unwrap_or_else(MachineInfo::collect);
        Self {
            authority,
            config,
            machine,
            clock: Arc::new(SystemClock),
        }
    }

    /// Reads time from `clock` for cache timestamps and staleness checks.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    #[must_use]
    pub fn machine(&self) -> &MachineInfo {
        &self.machine
    }

    /// Handshakes with the authority and allocates a new session.
    ///
    /// # Errors
    ///
    /// [`LicenseError::Allocation`] if the authority cannot be reached within
    /// the handshake timeout or answers nonsense.
    pub async fn create_session(&self) -> LicenseResult<Session> {
        let handshake = bounded(self.config.handshake_timeout, self.authority.handshake())
            .await
            .map_err(|e| LicenseError::Allocation(format!("authority handshake failed: {e}")))?;
        if handshake.protocol_version == 0 {
            return Err(LicenseError::Allocation(
                "authority reported protocol version 0".into(),
            ));
        }

        let session = Session {
            id: SessionId::new(),
            authority: Arc::clone(&self.authority),
            validator: CredentialValidator::new(Arc::clone(&self.authority)),
            gate: PolicyGate::new(handshake.policy),
            machine: self.machine.clone(),
            cache_root: self.config.cache_dir.clone(),
            clock: Arc::clone(&self.clock),
            inner: Mutex::new(Inner::default()),
            call_lock: tokio::sync::Mutex::new(()),
        };
        info!(session_id = %session.id, authority_version = handshake.protocol_version, "session created");
        Ok(session)
    }

    /// Reads the cached entitlement of `identity` without contacting the
    /// authority.
    ///
    /// Returns `None` when caching is disabled or nothing is cached. With an
    /// authority public key configured, the cached token's signature is
    /// verified first.
    pub fn offline_entitlement(
        &self,
        software_id: &str,
        identity: &Identity,
    ) -> LicenseResult<Option<OfflineEntitlement>> {
        let Some(root) = &self.config.cache_dir else {
            return Ok(None);
        };
        EntitlementCache::new(root, software_id).evaluate(
            identity,
            self.config.authority_public_key.as_ref(),
            self.config.offline_grace,
            self.clock.now(),
        )
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .field("machine", &self.machine)
            .finish_non_exhaustive()
    }
}

struct Login {
    identity: Identity,
    token: SessionToken,
    connection_id: ConnectionId,
    machine_bound: bool,
}

#[derive(Default)]
struct Inner {
    state: SessionState,
    conn: Option<ConnectionConfig>,
    login: Option<Login>,
    /// Last entitlement reported by the authority.
    entitlement: Option<Entitlement>,
}

/// One validation session.
///
/// All methods take `&self`; a session may be shared across tasks behind an
/// `Arc`, and its authority calls still go out one at a time.
pub struct Session {
    id: SessionId,
    authority: Arc<dyn Authority>,
    validator: CredentialValidator,
    gate: PolicyGate,
    machine: MachineInfo,
    cache_root: Option<PathBuf>,
    clock: Arc<dyn Clock>,
    inner: Mutex<Inner>,
    call_lock: tokio::sync::Mutex<()>,
}

/// Puts a session left in `AuthPending` back to `Configured` when a login
/// future is dropped before it completes.
struct PendingLogin<'a> {
    inner: &'a Mutex<Inner>,
    session_id: SessionId,
    armed: bool,
}

impl PendingLogin<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingLogin<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.state == SessionState::AuthPending {
            inner.state = SessionState::Configured;
            debug!(session_id = %self.session_id, "login cancelled");
        }
    }
}

impl Session {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Accessors ────────────────────────────────────────────────

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.id
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    #[must_use]
    pub fn connection(&self) -> Option<ConnectionConfig> {
        self.lock().conn.clone()
    }

    /// Connection id assigned by the authority at login.
    #[must_use]
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.lock().login.as_ref().map(|l| l.connection_id)
    }

    #[must_use]
    pub fn login_method(&self) -> Option<LoginMethod> {
        self.lock().login.as_ref().map(|l| l.identity.method())
    }

    /// Whether this machine is bound to the logged-in credential, as last
    /// reported by the authority.
    #[must_use]
    pub fn machine_bound(&self) -> bool {
        self.lock().login.as_ref().is_some_and(|l| l.machine_bound)
    }

    #[must_use]
    pub fn machine(&self) -> &MachineInfo {
        &self.machine
    }

    /// Current policy snapshot.
    #[must_use]
    pub fn policy(&self) -> PolicyFlags {
        self.gate.snapshot()
    }

    /// Returns true if the action behind `flag` is currently allowed.
    #[must_use]
    pub fn is_allowed(&self, flag: PolicyFlag) -> bool {
        self.gate.check(flag)
    }

    /// The entitlement from the last login, recharge or entitlement query.
    #[must_use]
    pub fn cached_entitlement(&self) -> Option<Entitlement> {
        self.lock().entitlement
    }

    // ── Connection ───────────────────────────────────────────────

    /// Sets where and how this session talks to the authority.
    ///
    /// Allowed before login and may be repeated to reconfigure. After a
    /// login has started it fails with [`LicenseError::ProtocolMisuse`].
    pub fn configure_connection(&self, conn: ConnectionConfig) -> LicenseResult<()> {
        conn.validate()?;
        let mut inner = self.lock();
        match inner.state {
            SessionState::Uninitialized | SessionState::Configured => {
                debug!(session_id = %self.id, endpoint = %conn.endpoint(), software_id = %conn.software_id, "connection configured");
                inner.conn = Some(conn);
                inner.state = SessionState::Configured;
                Ok(())
            }
            state => Err(LicenseError::ProtocolMisuse(format!(
                "cannot configure connection in state {state}"
            ))),
        }
    }

    /// Connection for calls that need no login.
    fn configured(&self) -> LicenseResult<ConnectionConfig> {
        let inner = self.lock();
        match (&inner.state, &inner.conn) {
            (SessionState::Closed, _) => Err(closed()),
            (_, Some(conn)) => Ok(conn.clone()),
            (_, None) => Err(LicenseError::ProtocolMisuse(
                "connection is not configured".into(),
            )),
        }
    }

    /// Connection and token for calls that need a login.
    fn authenticated(&self) -> LicenseResult<(ConnectionConfig, SessionToken)> {
        let inner = self.lock();
        match (&inner.state, &inner.conn, &inner.login) {
            (SessionState::Authenticated, Some(conn), Some(login)) => {
                Ok((conn.clone(), login.token.clone()))
            }
            (SessionState::Closed, _, _) => Err(closed()),
            _ => Err(LicenseError::not_authenticated()),
        }
    }

    /// Waits for the session's previous call to finish. A call still queued
    /// when the session closes is cancelled instead of sent.
    async fn turn(&self) -> LicenseResult<tokio::sync::MutexGuard<'_, ()>> {
        let guard = self.call_lock.lock().await;
        if self.lock().state == SessionState::Closed {
            debug!(session_id = %self.id, "queued call cancelled by close");
            return Err(LicenseError::Cancelled);
        }
        Ok(guard)
    }

    /// Closes the session if the authority reported a fatal error.
    fn observe<T>(&self, result: LicenseResult<T>) -> LicenseResult<T> {
        if let Err(e) = &result
            && e.is_fatal()
        {
            warn!(session_id = %self.id, error = %e, "fatal authority error, closing session");
            let mut inner = self.lock();
            inner.state = SessionState::Closed;
            inner.login = None;
        }
        result
    }

    // ── Login ────────────────────────────────────────────────────

    /// Logs in with a card key.
    pub async fn login_with_card(&self, card_key: &str) -> LicenseResult<LoginOutcome> {
        self.login(Identity::card(card_key)).await
    }

    /// Logs in with a username and password.
    pub async fn login_with_credentials(
        &self,
        username: &str,
        password: &str,
    ) -> LicenseResult<LoginOutcome> {
        self.login(Identity::user(username, password)).await
    }

    /// Logs in with this machine's trial.
    pub async fn start_trial(&self) -> LicenseResult<LoginOutcome> {
        self.login(Identity::trial(self.machine.fingerprint.clone()))
            .await
    }

    async fn login(&self, identity: Identity) -> LicenseResult<LoginOutcome> {
        let conn = self.begin_login(&identity)?;
        let pending = PendingLogin {
            inner: &self.inner,
            session_id: self.id,
            armed: true,
        };

        let result = {
            let _call = self.call_lock.lock().await;
            self.validator.login(&conn, &identity, &self.machine).await
        };

        let orphaned = {
            let mut inner = self.lock();
            pending.disarm();
            if inner.state == SessionState::AuthPending {
                return self.finish_login(&mut inner, identity, result);
            }
            result.ok().map(|grant| grant.token)
        };

        // Closed while the call was in flight: hand the seat back.
        if let Some(token) = orphaned {
            let _call = self.call_lock.lock().await;
            match with_timeout(&conn, self.authority.logout(&conn, &token)).await {
                Ok(()) => debug!(session_id = %self.id, "orphaned login released"),
                Err(e) => warn!(session_id = %self.id, error = %e, "orphaned login not released"),
            }
        }
        Err(closed())
    }

    /// Applies a login result to a session still in `AuthPending`.
    fn finish_login(
        &self,
        inner: &mut Inner,
        identity: Identity,
        result: LicenseResult<LoginGrant>,
    ) -> LicenseResult<LoginOutcome> {
        match result {
            Ok(grant) => {
                self.gate.update(grant.policy);
                let outcome = LoginOutcome {
                    connection_id: grant.connection_id,
                    entitlement: grant.entitlement,
                    machine_bound: grant.machine_bound,
                };
                info!(
                    session_id = %self.id,
                    connection_id = %grant.connection_id,
                    method = ?identity.method(),
                    "logged in"
                );
                inner.login = Some(Login {
                    identity,
                    token: grant.token,
                    connection_id: grant.connection_id,
                    machine_bound: grant.machine_bound,
                });
                inner.entitlement = Some(grant.entitlement);
                inner.state = SessionState::Authenticated;
                Ok(outcome)
            }
            Err(e) => {
                inner.state = if e.is_fatal() {
                    SessionState::Closed
                } else {
                    SessionState::Configured
                };
                info!(session_id = %self.id, method = ?identity.method(), code = %e.code(), "login rejected");
                Err(e)
            }
        }
    }

    /// Moves `Configured` to `AuthPending`, or explains why not.
    fn begin_login(&self, identity: &Identity) -> LicenseResult<ConnectionConfig> {
        let mut inner = self.lock();
        let conn = match (inner.state, &inner.conn) {
            (SessionState::Configured, Some(conn)) => conn.clone(),
            (SessionState::Authenticated, _) => {
                let method = inner.login.as_ref().map(|l| l.identity.method());
                return Err(LicenseError::ProtocolMisuse(format!(
                    "session is already logged in ({method:?}); one login per session"
                )));
            }
            (SessionState::AuthPending, _) => {
                return Err(LicenseError::ProtocolMisuse(
                    "a login is already in progress".into(),
                ));
            }
            (SessionState::Closed, _) => return Err(closed()),
            _ => {
                return Err(LicenseError::ProtocolMisuse(
                    "configure the connection before logging in".into(),
                ));
            }
        };
        self.gate.require(login_flag(identity.method()))?;
        inner.state = SessionState::AuthPending;
        if let Identity::Card { card_key } = identity {
            debug!(session_id = %self.id, card = %mask(card_key), "card login started");
        } else {
            debug!(session_id = %self.id, method = ?identity.method(), "login started");
        }
        Ok(conn)
    }

    /// Checks a credential without logging in.
    ///
    /// Never fails: every outcome, misuse included, comes back as a
    /// [`Validation`] carrying its code.
    pub async fn validate(&self, identity: &Identity) -> Validation {
        let conn = match self.configured() {
            Ok(conn) => conn,
            Err(e) => return Validation::rejected(e.code()),
        };
        if let Err(e) = self.gate.require(login_flag(identity.method())) {
            return Validation::rejected(e.code());
        }
        let _call = self.call_lock.lock().await;
        self.validator.validate(&conn, identity).await
    }

    /// Creates a user account funded by an unused card. Does not log in.
    pub async fn register_user(
        &self,
        username: &str,
        password: &str,
        card_key: &str,
    ) -> LicenseResult<()> {
        let conn = self.configured()?;
        self.gate.require(PolicyFlag::ForbidRegister)?;
        let _call = self.call_lock.lock().await;
        with_timeout(
            &conn,
            self.authority.register(&conn, username, password, card_key),
        )
        .await?;
        info!(session_id = %self.id, %username, "user registered");
        Ok(())
    }

    /// Reloads the policy flags from the authority.
    pub async fn refresh_policy(&self) -> LicenseResult<PolicyFlags> {
        let conn = self.configured()?;
        let _call = self.call_lock.lock().await;
        let flags = with_timeout(&conn, self.authority.policy(&conn)).await?;
        self.gate.update(flags);
        debug!(session_id = %self.id, ?flags, "policy refreshed");
        Ok(flags)
    }

    /// Ends the session. Idempotent.
    ///
    /// The authority is told about the logout on a best-effort basis; a
    /// failure to reach it is logged and the session closes regardless.
    pub async fn logout(&self) -> LicenseResult<()> {
        let (conn, login) = {
            let mut inner = self.lock();
            if inner.state == SessionState::Closed {
                return Ok(());
            }
            inner.state = SessionState::Closed;
            (inner.conn.clone(), inner.login.take())
        };

        if let (Some(conn), Some(login)) = (conn, login) {
            let _call = self.call_lock.lock().await;
            match with_timeout(&conn, self.authority.logout(&conn, &login.token)).await {
                Ok(()) => info!(session_id = %self.id, connection_id = %login.connection_id, "logged out"),
                Err(e) => warn!(session_id = %self.id, error = %e, "logout not acknowledged by authority"),
            }
        } else {
            debug!(session_id = %self.id, "session closed");
        }
        Ok(())
    }

    /// Closes the session without contacting the authority.
    ///
    /// The authority drops the connection on its own schedule.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.state != SessionState::Closed {
            inner.state = SessionState::Closed;
            inner.login = None;
            debug!(session_id = %self.id, "session closed");
        }
    }

    // ── Entitlement ──────────────────────────────────────────────

    /// Fetches the credential's entitlement and refreshes the offline cache.
    pub async fn get_entitlement(&self) -> LicenseResult<Entitlement> {
        let (conn, token) = self.authenticated()?;
        let signed = {
            let _call = self.turn().await?;
            self.observe(with_timeout(&conn, self.authority.entitlement(&conn, &token)).await)?
        };

        let identity = {
            let mut inner = self.lock();
            inner.entitlement = Some(signed.entitlement);
            inner.login.as_ref().map(|l| l.identity.clone())
        };
        if let (Some(root), Some(identity)) = (&self.cache_root, identity) {
            let entry = CachedEntitlement {
                entitlement: signed.entitlement,
                token: signed.token,
                fetched_at: self.clock.now(),
            };
            if let Err(e) = EntitlementCache::new(root, &conn.software_id).store(&identity, &entry) {
                warn!(session_id = %self.id, error = %e, "failed to cache entitlement");
            }
        }
        Ok(signed.entitlement)
    }

    /// Redeems one recharge code.
    pub async fn apply_recharge(&self, code: &str) -> LicenseResult<RechargeTransaction> {
        self.apply_recharge_batch(&[code.to_string()]).await
    }

    /// Redeems several codes at once: either all are consumed or none is.
    pub async fn apply_recharge_batch(
        &self,
        codes: &[String],
    ) -> LicenseResult<RechargeTransaction> {
        let (conn, token) = self.authenticated()?;
        self.gate.require(PolicyFlag::ForbidRecharge)?;
        if codes.is_empty() {
            return Err(LicenseError::InvalidCode("no recharge code given".into()));
        }

        let tx = {
            let _call = self.turn().await?;
            self.observe(with_timeout(&conn, self.authority.recharge(&conn, &token, codes)).await)?
        };
        self.lock().entitlement = Some(tx.resulting_entitlement());
        info!(
            session_id = %self.id,
            units = tx.units_redeemed,
            extended_by_secs = tx.extended_by_secs(),
            points = tx.points_credited(),
            "recharge applied"
        );
        Ok(tx)
    }

    // ── Bindings ─────────────────────────────────────────────────

    pub async fn list_bindings(&self) -> LicenseResult<BindingSetView> {
        let (conn, token) = self.authenticated()?;
        let view = {
            let _call = self.turn().await?;
            self.observe(with_timeout(&conn, self.authority.bindings(&conn, &token)).await)?
        };
        self.note_binding(&view);
        Ok(view)
    }

    /// Binds this machine to the credential. Binding an already bound
    /// machine is a no-op.
    pub async fn bind_current_machine(&self) -> LicenseResult<BindingSetView> {
        let (conn, token) = self.authenticated()?;
        let view = {
            let _call = self.turn().await?;
            self.observe(
                with_timeout(&conn, self.authority.bind(&conn, &token, &self.machine)).await,
            )?
        };
        self.note_binding(&view);
        info!(session_id = %self.id, bound = view.count(), limit = view.limit, "machine bound");
        Ok(view)
    }

    /// Unbinds a machine, consuming one unbind of the current period.
    pub async fn unbind(&self, fingerprint: &MachineFingerprint) -> LicenseResult<BindingSetView> {
        let (conn, token) = self.authenticated()?;
        let view = {
            let _call = self.turn().await?;
            self.observe(
                with_timeout(&conn, self.authority.unbind(&conn, &token, fingerprint)).await,
            )?
        };
        self.note_binding(&view);
        info!(
            session_id = %self.id,
            %fingerprint,
            remaining = view.remaining_unbind_count_this_period,
            "machine unbound"
        );
        Ok(view)
    }

    /// Replaces the binding of `old` with this machine, consuming one unbind.
    pub async fn rebind(&self, old: &MachineFingerprint) -> LicenseResult<BindingSetView> {
        let (conn, token) = self.authenticated()?;
        let view = {
            let _call = self.turn().await?;
            self.observe(
                with_timeout(&conn, self.authority.rebind(&conn, &token, old, &self.machine))
                    .await,
            )?
        };
        self.note_binding(&view);
        info!(session_id = %self.id, %old, "machine rebound");
        Ok(view)
    }

    /// Sets the free-text remark of a bound machine.
    pub async fn set_remark(
        &self,
        fingerprint: &MachineFingerprint,
        remark: &str,
    ) -> LicenseResult<BindingSetView> {
        let (conn, token) = self.authenticated()?;
        let view = {
            let _call = self.turn().await?;
            self.observe(
                with_timeout(
                    &conn,
                    self.authority.set_remark(&conn, &token, fingerprint, remark),
                )
                .await,
            )?
        };
        self.note_binding(&view);
        Ok(view)
    }

    fn note_binding(&self, view: &BindingSetView) {
        if let Some(login) = self.lock().login.as_mut() {
            login.machine_bound = view.contains(&self.machine.fingerprint);
        }
    }

    // ── Presence ─────────────────────────────────────────────────

    /// Lists clients online under this credential, most recent first.
    pub async fn list_online(&self) -> LicenseResult<Vec<OnlineSessionRecord>> {
        let (conn, token) = self.authenticated()?;
        self.gate.require(PolicyFlag::ForbidCloudCountQuery)?;
        let _call = self.turn().await?;
        self.observe(with_timeout(&conn, self.authority.online(&conn, &token)).await)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state != SessionState::Authenticated {
            return;
        }
        let (Some(conn), Some(login)) = (inner.conn.take(), inner.login.take()) else {
            return;
        };
        // Best effort: tell the authority the connection is gone if a
        // runtime is around to carry the call.
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let authority = Arc::clone(&self.authority);
            let session_id = self.id;
            handle.spawn(async move {
                if let Err(e) = with_timeout(&conn, authority.logout(&conn, &login.token)).await {
                    debug!(%session_id, error = %e, "logout on drop failed");
                }
            });
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn login_flag(method: LoginMethod) -> PolicyFlag {
    match method {
        LoginMethod::Trial => PolicyFlag::ForbidTrial,
        LoginMethod::Card | LoginMethod::User => PolicyFlag::ForbidLogin,
    }
}

fn closed() -> LicenseError {
    LicenseError::ProtocolMisuse("session is closed".into())
}
