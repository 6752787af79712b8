//! In-memory reference authority.
//!
//! Holds cards, users, recharge codes, bindings and online connections in a
//! single mutex so every operation is atomic. The HTTP server in
//! `keygate-authority` serves this type; tests drive it directly.

use super::{Authority, Handshake, LoginGrant, SignedEntitlement};
use crate::binding::{BindingSetView, MachineBindingRecord, UnbindAllowance};
use crate::config::ConnectionConfig;
use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{mask, AuthReason, CapacityResource, LicenseError, LicenseResult};
use crate::ledger::{Entitlement, RechargeTransaction, RechargeValue};
use crate::policy::{PolicyFlag, PolicyFlags};
use crate::presence::OnlineSessionRecord;
use crate::token::{sign_claims, EntitlementClaims};
use crate::validator::{hash_subject, Identity};
use crate::wire::PROTOCOL_VERSION;
use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use keygate_types::{Clock, ConnectionId, SessionToken, SystemClock, UnixTimestamp};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

/// Per-credential caps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AccountLimits {
    /// Maximum number of bound machines.
    pub binding_limit: u32,
    /// Unbinds allowed per period.
    pub unbind_limit: u32,
    pub unbind_period_secs: u64,
    /// Maximum concurrent online connections; 0 means unlimited.
    pub max_online: u32,
    pub ip_binding: bool,
}

impl Default for AccountLimits {
    fn default() -> Self {
        Self {
            binding_limit: 1,
            unbind_limit: 3,
            unbind_period_secs: 24 * 60 * 60,
            max_online: 0,
            ip_binding: false,
        }
    }
}

/// A card key. Its validity starts counting at first login.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardSpec {
    pub card_key: String,
    pub duration_secs: u64,
    #[serde(default)]
    pub points: u64,
    /// Pre-activates the card with this expiry.
    #[serde(default)]
    pub expires_at: Option<UnixTimestamp>,
    #[serde(default)]
    pub banned: bool,
    #[serde(flatten)]
    pub limits: AccountLimits,
}

impl CardSpec {
    pub fn new(card_key: impl Into<String>, duration: Duration, points: u64) -> Self {
        Self {
            card_key: card_key.into(),
            duration_secs: duration.as_secs(),
            points,
            expires_at: None,
            banned: false,
            limits: AccountLimits::default(),
        }
    }
}

/// A user account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSpec {
    pub username: String,
    pub password: String,
    /// Validity from the moment the authority is seeded.
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub points: u64,
    #[serde(default)]
    pub expires_at: Option<UnixTimestamp>,
    #[serde(default)]
    pub banned: bool,
    #[serde(flatten)]
    pub limits: AccountLimits,
}

/// Trial offer: every machine may start one trial of `duration_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialSpec {
    pub duration_secs: u64,
    #[serde(flatten)]
    pub limits: AccountLimits,
}

/// A single-use recharge code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RechargeCodeSpec {
    pub code: String,
    #[serde(default)]
    pub duration_secs: u64,
    #[serde(default)]
    pub points: u64,
}

impl RechargeCodeSpec {
    pub fn new(code: impl Into<String>, duration: Duration, points: u64) -> Self {
        Self {
            code: code.into(),
            duration_secs: duration.as_secs(),
            points,
        }
    }
}

/// Initial authority state, usually loaded from a JSON file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Seed {
    pub software_id: String,
    pub policy: PolicyFlags,
    pub cards: Vec<CardSpec>,
    pub users: Vec<UserSpec>,
    pub recharge_codes: Vec<RechargeCodeSpec>,
    pub trial: Option<TrialSpec>,
    /// Drops connections idle for longer than this; kept forever if absent.
    pub connection_ttl_secs: Option<u64>,
    /// Passphrase the Ed25519 signing key is derived from; random if absent.
    pub signing_seed: Option<String>,
}

struct Account {
    password_hash: Option<String>,
    /// `None` until a card's first login.
    entitlement: Option<Entitlement>,
    /// Value granted on activation.
    pending: RechargeValue,
    banned: bool,
    /// Card spent on a user registration.
    consumed: bool,
    limits: AccountLimits,
    bindings: Vec<MachineBindingRecord>,
    unbind: UnbindAllowance,
}

impl Account {
    fn new(limits: AccountLimits, now: UnixTimestamp) -> Self {
        let unbind = UnbindAllowance::new(
            limits.unbind_limit,
            Duration::from_secs(limits.unbind_period_secs),
            now,
        );
        Self {
            password_hash: None,
            entitlement: None,
            pending: RechargeValue::default(),
            banned: false,
            consumed: false,
            limits,
            bindings: Vec::new(),
            unbind,
        }
    }

    fn activated(&mut self, now: UnixTimestamp) -> Entitlement {
        *self.entitlement.get_or_insert_with(|| Entitlement {
            expiry_timestamp: now.saturating_add(Duration::from_secs(self.pending.duration_secs)),
            balance: self.pending.points,
        })
    }

    fn view(&mut self, now: UnixTimestamp) -> BindingSetView {
        self.unbind.refresh(now);
        BindingSetView {
            records: self.bindings.clone(),
            ip_binding_enabled: self.limits.ip_binding,
            remaining_unbind_count_this_period: self.unbind.remaining(),
            countdown_seconds_until_refresh: self.unbind.countdown(now),
            unbind_limit: self.unbind.unbind_limit(),
            limit: self.limits.binding_limit,
        }
    }

    fn binding_index(&self, fingerprint: &MachineFingerprint) -> LicenseResult<usize> {
        self.bindings
            .iter()
            .position(|r| &r.fingerprint == fingerprint)
            .ok_or_else(|| LicenseError::BindingNotFound(fingerprint.to_string()))
    }
}

struct RechargeCode {
    value: RechargeValue,
    redeemed_at: Option<UnixTimestamp>,
}

struct Connection {
    subject: String,
    record: OnlineSessionRecord,
    last_seen: UnixTimestamp,
}

#[derive(Default)]
struct State {
    policy: PolicyFlags,
    accounts: HashMap<String, Account>,
    recharge_codes: HashMap<String, RechargeCode>,
    trial: Option<TrialSpec>,
    connections: HashMap<String, Connection>,
    connection_ttl: Option<Duration>,
    next_connection_id: u32,
}

impl State {
    /// Drops connections idle for longer than the TTL.
    fn reap(&mut self, now: UnixTimestamp) {
        let Some(ttl) = self.connection_ttl else {
            return;
        };
        let before = self.connections.len();
        self.connections
            .retain(|_, c| c.last_seen.secs_until(now) <= ttl.as_secs());
        let reaped = before - self.connections.len();
        if reaped > 0 {
            debug!(reaped, "idle connections dropped");
        }
    }

    fn touch(&mut self, token: &SessionToken, now: UnixTimestamp) {
        if let Some(c) = self.connections.get_mut(token.as_str()) {
            c.last_seen = now;
        }
    }

    fn connection_subject(&self, token: &SessionToken) -> LicenseResult<String> {
        let subject = self
            .connections
            .get(token.as_str())
            .map(|c| c.subject.clone())
            .ok_or_else(LicenseError::not_authenticated)?;
        match self.accounts.get(&subject) {
            Some(account) if account.banned => Err(LicenseError::Auth(AuthReason::Banned)),
            Some(_) => Ok(subject),
            None => Err(LicenseError::not_authenticated()),
        }
    }

    fn account_for_token(&mut self, token: &SessionToken) -> LicenseResult<&mut Account> {
        let subject = self.connection_subject(token)?;
        self.accounts
            .get_mut(&subject)
            .ok_or_else(LicenseError::not_authenticated)
    }

    fn online_count(&self, subject: &str) -> usize {
        self.connections
            .values()
            .filter(|c| c.subject == subject)
            .count()
    }
}

/// The in-memory authority.
pub struct MemoryAuthority {
    software_id: String,
    clock: Arc<dyn Clock>,
    signing_key: SigningKey,
    state: Mutex<State>,
    calls: AtomicUsize,
    latency_ms: AtomicU64,
    reachable: AtomicBool,
}

impl MemoryAuthority {
    /// Creates an empty authority for `software_id` on the system clock.
    pub fn new(software_id: impl Into<String>) -> Self {
        Self::with_clock(software_id, Arc::new(SystemClock))
    }

    /// Creates an empty authority reading time from `clock`.
    pub fn with_clock(software_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            software_id: software_id.into(),
            clock,
            signing_key: SigningKey::from_bytes(&rand::random::<[u8; 32]>()),
            state: Mutex::new(State {
                next_connection_id: 1,
                ..State::default()
            }),
            calls: AtomicUsize::new(0),
            latency_ms: AtomicU64::new(0),
            reachable: AtomicBool::new(true),
        }
    }

    /// Builds an authority from a seed on the system clock.
    pub fn from_seed(seed: Seed) -> LicenseResult<Self> {
        Self::from_seed_with_clock(seed, Arc::new(SystemClock))
    }

    /// Builds an authority from a seed, reading time from `clock`.
    pub fn from_seed_with_clock(seed: Seed, clock: Arc<dyn Clock>) -> LicenseResult<Self> {
        if seed.software_id.trim().is_empty() {
            return Err(LicenseError::ProtocolMisuse("seed has no software id".into()));
        }
        let mut authority = Self::with_clock(seed.software_id, clock);
        if let Some(passphrase) = &seed.signing_seed {
            let derived: [u8; 32] = Sha256::digest(passphrase.as_bytes()).into();
            authority.signing_key = SigningKey::from_bytes(&derived);
        }
        authority.set_policy(seed.policy);
        authority.set_trial(seed.trial);
        authority.set_connection_ttl(seed.connection_ttl_secs.map(Duration::from_secs));
        for card in seed.cards {
            authority.add_card(card);
        }
        for user in seed.users {
            authority.add_user(user);
        }
        for code in seed.recharge_codes {
            authority.add_recharge_code(code);
        }
        Ok(authority)
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Locks the state at `now`, dropping idle connections first.
    fn lock_at(&self, now: UnixTimestamp) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.reap(now);
        state
    }

    /// Like [`lock_at`](Self::lock_at), and marks `token`'s connection as active.
    fn lock_for(&self, token: &SessionToken, now: UnixTimestamp) -> MutexGuard<'_, State> {
        let mut state = self.lock_at(now);
        state.touch(token, now);
        state
    }

    // ── Administration ───────────────────────────────────────────

    #[must_use]
    pub fn software_id(&self) -> &str {
        &self.software_id
    }

    /// The Ed25519 public key entitlement tokens are signed with.
    #[must_use]
    pub fn verifying_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn add_card(&self, card: CardSpec) {
        let now = self.clock.now();
        let mut account = Account::new(card.limits, now);
        account.pending = RechargeValue {
            duration_secs: card.duration_secs,
            points: card.points,
        };
        account.entitlement = card.expires_at.map(|expiry_timestamp| Entitlement {
            expiry_timestamp,
            balance: card.points,
        });
        account.banned = card.banned;
        let subject = Identity::card(card.card_key).subject();
        self.lock().accounts.insert(subject, account);
    }

    pub fn add_user(&self, user: UserSpec) {
        let now = self.clock.now();
        let mut account = Account::new(user.limits, now);
        account.password_hash = Some(hash_password(&user.password));
        account.entitlement = Some(Entitlement {
            expiry_timestamp: user
                .expires_at
                .unwrap_or_else(|| now.saturating_add(Duration::from_secs(user.duration_secs))),
            balance: user.points,
        });
        account.banned = user.banned;
        let subject = Identity::user(user.username, String::new()).subject();
        self.lock().accounts.insert(subject, account);
    }

    pub fn add_recharge_code(&self, code: RechargeCodeSpec) {
        self.lock().recharge_codes.insert(
            code.code.trim().to_string(),
            RechargeCode {
                value: RechargeValue {
                    duration_secs: code.duration_secs,
                    points: code.points,
                },
                redeemed_at: None,
            },
        );
    }

    pub fn set_trial(&self, trial: Option<TrialSpec>) {
        self.lock().trial = trial;
    }

    /// Drops connections that made no call for `ttl`. `None` keeps them until logout.
    pub fn set_connection_ttl(&self, ttl: Option<Duration>) {
        self.lock().connection_ttl = ttl;
    }

    pub fn set_policy(&self, policy: PolicyFlags) {
        self.lock().policy = policy;
    }

    #[must_use]
    pub fn policy_flags(&self) -> PolicyFlags {
        self.lock().policy
    }

    /// Bans or unbans the account behind `identity`. Returns false if unknown.
    pub fn set_banned(&self, identity: &Identity, banned: bool) -> bool {
        match self.lock().accounts.get_mut(&identity.subject()) {
            Some(account) => {
                account.banned = banned;
                true
            }
            None => false,
        }
    }

    /// Delays every call by `latency` before it is processed.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Simulates the authority going off the network.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Number of calls received so far, rejected ones included.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of online connections across all credentials.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.lock_at(self.clock.now()).connections.len()
    }

    // ── Request handling ─────────────────────────────────────────

    async fn enter(&self) -> LicenseResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(LicenseError::NetworkUnavailable(format!(
                "authority for {} is unreachable",
                self.software_id
            )))
        }
    }

    fn check_conn(&self, conn: &ConnectionConfig) -> LicenseResult<()> {
        if conn.software_id != self.software_id {
            return Err(LicenseError::Protocol(format!(
                "unknown software id {:?}",
                conn.software_id
            )));
        }
        if conn.protocol_version == 0 || conn.protocol_version > PROTOCOL_VERSION {
            return Err(LicenseError::Protocol(format!(
                "unsupported protocol version {}",
                conn.protocol_version
            )));
        }
        Ok(())
    }

    fn require(policy: &PolicyFlags, flag: PolicyFlag) -> LicenseResult<()> {
        if policy.is_set(flag) {
            Err(LicenseError::PolicyForbidden(flag))
        } else {
            Ok(())
        }
    }

    /// Resolves a credential to its account subject, activating cards and
    /// trials on login.
    fn authenticate(
        state: &mut State,
        identity: &Identity,
        now: UnixTimestamp,
        activate: bool,
    ) -> LicenseResult<String> {
        let subject = identity.subject();
        let invalid = || LicenseError::Auth(AuthReason::InvalidCredential);

        match identity {
            Identity::Card { .. } => {
                let account = state.accounts.get(&subject).ok_or_else(invalid)?;
                if account.password_hash.is_some() || account.consumed {
                    return Err(invalid());
                }
            }
            Identity::User { password, .. } => {
                let account = state.accounts.get(&subject).ok_or_else(invalid)?;
                if account.password_hash.as_deref() != Some(hash_password(password).as_str()) {
                    return Err(invalid());
                }
            }
            Identity::Trial { .. } => {
                Self::require(&state.policy, PolicyFlag::ForbidTrial)?;
                let trial = state.trial.clone().ok_or_else(invalid)?;
                if activate && !state.accounts.contains_key(&subject) {
                    let mut account = Account::new(trial.limits, now);
                    account.pending = RechargeValue {
                        duration_secs: trial.duration_secs,
                        points: 0,
                    };
                    state.accounts.insert(subject.clone(), account);
                }
            }
        }

        let Some(account) = state.accounts.get_mut(&subject) else {
            // A trial that was only verified, never started.
            return Ok(subject);
        };
        if account.banned {
            return Err(LicenseError::Auth(AuthReason::Banned));
        }
        let entitlement = if activate {
            Some(account.activated(now))
        } else {
            account.entitlement
        };
        if entitlement.is_some_and(|e| now >= e.expiry_timestamp) {
            return Err(LicenseError::Auth(AuthReason::Expired));
        }
        Ok(subject)
    }

    fn do_verify(&self, conn: &ConnectionConfig, identity: &Identity) -> LicenseResult<()> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_at(now);
        if identity.method() != crate::validator::LoginMethod::Trial {
            Self::require(&state.policy, PolicyFlag::ForbidLogin)?;
        }
        Self::authenticate(&mut state, identity, now, false).map(|_| ())
    }

    fn do_login(
        &self,
        conn: &ConnectionConfig,
        identity: &Identity,
        machine: &MachineInfo,
    ) -> LicenseResult<LoginGrant> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_at(now);
        if identity.method() != crate::validator::LoginMethod::Trial {
            Self::require(&state.policy, PolicyFlag::ForbidLogin)?;
        }
        let subject = Self::authenticate(&mut state, identity, now, true)?;

        let online = state.online_count(&subject);
        let policy = state.policy;
        let account = state
            .accounts
            .get_mut(&subject)
            .ok_or_else(|| LicenseError::Internal("account vanished during login".into()))?;
        let max_online = account.limits.max_online;
        if max_online > 0 && online >= max_online as usize {
            return Err(LicenseError::Capacity {
                resource: CapacityResource::OnlineSessions,
                limit: max_online,
            });
        }

        let entitlement = account.activated(now);
        let machine_bound = match account
            .bindings
            .iter_mut()
            .find(|r| r.fingerprint == machine.fingerprint)
        {
            Some(record) => {
                record.last_login_timestamp = now;
                true
            }
            None => false,
        };

        let connection_id = ConnectionId::new(state.next_connection_id);
        state.next_connection_id = state.next_connection_id.wrapping_add(1).max(1);
        let token = SessionToken::generate();
        state.connections.insert(
            token.as_str().to_string(),
            Connection {
                subject,
                record: OnlineSessionRecord {
                    connection_id,
                    computer_name: machine.computer_name.clone(),
                    os_version: machine.os_version.clone(),
                    cloud_init_timestamp: now,
                },
                last_seen: now,
            },
        );
        info!(%connection_id, method = ?identity.method(), "login accepted");

        Ok(LoginGrant {
            token,
            connection_id,
            entitlement,
            machine_bound,
            policy,
        })
    }

    fn do_register(
        &self,
        conn: &ConnectionConfig,
        username: &str,
        password: &str,
        card_key: &str,
    ) -> LicenseResult<()> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_at(now);
        Self::require(&state.policy, PolicyFlag::ForbidRegister)?;

        let user_subject = Identity::user(username, String::new()).subject();
        if username.trim().is_empty() || password.is_empty() {
            return Err(LicenseError::Auth(AuthReason::InvalidCredential));
        }
        if state.accounts.contains_key(&user_subject) {
            return Err(LicenseError::AlreadyExists(format!("user {}", username.trim())));
        }

        let card_subject = Identity::card(card_key).subject();
        let card = state
            .accounts
            .get_mut(&card_subject)
            .filter(|a| a.password_hash.is_none())
            .ok_or_else(|| LicenseError::InvalidCode(mask(card_key)))?;
        if card.banned {
            return Err(LicenseError::Auth(AuthReason::Banned));
        }
        if card.consumed || card.entitlement.is_some() {
            return Err(LicenseError::AlreadyRedeemed(mask(card_key)));
        }
        card.consumed = true;
        let value = card.pending;
        let limits = card.limits.clone();

        let mut user = Account::new(limits, now);
        user.password_hash = Some(hash_password(password));
        user.entitlement = Some(Entitlement {
            expiry_timestamp: now,
            balance: 0,
        }
        .credited(value, now));
        state.accounts.insert(user_subject, user);
        info!(username = %username.trim(), "user registered");
        Ok(())
    }

    fn do_logout(&self, conn: &ConnectionConfig, token: &SessionToken) -> LicenseResult<()> {
        self.check_conn(conn)?;
        if let Some(c) = self.lock().connections.remove(token.as_str()) {
            debug!(connection_id = %c.record.connection_id, "connection closed");
        }
        Ok(())
    }

    fn do_entitlement(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<SignedEntitlement> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        let subject = state.connection_subject(token)?;
        let account = state.account_for_token(token)?;
        let entitlement = account.activated(now);
        let claims = EntitlementClaims::new(
            hash_subject(&subject),
            self.software_id.clone(),
            entitlement,
            now,
        );
        Ok(SignedEntitlement {
            entitlement,
            token: Some(sign_claims(&self.signing_key, &claims)?),
        })
    }

    fn do_recharge(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        codes: &[String],
    ) -> LicenseResult<RechargeTransaction> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        Self::require(&state.policy, PolicyFlag::ForbidRecharge)?;
        state.connection_subject(token)?;

        if codes.is_empty() {
            return Err(LicenseError::InvalidCode("no recharge code given".into()));
        }

        // Validate the whole batch before touching anything.
        let mut seen = HashSet::new();
        let mut total = RechargeValue::default();
        for code in codes {
            let code = code.trim();
            if !seen.insert(code) {
                return Err(LicenseError::AlreadyRedeemed(mask(code)));
            }
            let entry = state
                .recharge_codes
                .get(code)
                .ok_or_else(|| LicenseError::InvalidCode(mask(code)))?;
            if entry.redeemed_at.is_some() {
                return Err(LicenseError::AlreadyRedeemed(mask(code)));
            }
            total = total.plus(entry.value);
        }

        for code in &seen {
            if let Some(entry) = state.recharge_codes.get_mut(*code) {
                entry.redeemed_at = Some(now);
            }
        }
        let account = state.account_for_token(token)?;
        let old = account.activated(now);
        let new = old.credited(total, now);
        account.entitlement = Some(new);

        let units = u32::try_from(codes.len()).unwrap_or(u32::MAX);
        info!(units, "recharge applied");
        Ok(RechargeTransaction::between(old, new, units))
    }

    fn do_bindings(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<BindingSetView> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        Ok(state.account_for_token(token)?.view(now))
    }

    fn do_bind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        let account = state.account_for_token(token)?;

        if account.binding_index(&machine.fingerprint).is_err() {
            let limit = account.limits.binding_limit;
            if account.bindings.len() >= limit as usize {
                return Err(LicenseError::Capacity {
                    resource: CapacityResource::Bindings,
                    limit,
                });
            }
            account.bindings.push(MachineBindingRecord::new(machine, now));
            debug!(fingerprint = %machine.fingerprint, "machine bound");
        }
        Ok(account.view(now))
    }

    fn do_unbind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<BindingSetView> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        let account = state.account_for_token(token)?;

        let index = account.binding_index(fingerprint)?;
        account.unbind.consume(now)?;
        account.bindings.remove(index);
        debug!(%fingerprint, "machine unbound");
        Ok(account.view(now))
    }

    fn do_rebind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        old: &MachineFingerprint,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        let account = state.account_for_token(token)?;

        let index = account.binding_index(old)?;
        if *old == machine.fingerprint {
            let record = &mut account.bindings[index];
            record.computer_name = machine.computer_name.clone();
            record.os_version = machine.os_version.clone();
            return Ok(account.view(now));
        }
        account.unbind.consume(now)?;
        let remark = account.bindings.remove(index).remark;
        if account.binding_index(&machine.fingerprint).is_err() {
            let mut record = MachineBindingRecord::new(machine, now);
            record.remark = remark;
            account.bindings.push(record);
        }
        debug!(%old, new = %machine.fingerprint, "machine rebound");
        Ok(account.view(now))
    }

    fn do_set_remark(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
        remark: &str,
    ) -> LicenseResult<BindingSetView> {
        self.check_conn(conn)?;
        let now = self.clock.now();
        let mut state = self.lock_for(token, now);
        let account = state.account_for_token(token)?;
        let index = account.binding_index(fingerprint)?;
        account.bindings[index].remark = remark.to_string();
        Ok(account.view(now))
    }

    fn do_online(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<Vec<OnlineSessionRecord>> {
        self.check_conn(conn)?;
        let state = self.lock_for(token, self.clock.now());
        Self::require(&state.policy, PolicyFlag::ForbidCloudCountQuery)?;
        let subject = state.connection_subject(token)?;
        let mut records: Vec<OnlineSessionRecord> = state
            .connections
            .values()
            .filter(|c| c.subject == subject)
            .map(|c| c.record.clone())
            .collect();
        records.sort_by(|a, b| {
            b.cloud_init_timestamp
                .cmp(&a.cloud_init_timestamp)
                .then(b.connection_id.cmp(&a.connection_id))
        });
        Ok(records)
    }
}

fn hash_password(password: &str) -> String {
    hex::encode(Sha256::digest(password.as_bytes()))
}

impl fmt::Debug for MemoryAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryAuthority")
            .field("software_id", &self.software_id)
            .field("calls", &self.call_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Authority for MemoryAuthority {
    async fn handshake(&self) -> LicenseResult<Handshake> {
        self.enter().await?;
        Ok(Handshake {
            policy: self.policy_flags(),
            server_time: self.clock.now(),
            protocol_version: PROTOCOL_VERSION,
        })
    }

    async fn policy(&self, conn: &ConnectionConfig) -> LicenseResult<PolicyFlags> {
        self.enter().await?;
        self.check_conn(conn)?;
        Ok(self.policy_flags())
    }

    async fn verify(&self, conn: &ConnectionConfig, identity: &Identity) -> LicenseResult<()> {
        self.enter().await?;
        self.do_verify(conn, identity)
    }

    async fn login(
        &self,
        conn: &ConnectionConfig,
        identity: &Identity,
        machine: &MachineInfo,
    ) -> LicenseResult<LoginGrant> {
        self.enter().await?;
        self.do_login(conn, identity, machine)
    }

    async fn register(
        &self,
        conn: &ConnectionConfig,
        username: &str,
        password: &str,
        card_key: &str,
    ) -> LicenseResult<()> {
        self.enter().await?;
        self.do_register(conn, username, password, card_key)
    }

    async fn logout(&self, conn: &ConnectionConfig, token: &SessionToken) -> LicenseResult<()> {
        self.enter().await?;
        self.do_logout(conn, token)
    }

    async fn entitlement(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<SignedEntitlement> {
        self.enter().await?;
        self.do_entitlement(conn, token)
    }

    async fn recharge(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        codes: &[String],
    ) -> LicenseResult<RechargeTransaction> {
        self.enter().await?;
        self.do_recharge(conn, token, codes)
    }

    async fn bindings(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<BindingSetView> {
        self.enter().await?;
        self.do_bindings(conn, token)
    }

    async fn bind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView> {
        self.enter().await?;
        self.do_bind(conn, token, machine)
    }

    async fn unbind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<BindingSetView> {
        self.enter().await?;
        self.do_unbind(conn, token, fingerprint)
    }

    async fn rebind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        old: &MachineFingerprint,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView> {
        self.enter().await?;
        self.do_rebind(conn, token, old, machine)
    }

    async fn set_remark(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
        remark: &str,
    ) -> LicenseResult<BindingSetView> {
        self.enter().await?;
        self.do_set_remark(conn, token, fingerprint, remark)
    }

    async fn online(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<Vec<OnlineSessionRecord>> {
        self.enter().await?;
        self.do_online(conn, token)
    }
}
