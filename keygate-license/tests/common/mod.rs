//! Shared test helpers for license tests.

#![allow(dead_code)]

use ed25519_dalek::SigningKey;
use keygate_license::{
    CardSpec, Client, ClientConfig, ConnectionConfig, MachineFingerprint, MachineInfo,
    ManualClock, MemoryAuthority, RechargeCodeSpec, Seed, Session, TrialSpec, UnixTimestamp,
    UserSpec,
};
use std::sync::Arc;
use std::time::Duration;

pub const SOFTWARE_ID: &str = "demo";
pub const DAY: u64 = 24 * 60 * 60;
/// Fixed start time for the manual clock (2025-01-01T00:00:00Z).
pub const START: u64 = 1_735_689_600;

/// Returns a deterministic Ed25519 key pair from a fixed seed.
pub fn test_keypair() -> (SigningKey, [u8; 32]) {
    let seed: [u8; 32] = [
        1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24,
        25, 26, 27, 28, 29, 30, 31, 32,
    ];
    let signing_key = SigningKey::from_bytes(&seed);
    let verifying_key = signing_key.verifying_key();
    (signing_key, verifying_key.to_bytes())
}

/// The connection used by the scenarios.
pub fn demo_conn() -> ConnectionConfig {
    ConnectionConfig::new(SOFTWARE_ID, "auth.example.com", 443, Duration::from_millis(5000))
}

/// A fixed machine so tests do not depend on the host.
pub fn machine(name: &str) -> MachineInfo {
    MachineInfo {
        fingerprint: MachineFingerprint::from_raw(format!("fp-{name}")),
        computer_name: name.to_string(),
        os_version: "linux 6.1".to_string(),
    }
}

/// Seed with the scenario cards, a user, recharge codes and a trial.
pub fn demo_seed() -> Seed {
    let mut expired = CardSpec::new("EXPIRED-CODE", Duration::from_secs(30 * DAY), 0);
    expired.expires_at = Some(UnixTimestamp::from_secs(START - DAY));

    let mut banned = CardSpec::new("BANNED-CARD", Duration::from_secs(30 * DAY), 0);
    banned.banned = true;

    let mut two_seats = CardSpec::new("TWO-SEATS", Duration::from_secs(30 * DAY), 0);
    two_seats.limits.binding_limit = 2;
    two_seats.limits.unbind_limit = 1;
    two_seats.limits.max_online = 2;

    Seed {
        software_id: SOFTWARE_ID.to_string(),
        cards: vec![
            CardSpec::new("ABCD-1234", Duration::from_secs(30 * DAY), 100),
            CardSpec::new("FRESH-CARD", Duration::from_secs(7 * DAY), 5),
            expired,
            banned,
            two_seats,
        ],
        users: vec![UserSpec {
            username: "alice".to_string(),
            password: "s3cret".to_string(),
            duration_secs: 10 * DAY,
            points: 20,
            expires_at: None,
            banned: false,
            limits: Default::default(),
        }],
        recharge_codes: vec![
            RechargeCodeSpec::new("RC-MONTH", Duration::from_secs(30 * DAY), 0),
            RechargeCodeSpec::new("RC-POINTS", Duration::ZERO, 50),
            RechargeCodeSpec::new("RC-WEEK", Duration::from_secs(7 * DAY), 10),
        ],
        trial: Some(TrialSpec {
            duration_secs: 3 * DAY,
            limits: Default::default(),
        }),
        signing_seed: Some("test-signing-seed".to_string()),
        ..Seed::default()
    }
}

/// Authority, its clock, and a client bound to machine "home".
pub struct Harness {
    pub clock: Arc<ManualClock>,
    pub authority: Arc<MemoryAuthority>,
    pub client: Client,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::ephemeral())
    }

    pub fn with_config(mut config: ClientConfig) -> Self {
        let clock = Arc::new(ManualClock::new(UnixTimestamp::from_secs(START)));
        let authority = Arc::new(
            MemoryAuthority::from_seed_with_clock(demo_seed(), clock.clone())
                .expect("seed is valid"),
        );
        if config.machine.is_none() {
            config.machine = Some(machine("home"));
        }
        let client = Client::new(authority.clone(), config).with_clock(clock.clone());
        Self {
            clock,
            authority,
            client,
        }
    }

    /// A second client against the same authority, on another machine.
    pub fn client_on(&self, name: &str) -> Client {
        let config = ClientConfig {
            machine: Some(machine(name)),
            ..ClientConfig::ephemeral()
        };
        Client::new(self.authority.clone(), config).with_clock(self.clock.clone())
    }

    /// Another client against the same authority with its own config.
    pub fn client_with(&self, mut config: ClientConfig) -> Client {
        if config.machine.is_none() {
            config.machine = Some(machine("home"));
        }
        Client::new(self.authority.clone(), config).with_clock(self.clock.clone())
    }

    /// A configured, not yet logged-in session.
    pub async fn configured(&self) -> Session {
        configured_session(&self.client).await
    }

    /// A session logged in with `card_key`.
    pub async fn logged_in(&self, card_key: &str) -> Session {
        let session = self.configured().await;
        session.login_with_card(card_key).await.expect("login");
        session
    }

    pub fn advance(&self, secs: u64) {
        self.clock.advance(Duration::from_secs(secs));
    }
}

pub async fn configured_session(client: &Client) -> Session {
    let session = client.create_session().await.expect("create session");
    session
        .configure_connection(demo_conn())
        .expect("configure connection");
    session
}
