//! HTTP client for a remote authority.

use super::{Authority, Handshake, LoginGrant, SignedEntitlement};
use crate::binding::BindingSetView;
use crate::config::ConnectionConfig;
use crate::device::{MachineFingerprint, MachineInfo};
use crate::error::{LicenseError, LicenseResult};
use crate::ledger::RechargeTransaction;
use crate::policy::PolicyFlags;
use crate::presence::OnlineSessionRecord;
use crate::validator::Identity;
use crate::wire::{
    self, ops, BindBody, Envelope, LoginBody, NoBody, RebindBody, RechargeBody, RegisterBody,
    RemarkBody, Request, TokenBody, UnbindBody, VerifyBody,
};
use async_trait::async_trait;
use keygate_types::SessionToken;
use reqwest::{Client as HttpClient, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;
use tracing::debug;

/// Talks to an authority over `POST /api/v1/<op>`.
///
/// The handshake goes to the bootstrap URL given at construction. Every
/// other call goes to the host and port of the session's
/// [`ConnectionConfig`], using the bootstrap URL's scheme.
#[derive(Debug, Clone)]
pub struct HttpAuthority {
    http: HttpClient,
    base_url: String,
    scheme: String,
}

impl HttpAuthority {
    /// Creates a client whose handshake goes to `base_url` (e.g. `http://127.0.0.1:8443`).
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(HttpClient::new(), base_url)
    }

    /// Creates a client reusing an existing `reqwest` client.
    pub fn with_client(http: HttpClient, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        let scheme = base_url
            .split_once("://")
            .map_or("http", |(scheme, _)| scheme)
            .to_string();
        Self {
            http,
            base_url,
            scheme,
        }
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url_for(&self, conn: &ConnectionConfig, op: &str) -> String {
        format!("{}://{}{}", self.scheme, conn.endpoint(), wire::path(op))
    }

    async fn call<B, T>(&self, conn: &ConnectionConfig, op: &str, body: B) -> LicenseResult<T>
    where
        B: Serialize + Send + Sync,
        T: DeserializeOwned,
    {
        let url = self.url_for(conn, op);
        let request = Request::new(conn, body);
        self.post(&url, &request, conn.timeout).await
    }

    async fn post<B, T>(&self, url: &str, body: &B, timeout: Duration) -> LicenseResult<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        debug!(%url, "authority request");
        let response = self
            .http
            .post(url)
            .timeout(timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| map_transport_error(&e, timeout))?;

        Self::handle_response(response).await
    }

    async fn handle_response<T: DeserializeOwned>(response: reqwest::Response) -> LicenseResult<T> {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(1);
            return Err(LicenseError::RateLimited { retry_after_secs });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| LicenseError::NetworkUnavailable(e.to_string()))?;
        match serde_json::from_slice::<Envelope<T>>(&bytes) {
            Ok(envelope) => envelope.into_result(),
            Err(_) if status.is_server_error() => Err(LicenseError::Internal(format!(
                "authority answered {status}"
            ))),
            Err(e) => Err(LicenseError::Protocol(format!(
                "unreadable authority response ({status}): {e}"
            ))),
        }
    }
}

fn map_transport_error(err: &reqwest::Error, timeout: Duration) -> LicenseError {
    if err.is_timeout() {
        LicenseError::NetworkTimeout {
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    } else {
        LicenseError::NetworkUnavailable(err.to_string())
    }
}

#[async_trait]
impl Authority for HttpAuthority {
    async fn handshake(&self) -> LicenseResult<Handshake> {
        let url = format!("{}{}", self.base_url, wire::path(ops::HANDSHAKE));
        // The session applies its own bound on top of this one.
        self.post(&url, &NoBody {}, Duration::from_secs(60)).await
    }

    async fn policy(&self, conn: &ConnectionConfig) -> LicenseResult<PolicyFlags> {
        self.call(conn, ops::POLICY, NoBody {}).await
    }

    async fn verify(&self, conn: &ConnectionConfig, identity: &Identity) -> LicenseResult<()> {
        let body = VerifyBody {
            identity: identity.clone(),
        };
        self.call(conn, ops::VERIFY, body).await
    }

    async fn login(
        &self,
        conn: &ConnectionConfig,
        identity: &Identity,
        machine: &MachineInfo,
    ) -> LicenseResult<LoginGrant> {
        let body = LoginBody {
            identity: identity.clone(),
            machine: machine.clone(),
        };
        self.call(conn, ops::LOGIN, body).await
    }

    async fn register(
        &self,
        conn: &ConnectionConfig,
        username: &str,
        password: &str,
        card_key: &str,
    ) -> LicenseResult<()> {
        let body = RegisterBody {
            username: username.to_string(),
            password: password.to_string(),
            card_key: card_key.to_string(),
        };
        self.call(conn, ops::REGISTER, body).await
    }

    async fn logout(&self, conn: &ConnectionConfig, token: &SessionToken) -> LicenseResult<()> {
        let body = TokenBody {
            token: token.clone(),
        };
        self.call(conn, ops::LOGOUT, body).await
    }

    async fn entitlement(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<SignedEntitlement> {
        let body = TokenBody {
            token: token.clone(),
        };
        self.call(conn, ops::ENTITLEMENT, body).await
    }

    async fn recharge(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        codes: &[String],
    ) -> LicenseResult<RechargeTransaction> {
        let body = RechargeBody {
            token: token.clone(),
            codes: codes.to_vec(),
        };
        self.call(conn, ops::RECHARGE, body).await
    }

    async fn bindings(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<BindingSetView> {
        let body = TokenBody {
            token: token.clone(),
        };
        self.call(conn, ops::BINDINGS, body).await
    }

    async fn bind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView> {
        let body = BindBody {
            token: token.clone(),
            machine: machine.clone(),
        };
        self.call(conn, ops::BIND, body).await
    }

    async fn unbind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
    ) -> LicenseResult<BindingSetView> {
        let body = UnbindBody {
            token: token.clone(),
            fingerprint: fingerprint.clone(),
        };
        self.call(conn, ops::UNBIND, body).await
    }

    async fn rebind(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        old: &MachineFingerprint,
        machine: &MachineInfo,
    ) -> LicenseResult<BindingSetView> {
        let body = RebindBody {
            token: token.clone(),
            old: old.clone(),
            machine: machine.clone(),
        };
        self.call(conn, ops::REBIND, body).await
    }

    async fn set_remark(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
        fingerprint: &MachineFingerprint,
        remark: &str,
    ) -> LicenseResult<BindingSetView> {
        let body = RemarkBody {
            token: token.clone(),
            fingerprint: fingerprint.clone(),
            remark: remark.to_string(),
        };
        self.call(conn, ops::REMARK, body).await
    }

    async fn online(
        &self,
        conn: &ConnectionConfig,
        token: &SessionToken,
    ) -> LicenseResult<Vec<OnlineSessionRecord>> {
        let body = TokenBody {
            token: token.clone(),
        };
        self.call(conn, ops::ONLINE, body).await
    }
}
