//! Marketplace client: challenge login plus signed seller operations.
//!
//! One client per identity — the `verus_session` cookie lives in the
//! client's jar, so sessions never bleed across identities. Expired
//! sessions are recovered by exactly one re-login per request.

use std::sync::Arc;

use chrono::Utc;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::StatusCode;
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::error::DispatcherError;
use crate::identity::Identity;
use crate::types::{ApiData, Job, JobStatus};

/// Exact signed acceptance message; the marketplace verifies it
/// byte-for-byte.
pub fn acceptance_message(
    job_hash: &str,
    buyer: &str,
    amount: &Decimal,
    currency: &str,
    timestamp: i64,
) -> String {
    format!(
        "VAP-ACCEPT|Job:{job_hash}|Buyer:{buyer}|Amt:{amount} {currency}|Ts:{timestamp}|I accept this job and commit to delivering the work."
    )
}

/// Exact signed delivery message.
pub fn delivery_message(job_id: &str, result_sha256_hex: &str) -> String {
    format!("VAP-DELIVER|Job:{job_id}|Hash:{result_sha256_hex}")
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Challenge {
    challenge: String,
    challenge_id: String,
}

#[derive(Debug, Deserialize)]
struct ChatToken {
    token: String,
}

pub struct MarketplaceClient {
    origin: Url,
    identity: Arc<Identity>,
    jar: Arc<Jar>,
    http: reqwest::Client,
}

impl MarketplaceClient {
    pub fn new(api_base: &str, identity: Arc<Identity>) -> Result<Self, DispatcherError> {
        let origin = Url::parse(api_base)
            .map_err(|e| DispatcherError::Config(format!("VAP_API is not a valid URL: {e}")))?;
        let jar = Arc::new(Jar::default());
        let http = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| DispatcherError::Http(e.to_string()))?;
        Ok(Self { origin, identity, jar, http })
    }

    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.origin.as_str().trim_end_matches('/'), path)
    }

    /// Challenge-based login. On success the marketplace sets the
    /// `verus_session` cookie in this client's jar.
    pub async fn login(&self) -> Result<(), DispatcherError> {
        let resp = self.http.get(self.endpoint("/auth/challenge")).send().await?;
        let challenge = expect_ok(resp).await?.json::<ApiData<Challenge>>().await?.data;

        let signature = self.identity.sign(challenge.challenge.as_bytes())?;
        let resp = self
            .http
            .post(self.endpoint("/auth/login"))
            .json(&json!({
                "challengeId": challenge.challenge_id,
                "verusId": self.identity.i_address(),
                "signature": signature,
            }))
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(DispatcherError::AuthFailed(format!(
                "{}: login rejected with HTTP {}",
                self.identity.identity_name(),
                resp.status()
            )));
        }
        tracing::info!(identity = self.identity.identity_name(), "marketplace session established");
        Ok(())
    }

    /// Send a request; on 401, re-login once and re-issue the same request.
    async fn send_authed(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, DispatcherError> {
        let retry = request.try_clone();
        let resp = request.send().await?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            if let Some(retry) = retry {
                tracing::debug!(
                    identity = self.identity.identity_name(),
                    "session expired, re-authenticating once"
                );
                self.login().await?;
                return Ok(retry.send().await?);
            }
        }
        Ok(resp)
    }

    /// Jobs visible to this identity in the seller role.
    pub async fn seller_jobs(&self, status: JobStatus) -> Result<Vec<Job>, DispatcherError> {
        let request = self
            .http
            .get(self.endpoint("/v1/me/jobs"))
            .query(&[("status", status.as_str()), ("role", "seller")]);
        let resp = expect_ok(self.send_authed(request).await?).await?;
        Ok(resp.json::<ApiData<Vec<Job>>>().await?.data)
    }

    pub async fn job(&self, job_id: &str) -> Result<Job, DispatcherError> {
        let request = self.http.get(self.endpoint(&format!("/v1/jobs/{job_id}")));
        let resp = expect_ok(self.send_authed(request).await?).await?;
        Ok(resp.json::<ApiData<Job>>().await?.data)
    }

    /// Sign and post the acceptance commitment for a job.
    pub async fn accept_job(&self, job: &Job) -> Result<(), DispatcherError> {
        let timestamp = Utc::now().timestamp();
        let message = acceptance_message(
            &job.job_hash,
            &job.buyer_verus_id,
            &job.amount,
            &job.currency,
            timestamp,
        );
        let signature = self.identity.sign(message.as_bytes())?;
        let request = self
            .http
            .post(self.endpoint(&format!("/v1/jobs/{}/accept", job.job_id)))
            .json(&json!({"timestamp": timestamp, "signature": signature}));
        expect_ok(self.send_authed(request).await?).await?;
        tracing::info!(job_id = job.job_id, identity = self.identity.identity_name(), "job accepted");
        Ok(())
    }

    /// Sign and post the delivery record for a finished job.
    pub async fn deliver(&self, job_id: &str, result_sha256_hex: &str) -> Result<(), DispatcherError> {
        let message = delivery_message(job_id, result_sha256_hex);
        let signature = self.identity.sign(message.as_bytes())?;
        let request = self
            .http
            .post(self.endpoint(&format!("/v1/jobs/{job_id}/deliver")))
            .json(&json!({"resultHash": result_sha256_hex, "signature": signature}));
        expect_ok(self.send_authed(request).await?).await?;
        Ok(())
    }

    /// Best-effort attestation submission; callers log failures and move on.
    pub async fn submit_attestation(
        &self,
        job_id: &str,
        document: &Value,
    ) -> Result<(), DispatcherError> {
        let request = self
            .http
            .post(self.endpoint(&format!("/v1/jobs/{job_id}/attestations")))
            .json(document);
        expect_ok(self.send_authed(request).await?).await?;
        Ok(())
    }

    /// Short-lived token for the chat transport handshake.
    pub async fn chat_token(&self) -> Result<String, DispatcherError> {
        let request = self.http.get(self.endpoint("/v1/chat/token"));
        let resp = expect_ok(self.send_authed(request).await?).await?;
        Ok(resp.json::<ApiData<ChatToken>>().await?.data.token)
    }

    /// WebSocket URL for the chat transport, carrying the chat token.
    pub fn chat_ws_url(&self, chat_token: &str) -> Result<String, DispatcherError> {
        let mut url = self.origin.clone();
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| DispatcherError::Transport("cannot derive ws scheme".into()))?;
        url.set_path("/v1/chat/ws");
        url.set_query(Some(&format!("token={chat_token}")));
        Ok(url.into())
    }

    /// Current `Cookie` header for the marketplace origin, for reuse on the
    /// chat handshake.
    pub fn session_cookie(&self) -> Option<String> {
        self.jar
            .cookies(&self.origin)
            .and_then(|value| value.to_str().map(str::to_string).ok())
    }
}

async fn expect_ok(resp: reqwest::Response) -> Result<reqwest::Response, DispatcherError> {
    let status = resp.status();
    if status.is_success() {
        Ok(resp)
    } else {
        Err(DispatcherError::Marketplace {
            status: status.as_u16(),
            body: resp.text().await.unwrap_or_default(),
        })
    }
}
