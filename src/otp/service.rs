use std::{sync::Arc, time::Duration};

use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, instrument, warn};

use super::{keys, store::EphemeralStore};
use crate::{config::OtpConfig, error::ApiError, mailer::Mailer};

#[derive(Debug, Error)]
pub enum OtpError {
    /// Deliberately the same for "no code", "wrong code" and "burned code".
    #[error("Invalid or expired OTP")]
    InvalidOrExpired,

    #[error("Please wait before requesting another OTP")]
    Cooldown,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<OtpError> for ApiError {
    fn from(e: OtpError) -> Self {
        match e {
            OtpError::InvalidOrExpired => ApiError::BadRequest(e.to_string()),
            OtpError::Cooldown => ApiError::TooManyRequests(e.to_string()),
            OtpError::Internal(inner) => ApiError::Internal(inner),
        }
    }
}

/// Uniformly random 6-digit code, leading zeros kept.
pub fn generate_code() -> String {
    format!("{:06}", rand::thread_rng().gen_range(0..1_000_000u32))
}

/// Hex SHA-256 of a code; only this ever reaches the store.
pub fn digest(code: &str) -> String {
    hex::encode(Sha256::digest(code.as_bytes()))
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    let len_match = a.len() == b.len();
    let mut diff = 0u8;
    for i in 0..a.len().max(b.len()) {
        diff |= a.get(i).copied().unwrap_or(0) ^ b.get(i).copied().unwrap_or(0);
    }
    len_match && diff == 0
}

/// Issues and checks email OTPs. Callers pass normalized emails.
#[derive(Clone)]
pub struct OtpService {
    store: Arc<dyn EphemeralStore>,
    mailer: Arc<dyn Mailer>,
    cfg: OtpConfig,
}

impl OtpService {
    pub fn new(store: Arc<dyn EphemeralStore>, mailer: Arc<dyn Mailer>, cfg: OtpConfig) -> Self {
        Self { store, mailer, cfg }
    }

    fn ttl(&self) -> Duration {
        Duration::from_secs(self.cfg.ttl_secs)
    }

    #[instrument(skip(self))]
    pub async fn send(&self, email: &str) -> Result<(), OtpError> {
        let cooldown_key = keys::otp_cooldown(email);
        if self.cfg.resend_cooldown_secs > 0 {
            let cooldown = Duration::from_secs(self.cfg.resend_cooldown_secs);
            if !self.store.set_nx_ex(&cooldown_key, "1", cooldown).await? {
                warn!("otp requested during cooldown");
                return Err(OtpError::Cooldown);
            }
        }

        let code = generate_code();
        let minutes = self.cfg.ttl_secs.div_ceil(60);
        if let Err(e) = self.mailer.send_otp(email, &code, minutes).await {
            // Nothing was stored, so a retry must not be blocked.
            if let Err(del_err) = self.store.del(&cooldown_key).await {
                warn!(error = %del_err, "failed to clear otp cooldown");
            }
            return Err(OtpError::Internal(e.context("send otp email")));
        }

        self.store
            .set_ex(&keys::otp_code(email), &digest(&code), self.ttl())
            .await?;
        self.store.del(&keys::otp_attempts(email)).await?;
        debug!("otp issued");
        Ok(())
    }

    #[instrument(skip(self, code))]
    pub async fn verify(&self, email: &str, code: &str) -> Result<(), OtpError> {
        let code_key = keys::otp_code(email);
        let Some(stored) = self.store.get(&code_key).await? else {
            debug!("no outstanding otp");
            return Err(OtpError::InvalidOrExpired);
        };

        let submitted = digest(code.trim());
        if !constant_time_eq(stored.as_bytes(), submitted.as_bytes()) {
            let attempts = self
                .store
                .incr_ex(&keys::otp_attempts(email), self.ttl())
                .await?;
            if self.cfg.max_attempts > 0 && attempts >= u64::from(self.cfg.max_attempts) {
                self.store.del(&code_key).await?;
                warn!(attempts, "otp burned after too many failed attempts");
            } else {
                debug!(attempts, "otp mismatch");
            }
            return Err(OtpError::InvalidOrExpired);
        }

        // Only the caller whose DEL removed the key wins a concurrent race.
        if !self.store.del(&code_key).await? {
            return Err(OtpError::InvalidOrExpired);
        }

        self.store
            .set_ex(
                &keys::otp_verified(email),
                "true",
                Duration::from_secs(self.cfg.verified_ttl_secs),
            )
            .await?;
        self.store.del(&keys::otp_attempts(email)).await?;
        debug!("otp verified");
        Ok(())
    }

    pub async fn is_verified(&self, email: &str) -> anyhow::Result<bool> {
        let marker = self.store.get(&keys::otp_verified(email)).await?;
        Ok(marker.as_deref() == Some("true"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{mailer::fake::RecordingMailer, otp::store::memory::MemoryStore};

    const EMAIL: &str = "intern@uni.edu";

    fn service_with(cfg: OtpConfig) -> (OtpService, Arc<MemoryStore>, Arc<RecordingMailer>) {
        let store = Arc::new(MemoryStore::default());
        let mailer = Arc::new(RecordingMailer::default());
        let svc = OtpService::new(store.clone(), mailer.clone(), cfg);
        (svc, store, mailer)
    }

    fn service() -> (OtpService, Arc<MemoryStore>, Arc<RecordingMailer>) {
        service_with(OtpConfig {
            resend_cooldown_secs: 0,
            ..OtpConfig::default()
        })
    }

    #[test]
    fn codes_are_six_digits() {
        for _ in 0..200 {
            let code = generate_code();
            assert_eq!(code.len(), 6);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn digest_is_sha256_hex() {
        assert_eq!(
            digest("123456"),
            "8d969eef6ecad3c29a3a629280e686cf0c3f5d5a86aff3ca12020c923adc6c92"
        );
    }

    #[test]
    fn constant_time_eq_matches_equality() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
        assert!(!constant_time_eq(b"", b"a"));
    }

    #[tokio::test]
    async fn only_the_digest_is_stored() {
        let (svc, store, mailer) = service();
        svc.send(EMAIL).await.unwrap();

        let code = mailer.last_code_for(EMAIL).expect("code mailed");
        let stored = store.get(&keys::otp_code(EMAIL)).await.unwrap().unwrap();
        assert_ne!(stored, code);
        assert_eq!(stored, digest(&code));
    }

    #[tokio::test]
    async fn exact_code_verifies_exactly_once() {
        let (svc, _store, mailer) = service();
        svc.send(EMAIL).await.unwrap();
        let code = mailer.last_code_for(EMAIL).unwrap();

        svc.verify(EMAIL, &code).await.expect("first verification");
        assert!(svc.is_verified(EMAIL).await.unwrap());
        assert!(matches!(
            svc.verify(EMAIL, &code).await,
            Err(OtpError::InvalidOrExpired)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn code_expires_after_ttl() {
        let (svc, _store, mailer) = service();
        svc.send(EMAIL).await.unwrap();
        let code = mailer.last_code_for(EMAIL).unwrap();

        tokio::time::advance(Duration::from_secs(301)).await;
        assert!(matches!(
            svc.verify(EMAIL, &code).await,
            Err(OtpError::InvalidOrExpired)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn verified_marker_expires() {
        let (svc, _store, mailer) = service();
        svc.send(EMAIL).await.unwrap();
        let code = mailer.last_code_for(EMAIL).unwrap();
        svc.verify(EMAIL, &code).await.unwrap();

        tokio::time::advance(Duration::from_secs(601)).await;
        assert!(!svc.is_verified(EMAIL).await.unwrap());
    }

    #[tokio::test]
    async fn wrong_code_fails_generically() {
        let (svc, _store, mailer) = service();
        svc.send(EMAIL).await.unwrap();
        let code = mailer.last_code_for(EMAIL).unwrap();
        let wrong = if code == "000000" { "000001" } else { "000000" };

        assert!(matches!(
            svc.verify(EMAIL, wrong).await,
            Err(OtpError::InvalidOrExpired)
        ));
        // Still usable after one miss.
        svc.verify(EMAIL, &code).await.unwrap();
    }

    #[tokio::test]
    async fn code_is_burned_after_max_attempts() {
        let (svc, store, mailer) = service_with(OtpConfig {
            max_attempts: 3,
            resend_cooldown_secs: 0,
            ..OtpConfig::default()
        });
        svc.send(EMAIL).await.unwrap();
        let code = mailer.last_code_for(EMAIL).unwrap();
        let wrong = if code == "999999" { "999998" } else { "999999" };

        for _ in 0..3 {
            assert!(svc.verify(EMAIL, wrong).await.is_err());
        }
        assert_eq!(store.get(&keys::otp_code(EMAIL)).await.unwrap(), None);
        assert!(svc.verify(EMAIL, &code).await.is_err());
    }

    #[tokio::test]
    async fn resend_resets_attempts_and_replaces_code() {
        let (svc, store, mailer) = service();
        svc.send(EMAIL).await.unwrap();
        let first = mailer.last_code_for(EMAIL).unwrap();
        let wrong = if first == "111111" { "111112" } else { "111111" };
        let _ = svc.verify(EMAIL, wrong).await;
        assert_eq!(
            store.get(&keys::otp_attempts(EMAIL)).await.unwrap().as_deref(),
            Some("1")
        );

        svc.send(EMAIL).await.unwrap();
        assert_eq!(store.get(&keys::otp_attempts(EMAIL)).await.unwrap(), None);
        let second = mailer.last_code_for(EMAIL).unwrap();
        svc.verify(EMAIL, &second).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn resend_is_throttled_by_cooldown() {
        let (svc, _store, mailer) = service_with(OtpConfig::default());
        svc.send(EMAIL).await.unwrap();
        assert!(matches!(svc.send(EMAIL).await, Err(OtpError::Cooldown)));
        assert_eq!(mailer.sent_count(), 1);

        tokio::time::advance(Duration::from_secs(31)).await;
        svc.send(EMAIL).await.unwrap();
        assert_eq!(mailer.sent_count(), 2);
    }

    #[tokio::test]
    async fn mail_failure_stores_nothing() {
        let store = Arc::new(MemoryStore::default());
        let svc = OtpService::new(
            store.clone(),
            Arc::new(RecordingMailer::failing()),
            OtpConfig::default(),
        );

        assert!(matches!(svc.send(EMAIL).await, Err(OtpError::Internal(_))));
        assert_eq!(store.get(&keys::otp_code(EMAIL)).await.unwrap(), None);
        assert_eq!(store.get(&keys::otp_cooldown(EMAIL)).await.unwrap(), None);
    }

    /// Yields to the scheduler before every store call, so futures joined
    /// on one task interleave between the read and the delete of a code.
    #[derive(Default)]
    struct InterleavingStore(MemoryStore);

    #[async_trait::async_trait]
    impl EphemeralStore for InterleavingStore {
        async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
            tokio::task::yield_now().await;
            self.0.get(key).await
        }
        async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<()> {
            tokio::task::yield_now().await;
            self.0.set_ex(key, value, ttl).await
        }
        async fn set_nx_ex(&self, key: &str, value: &str, ttl: Duration) -> anyhow::Result<bool> {
            tokio::task::yield_now().await;
            self.0.set_nx_ex(key, value, ttl).await
        }
        async fn del(&self, key: &str) -> anyhow::Result<bool> {
            tokio::task::yield_now().await;
            self.0.del(key).await
        }
        async fn incr_ex(&self, key: &str, ttl: Duration) -> anyhow::Result<u64> {
            tokio::task::yield_now().await;
            self.0.incr_ex(key, ttl).await
        }
    }

    #[tokio::test]
    async fn interleaved_verifications_with_one_code_succeed_once() {
        let store = Arc::new(InterleavingStore::default());
        let mailer = Arc::new(RecordingMailer::default());
        let svc = OtpService::new(
            store.clone(),
            mailer.clone(),
            OtpConfig {
                resend_cooldown_secs: 0,
                ..OtpConfig::default()
            },
        );
        svc.send(EMAIL).await.unwrap();
        let code = mailer.last_code_for(EMAIL).unwrap();

        // Both reads happen before either delete, so only DEL decides the winner.
        let (a, b) = tokio::join!(svc.verify(EMAIL, &code), svc.verify(EMAIL, &code));
        assert_eq!([a.is_ok(), b.is_ok()].iter().filter(|ok| **ok).count(), 1);
        assert!(matches!(
            if a.is_ok() { b } else { a },
            Err(OtpError::InvalidOrExpired)
        ));
        assert!(svc.is_verified(EMAIL).await.unwrap());
        assert_eq!(store.get(&keys::otp_code(EMAIL)).await.unwrap(), None);
    }

    #[test]
    fn errors_map_to_http_statuses() {
        use axum::http::StatusCode;
        assert_eq!(
            ApiError::from(OtpError::InvalidOrExpired).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(OtpError::Cooldown).status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }
}
