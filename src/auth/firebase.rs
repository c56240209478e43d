use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use jsonwebtoken::{decode, decode_header, jwk::JwkSet, Algorithm, DecodingKey, Validation};
use reqwest::header::CACHE_CONTROL;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Google's published keys for Firebase ID tokens, in JWK form.
pub const GOOGLE_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

const FALLBACK_KEY_TTL: Duration = Duration::from_secs(60 * 60);
const CLOCK_SKEW_SECS: u64 = 60;
/// An unknown `kid` only goes back to Google once per this interval.
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(60);

/// Payload of a Firebase ID token. Only `sub` (the uid) is relied on.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirebaseClaims {
    pub sub: String,
    pub aud: String,
    pub iss: String,
    pub iat: u64,
    pub exp: u64,
    #[serde(default)]
    pub auth_time: Option<u64>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub email_verified: Option<bool>,
}

#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> anyhow::Result<FirebaseClaims>;
}

struct CachedKeys {
    set: JwkSet,
    fetched_at: Instant,
    expires_at: Instant,
}

enum Lookup {
    Hit(DecodingKey),
    Miss,
    Refetch,
}

impl CachedKeys {
    fn lookup(cached: Option<&Self>, kid: &str) -> anyhow::Result<Lookup> {
        let Some(cached) = cached else {
            return Ok(Lookup::Refetch);
        };
        let now = Instant::now();
        let fresh = cached.expires_at > now;
        if fresh {
            if let Some(jwk) = cached.set.find(kid) {
                return Ok(Lookup::Hit(DecodingKey::from_jwk(jwk)?));
            }
        }
        if !fresh || now.duration_since(cached.fetched_at) >= MIN_REFETCH_INTERVAL {
            Ok(Lookup::Refetch)
        } else {
            Ok(Lookup::Miss)
        }
    }
}

/// Verifies ID tokens locally against Google's signing keys. Keys are cached
/// for the `max-age` Google advertises; verification results never are.
pub struct FirebaseVerifier {
    project_id: String,
    jwks_url: String,
    http: reqwest::Client,
    keys: RwLock<Option<CachedKeys>>,
}

impl FirebaseVerifier {
    pub fn new(project_id: impl Into<String>) -> anyhow::Result<Self> {
        Self::with_jwks_url(project_id, GOOGLE_JWKS_URL)
    }

    pub fn with_jwks_url(
        project_id: impl Into<String>,
        jwks_url: impl Into<String>,
    ) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build http client")?;
        Ok(Self {
            project_id: project_id.into(),
            jwks_url: jwks_url.into(),
            http,
            keys: RwLock::new(None),
        })
    }

    fn validation(&self) -> Validation {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_audience(std::slice::from_ref(&self.project_id));
        validation.set_issuer(&[format!("https://securetoken.google.com/{}", self.project_id)]);
        validation.set_required_spec_claims(&["exp", "iat", "sub", "aud", "iss"]);
        validation
    }

    async fn key_for(&self, kid: &str) -> anyhow::Result<DecodingKey> {
        let lookup = {
            let cached = self.keys.read().await;
            CachedKeys::lookup(cached.as_ref(), kid)?
        };
        match lookup {
            Lookup::Hit(key) => return Ok(key),
            Lookup::Miss => anyhow::bail!("unknown signing key {kid}"),
            Lookup::Refetch => {}
        }

        // The write lock is held across the fetch so concurrent misses wait
        // for one request and then re-check.
        let mut cached = self.keys.write().await;
        match CachedKeys::lookup(cached.as_ref(), kid)? {
            Lookup::Hit(key) => return Ok(key),
            Lookup::Miss => anyhow::bail!("unknown signing key {kid}"),
            Lookup::Refetch => {}
        }

        let (set, ttl) = self.fetch_keys().await?;
        let key = set
            .find(kid)
            .map(DecodingKey::from_jwk)
            .transpose()?
            .with_context(|| format!("unknown signing key {kid}"));
        let now = Instant::now();
        *cached = Some(CachedKeys {
            set,
            fetched_at: now,
            expires_at: now + ttl,
        });
        key
    }

    async fn fetch_keys(&self) -> anyhow::Result<(JwkSet, Duration)> {
        let res = self
            .http
            .get(&self.jwks_url)
            .send()
            .await
            .context("fetch firebase signing keys")?
            .error_for_status()
            .context("firebase signing keys endpoint")?;

        let ttl = res
            .headers()
            .get(CACHE_CONTROL)
            .and_then(|v| v.to_str().ok())
            .and_then(max_age)
            .unwrap_or(FALLBACK_KEY_TTL);

        let set = res
            .json::<JwkSet>()
            .await
            .context("decode firebase signing keys")?;
        debug!(keys = set.keys.len(), ttl_secs = ttl.as_secs(), "firebase signing keys refreshed");
        Ok((set, ttl))
    }
}

/// Extracts `max-age` from a Cache-Control header value.
pub(crate) fn max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .find_map(|directive| directive.trim().strip_prefix("max-age="))
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[async_trait]
impl TokenVerifier for FirebaseVerifier {
    async fn verify(&self, token: &str) -> anyhow::Result<FirebaseClaims> {
        let header = decode_header(token).context("malformed token header")?;
        if header.alg != Algorithm::RS256 {
            anyhow::bail!("unexpected token algorithm {:?}", header.alg);
        }
        let kid = header.kid.context("token has no key id")?;
        let key = self.key_for(&kid).await?;

        let claims = decode::<FirebaseClaims>(token, &key, &self.validation())
            .map_err(|e| {
                warn!(error = %e, "firebase token rejected");
                e
            })?
            .claims;

        if claims.sub.is_empty() {
            anyhow::bail!("token has an empty subject");
        }
        let now = SystemTime::now().duration_since(UNIX_EPOCH)?.as_secs();
        if claims.iat > now + CLOCK_SKEW_SECS {
            anyhow::bail!("token issued in the future");
        }
        if claims.auth_time.is_some_and(|t| t > now + CLOCK_SKEW_SECS) {
            anyhow::bail!("token auth_time is in the future");
        }

        debug!(uid = %claims.sub, "firebase token verified");
        Ok(claims)
    }
}
