use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use crate::auth::{FirebaseVerifier, TokenVerifier};
use crate::config::AppConfig;
use crate::mailer::{Mailer, SmtpMailer};
use crate::otp::{EphemeralStore, OtpService, RedisStore};
use crate::users::{PgUserStore, UserStore};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub users: Arc<dyn UserStore>,
    pub otp: OtpService,
    pub verifier: Arc<dyn TokenVerifier>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = Arc::new(AppConfig::from_env()?);

        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(&config.database_url)
            .await
            .context("connect to database")?;
        sqlx::migrate!("./migrations")
            .run(&db)
            .await
            .context("run migrations")?;

        let store = Arc::new(RedisStore::connect(&config.redis_url).await?) as Arc<dyn EphemeralStore>;
        let mailer = Arc::new(SmtpMailer::new(&config.mail)?) as Arc<dyn Mailer>;
        let verifier =
            Arc::new(FirebaseVerifier::new(&config.firebase.project_id)?) as Arc<dyn TokenVerifier>;

        let otp = OtpService::new(store, mailer, config.otp.clone());
        let users = Arc::new(PgUserStore::new(db)) as Arc<dyn UserStore>;

        Ok(Self::from_parts(config, users, otp, verifier))
    }

    pub fn from_parts(
        config: Arc<AppConfig>,
        users: Arc<dyn UserStore>,
        otp: OtpService,
        verifier: Arc<dyn TokenVerifier>,
    ) -> Self {
        Self {
            config,
            users,
            otp,
            verifier,
        }
    }
}
