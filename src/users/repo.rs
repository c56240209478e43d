use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;

use super::repo_types::{NewUser, ProfileUpdate, Upsert, User, UserRow};

#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_uid(&self, uid: &str) -> anyhow::Result<Option<User>>;
    /// Atomic find-or-create keyed on uid.
    async fn find_or_create(&self, new: NewUser) -> anyhow::Result<Upsert>;
    /// Returns `None` when no user has this uid.
    async fn update_profile(&self, uid: &str, update: ProfileUpdate)
        -> anyhow::Result<Option<User>>;
}

#[derive(Clone)]
pub struct PgUserStore {
    db: PgPool,
}

impl PgUserStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }
}

#[async_trait]
impl UserStore for PgUserStore {
    async fn find_by_uid(&self, uid: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, uid, email, name, phone, role, created_at, updated_at
            FROM users
            WHERE uid = $1
            "#,
        )
        .bind(uid)
        .fetch_optional(&self.db)
        .await
        .context("find user by uid")?;
        row.map(User::try_from).transpose()
    }

    async fn find_or_create(&self, new: NewUser) -> anyhow::Result<Upsert> {
        if let Some(existing) = self.find_by_uid(&new.uid).await? {
            return Ok(Upsert::Existing(existing));
        }

        // ON CONFLICT closes the race between two first registrations of one uid.
        let inserted = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (uid, email, name, phone, role)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uid) DO NOTHING
            RETURNING id, uid, email, name, phone, role, created_at, updated_at
            "#,
        )
        .bind(&new.uid)
        .bind(&new.email)
        .bind(&new.name)
        .bind(&new.phone)
        .bind(new.role.as_str())
        .fetch_optional(&self.db)
        .await;

        match inserted {
            Ok(Some(row)) => Ok(Upsert::Created(row.try_into()?)),
            Ok(None) => {
                let user = self
                    .find_by_uid(&new.uid)
                    .await?
                    .context("user missing after conflicting insert")?;
                Ok(Upsert::Existing(user))
            }
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => Ok(Upsert::EmailTaken),
            Err(e) => Err(e).context("insert user"),
        }
    }

    async fn update_profile(
        &self,
        uid: &str,
        update: ProfileUpdate,
    ) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            UPDATE users
               SET name = COALESCE($2, name),
                   phone = CASE WHEN $3 THEN $4 ELSE phone END,
                   updated_at = now()
             WHERE uid = $1
            RETURNING id, uid, email, name, phone, role, created_at, updated_at
            "#,
        )
        .bind(uid)
        .bind(update.name)
        .bind(update.phone.is_some())
        .bind(update.phone.flatten())
        .fetch_optional(&self.db)
        .await
        .context("update user profile")?;
        row.map(User::try_from).transpose()
    }
}
