pub mod repo;
pub mod repo_types;

pub use repo::{PgUserStore, UserStore};
pub use repo_types::{NewUser, ProfileUpdate, Role, Upsert, User};
