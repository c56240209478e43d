pub mod keys;
pub mod service;
pub mod store;

pub use service::OtpService;
pub use store::{EphemeralStore, RedisStore};
