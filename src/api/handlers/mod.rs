pub mod auth;
pub mod certificate;
pub mod health;
pub mod issue;
pub mod jwks;
pub mod quota;
pub mod status;
pub mod verify;

pub use self::auth::ApiKeyCache;
