//! # enverify
//!
//! Verification service for exposure notification apps. A public health
//! authority issues a short-lived verification code to a person with a
//! positive test; the person's device exchanges that code for a verification
//! token, then exchanges the token plus an HMAC of its exposure keys for a
//! signed certificate that a key server accepts.
//!
//! ## Guarantees
//!
//! - A code is claimed at most once and a token is consumed at most once,
//!   across every replica. Both are enforced with row locks in `PostgreSQL`.
//! - Issuance quota and API rate limits live in the database, never in
//!   process memory.
//! - Codes and API keys are stored only as keyed HMAC digests.
//!
//! ## Layout
//!
//! - [`codes`], [`token`], [`certificate`]: the three exchange steps.
//! - [`quota`], [`lock`]: shared counters and the cleanup lock.
//! - [`signer`], [`vault`]: ES256 signing through Vault transit or local keys.
//! - [`store`]: storage traits with `PostgreSQL` and in-memory backends.
//! - [`api`], [`cli`]: HTTP surface and process startup.

pub mod api;
pub mod certificate;
pub mod cli;
pub mod codes;
pub mod config;
pub mod digest;
pub mod error;
pub mod lock;
pub mod quota;
pub mod realm;
pub mod signer;
pub mod sms;
pub mod store;
pub mod token;
pub mod vault;

pub static APP_USER_AGENT: &str =
    concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"),);

#[allow(clippy::doc_markdown, clippy::needless_raw_string_hashes)]
pub mod built_info {
    include!(concat!(env!("OUT_DIR"), "/built.rs"));
}

pub const GIT_COMMIT_HASH: &str = match built_info::GIT_COMMIT_HASH {
    Some(hash) => hash,
    None => "unknown",
};

#[cfg(test)]
mod tests {
    use anyhow::{Context, Result, ensure};
    use std::{fs, path::PathBuf};

    // Normalize SQL to avoid brittle formatting checks in schema tests.
    fn canonicalize_sql(sql: &str) -> String {
        sql.chars()
            .filter(|ch| !ch.is_whitespace())
            .map(|ch| ch.to_ascii_lowercase())
            .collect()
    }

    #[test]
    fn schema_enforces_digest_uniqueness() -> Result<()> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("sql/schema.sql");
        let sql = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read SQL file at {}", path.display()))?;
        let canonical = canonicalize_sql(&sql);

        for table in [
            "realms",
            "authorized_apps",
            "verification_codes",
            "tokens",
            "quota_buckets",
            "lock_status",
        ] {
            ensure!(
                canonical.contains(&format!("createtableifnotexists{table}")),
                "table {table} is missing from {}",
                path.display()
            );
        }
        ensure!(
            canonical.contains("code_digesttextnotnullunique"),
            "short code digest must be unique"
        );
        Ok(())
    }
}
