//! Map validated CLI arguments to the action to run.

use crate::{
    api::SigningBackend,
    cli::{
        actions::{Action, server::Args},
        commands::{limits, signing, vault},
    },
    config::ServiceConfig,
    lock::CleanupConfig,
};
use anyhow::{Context, Result};

/// Map validated CLI matches to a server action.
///
/// # Errors
/// Returns an error if required arguments are missing or blank.
pub fn handler(matches: &clap::ArgMatches) -> Result<Action> {
    let port = matches.get_one::<u16>("port").copied().unwrap_or(8080);
    let dsn = matches
        .get_one::<String>("dsn")
        .cloned()
        .context("missing required argument: --dsn")?;

    let vault_opts = vault::Options::parse(matches)?;
    let signing_opts = signing::Options::parse(matches)?;
    let limits = limits::Options::parse(matches);

    let signing = if signing_opts.local_backend {
        SigningBackend::Local
    } else {
        SigningBackend::Vault {
            transit_mount: vault_opts.transit_mount.clone(),
        }
    };

    let service = ServiceConfig::new(
        signing_opts.token_signing_key,
        signing_opts.certificate_signing_key,
    )
    .with_token_issuer(signing_opts.token_issuer, signing_opts.token_audience)
    .with_certificate_issuer(
        signing_opts.certificate_issuer,
        signing_opts.certificate_audience,
    )
    .with_default_daily_quota(limits.default_daily_quota)
    .with_api_rate_limit(limits.api_rate_limit, chrono::Duration::minutes(1));

    Ok(Action::Server(Args {
        port,
        dsn,
        vault_url: vault_opts.url,
        vault_role_id: vault_opts.role_id,
        vault_secret_id: vault_opts.secret_id,
        vault_wrapped_token: vault_opts.wrapped_token,
        signing,
        service,
        key_hmac_secret: signing_opts.key_hmac_secret,
        quota_hmac_secret: signing_opts.quota_hmac_secret,
        cleanup: CleanupConfig::new(
            limits.cleanup_interval,
            chrono::Duration::hours(limits.retention_hours),
        ),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    type EnvVars = Vec<(&'static str, Option<&'static str>)>;

    fn vars(extra: &[(&'static str, Option<&'static str>)]) -> EnvVars {
        let mut vars = vec![
            ("ENVERIFY_DSN", Some("postgres://localhost:5432/enverify")),
            ("ENVERIFY_VAULT_URL", Some("http://127.0.0.1:8200")),
            ("ENVERIFY_VAULT_ROLE_ID", Some("role-id")),
            ("ENVERIFY_VAULT_SECRET_ID", Some("secret-id")),
            ("ENVERIFY_VAULT_WRAPPED_TOKEN", None),
            ("ENVERIFY_KEY_HMAC_SECRET", Some("key-secret")),
            ("ENVERIFY_QUOTA_HMAC_SECRET", Some("quota-secret")),
            ("ENVERIFY_SIGNING_BACKEND", None),
            ("ENVERIFY_TRANSIT_MOUNT", None),
        ];
        vars.retain(|(key, _)| !extra.iter().any(|(other, _)| other == key));
        vars.extend_from_slice(extra);
        vars
    }

    #[test]
    fn builds_server_args_with_vault_signing() {
        temp_env::with_vars(vars(&[("ENVERIFY_TRANSIT_MOUNT", Some("ens-transit"))]), || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["enverify"]);
            let Ok(Action::Server(args)) = handler(&matches) else {
                panic!("expected a server action");
            };

            assert_eq!(args.port, 8080);
            assert_eq!(
                args.signing,
                SigningBackend::Vault {
                    transit_mount: "ens-transit".to_string()
                }
            );
            assert_eq!(args.service.token_signing_key(), "token-signing");
            assert_eq!(args.service.default_daily_quota(), 1000);
            assert_eq!(args.key_hmac_secret.expose_secret(), "key-secret");
            assert!(args.vault_wrapped_token.is_none());
            assert_eq!(args.cleanup.retention(), chrono::Duration::hours(168));
        });
    }

    #[test]
    fn local_backend_is_selectable() {
        temp_env::with_vars(vars(&[("ENVERIFY_SIGNING_BACKEND", Some("local"))]), || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["enverify"]);
            let Ok(Action::Server(args)) = handler(&matches) else {
                panic!("expected a server action");
            };
            assert_eq!(args.signing, SigningBackend::Local);
        });
    }

    #[test]
    fn blank_secret_is_rejected() {
        temp_env::with_vars(vars(&[("ENVERIFY_KEY_HMAC_SECRET", Some("  "))]), || {
            let matches = crate::cli::commands::new().get_matches_from(vec!["enverify"]);
            let Err(err) = handler(&matches) else {
                panic!("blank secret must fail");
            };
            assert!(
                err.to_string()
                    .contains("missing required argument: --key-hmac-secret")
            );
        });
    }
}
