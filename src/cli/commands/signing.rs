use clap::{Arg, ArgMatches, Command, builder::PossibleValuesParser};
use secrecy::SecretString;

pub const ARG_TOKEN_SIGNING_KEY: &str = "token-signing-key";
pub const ARG_CERTIFICATE_SIGNING_KEY: &str = "certificate-signing-key";
pub const ARG_SIGNING_BACKEND: &str = "signing-backend";
pub const ARG_TOKEN_ISSUER: &str = "token-issuer";
pub const ARG_TOKEN_AUDIENCE: &str = "token-audience";
pub const ARG_CERTIFICATE_ISSUER: &str = "certificate-issuer";
pub const ARG_CERTIFICATE_AUDIENCE: &str = "certificate-audience";
pub const ARG_KEY_HMAC_SECRET: &str = "key-hmac-secret";
pub const ARG_QUOTA_HMAC_SECRET: &str = "quota-hmac-secret";

#[derive(Debug)]
pub struct Options {
    pub token_signing_key: String,
    pub certificate_signing_key: String,
    pub local_backend: bool,
    pub token_issuer: String,
    pub token_audience: String,
    pub certificate_issuer: String,
    pub certificate_audience: String,
    pub key_hmac_secret: SecretString,
    pub quota_hmac_secret: SecretString,
}

impl Options {
    /// Parse signing and digest arguments from matches.
    ///
    /// # Errors
    /// Returns an error if a key name or HMAC secret is missing or blank.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let required = |id: &str| -> anyhow::Result<String> {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("missing required argument: --{id}"))
        };

        Ok(Self {
            token_signing_key: required(ARG_TOKEN_SIGNING_KEY)?,
            certificate_signing_key: required(ARG_CERTIFICATE_SIGNING_KEY)?,
            local_backend: matches
                .get_one::<String>(ARG_SIGNING_BACKEND)
                .is_some_and(|backend| backend == "local"),
            token_issuer: required(ARG_TOKEN_ISSUER)?,
            token_audience: required(ARG_TOKEN_AUDIENCE)?,
            certificate_issuer: required(ARG_CERTIFICATE_ISSUER)?,
            certificate_audience: required(ARG_CERTIFICATE_AUDIENCE)?,
            key_hmac_secret: SecretString::from(required(ARG_KEY_HMAC_SECRET)?),
            quota_hmac_secret: SecretString::from(required(ARG_QUOTA_HMAC_SECRET)?),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_TOKEN_SIGNING_KEY)
                .long(ARG_TOKEN_SIGNING_KEY)
                .help("Key name used to sign verification tokens")
                .env("ENVERIFY_TOKEN_SIGNING_KEY")
                .default_value("token-signing"),
        )
        .arg(
            Arg::new(ARG_CERTIFICATE_SIGNING_KEY)
                .long(ARG_CERTIFICATE_SIGNING_KEY)
                .help("Key name used to sign certificates for realms without their own key")
                .env("ENVERIFY_CERTIFICATE_SIGNING_KEY")
                .default_value("certificate-signing"),
        )
        .arg(
            Arg::new(ARG_SIGNING_BACKEND)
                .long(ARG_SIGNING_BACKEND)
                .help("Where signing keys live; local keys are lost on restart")
                .env("ENVERIFY_SIGNING_BACKEND")
                .default_value("vault")
                .value_parser(PossibleValuesParser::new(["vault", "local"])),
        )
        .arg(
            Arg::new(ARG_TOKEN_ISSUER)
                .long(ARG_TOKEN_ISSUER)
                .help("iss claim of verification tokens")
                .env("ENVERIFY_TOKEN_ISSUER")
                .default_value("enverify"),
        )
        .arg(
            Arg::new(ARG_TOKEN_AUDIENCE)
                .long(ARG_TOKEN_AUDIENCE)
                .help("aud claim of verification tokens")
                .env("ENVERIFY_TOKEN_AUDIENCE")
                .default_value("enverify"),
        )
        .arg(
            Arg::new(ARG_CERTIFICATE_ISSUER)
                .long(ARG_CERTIFICATE_ISSUER)
                .help("Default iss claim of certificates")
                .env("ENVERIFY_CERTIFICATE_ISSUER")
                .default_value("enverify"),
        )
        .arg(
            Arg::new(ARG_CERTIFICATE_AUDIENCE)
                .long(ARG_CERTIFICATE_AUDIENCE)
                .help("Default aud claim of certificates")
                .env("ENVERIFY_CERTIFICATE_AUDIENCE")
                .default_value("exposure-notifications-server"),
        )
        .arg(
            Arg::new(ARG_KEY_HMAC_SECRET)
                .long(ARG_KEY_HMAC_SECRET)
                .help("Secret for the HMAC digests of codes and API keys")
                .env("ENVERIFY_KEY_HMAC_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new(ARG_QUOTA_HMAC_SECRET)
                .long(ARG_QUOTA_HMAC_SECRET)
                .help("Secret for the HMAC digests of quota and rate-limit keys")
                .env("ENVERIFY_QUOTA_HMAC_SECRET")
                .hide_env_values(true)
                .required(true),
        )
}
