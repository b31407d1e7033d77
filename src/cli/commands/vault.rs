use clap::{Arg, ArgGroup, ArgMatches, Command};
use secrecy::SecretString;

pub const ARG_VAULT_URL: &str = "vault-url";
pub const ARG_VAULT_ROLE_ID: &str = "vault-role-id";
pub const ARG_VAULT_SECRET_ID: &str = "vault-secret-id";
pub const ARG_VAULT_WRAPPED_TOKEN: &str = "vault-wrapped-token";
pub const ARG_TRANSIT_MOUNT: &str = "transit-mount";

#[derive(Debug)]
pub struct Options {
    pub url: String,
    pub role_id: String,
    pub secret_id: Option<SecretString>,
    pub wrapped_token: Option<SecretString>,
    pub transit_mount: String,
}

impl Options {
    /// Parse Vault arguments from matches.
    ///
    /// # Errors
    /// Returns an error if the URL or role id is missing or blank.
    pub fn parse(matches: &ArgMatches) -> anyhow::Result<Self> {
        let get_non_empty = |id: &str| {
            matches
                .get_one::<String>(id)
                .cloned()
                .filter(|v| !v.trim().is_empty())
        };

        let Some(url) = get_non_empty(ARG_VAULT_URL) else {
            anyhow::bail!("missing required argument: --{ARG_VAULT_URL}");
        };
        let Some(role_id) = get_non_empty(ARG_VAULT_ROLE_ID) else {
            anyhow::bail!("missing required argument: --{ARG_VAULT_ROLE_ID}");
        };

        Ok(Self {
            url,
            role_id,
            secret_id: get_non_empty(ARG_VAULT_SECRET_ID).map(SecretString::from),
            wrapped_token: get_non_empty(ARG_VAULT_WRAPPED_TOKEN).map(SecretString::from),
            transit_mount: get_non_empty(ARG_TRANSIT_MOUNT).unwrap_or_else(|| "transit".to_string()),
        })
    }
}

#[must_use]
pub fn with_args(command: Command) -> Command {
    command
        .arg(
            Arg::new(ARG_VAULT_URL)
                .long(ARG_VAULT_URL)
                .help("Vault base URL, example: https://vault.tld:8200")
                .env("ENVERIFY_VAULT_URL")
                .required(true),
        )
        .arg(
            Arg::new(ARG_VAULT_ROLE_ID)
                .long(ARG_VAULT_ROLE_ID)
                .help("Vault AppRole role id")
                .env("ENVERIFY_VAULT_ROLE_ID")
                .required(true),
        )
        .arg(
            Arg::new(ARG_VAULT_SECRET_ID)
                .long(ARG_VAULT_SECRET_ID)
                .help("Vault AppRole secret id")
                .env("ENVERIFY_VAULT_SECRET_ID")
                .conflicts_with(ARG_VAULT_WRAPPED_TOKEN),
        )
        .arg(
            Arg::new(ARG_VAULT_WRAPPED_TOKEN)
                .long(ARG_VAULT_WRAPPED_TOKEN)
                .help("Response-wrapped AppRole secret id")
                .env("ENVERIFY_VAULT_WRAPPED_TOKEN"),
        )
        .arg(
            Arg::new(ARG_TRANSIT_MOUNT)
                .long(ARG_TRANSIT_MOUNT)
                .help("Vault transit mount holding the ECDSA signing keys")
                .env("ENVERIFY_TRANSIT_MOUNT")
                .default_value("transit"),
        )
        .group(
            ArgGroup::new("vault-auth")
                .args([ARG_VAULT_SECRET_ID, ARG_VAULT_WRAPPED_TOKEN])
                .required(true),
        )
}
