use crate::{cli::globals::GlobalArgs, vault};
use anyhow::{Result, anyhow};
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tracing::instrument;

/// Get dynamic database credentials for the configured role.
/// # Errors
/// Returns an error if the Vault request fails or the response is missing fields.
#[instrument(skip(globals))]
pub async fn database_creds(globals: &mut GlobalArgs) -> Result<()> {
    let db_creds = vault::endpoint_url(
        &globals.vault_url,
        &format!("/v1/database/creds/{}", globals.vault_db_role),
    )?;

    let response = vault::client()?
        .get(db_creds.as_str())
        .header("X-Vault-Token", globals.vault_token.expose_secret())
        .send()
        .await?;

    if !response.status().is_success() {
        let status = response.status();
        let json_response: Value = response.json().await?;

        return Err(anyhow!(
            "{} - {}, {}",
            db_creds,
            status,
            vault::vault_error_message(&json_response)
        ));
    }

    let json_response: Value = response.json().await?;

    let lease_id = json_response
        .get("lease_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_id found"))?;
    globals.vault_db_lease_id = lease_id.to_string();

    let lease_duration = json_response
        .get("lease_duration")
        .and_then(Value::as_u64)
        .ok_or_else(|| anyhow!("Error parsing JSON response: no lease_duration found"))?;
    globals.vault_db_lease_duration = lease_duration;

    let data = json_response
        .get("data")
        .ok_or_else(|| anyhow!("Error parsing JSON response: no data found"))?;

    let username = data
        .get("username")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Error parsing JSON response: no username found"))?;
    globals.vault_db_username = username.to_string();

    let password = data
        .get("password")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("Error parsing JSON response: no password found"))?;
    globals.vault_db_password = SecretString::from(password.to_string());

    Ok(())
}
