use secrecy::SecretString;

/// Vault session state shared by startup, renewal and transit signing.
#[derive(Clone, Debug)]
pub struct GlobalArgs {
    pub vault_url: String,
    pub vault_token: SecretString,
    pub vault_db_role: String,
    pub vault_db_lease_id: String,
    pub vault_db_lease_duration: u64,
    pub vault_db_username: String,
    pub vault_db_password: SecretString,
}

impl GlobalArgs {
    #[must_use]
    pub fn new(url: String) -> Self {
        Self {
            vault_url: url,
            vault_token: SecretString::default(),
            vault_db_role: "enverify".to_string(),
            vault_db_lease_id: String::new(),
            vault_db_lease_duration: 0,
            vault_db_username: String::new(),
            vault_db_password: SecretString::default(),
        }
    }

    pub fn set_token(&mut self, token: SecretString) {
        self.vault_token = token;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    #[test]
    fn new_defaults_to_enverify_role() {
        let mut args = GlobalArgs::new("https://vault:8200".to_string());
        assert_eq!(args.vault_db_role, "enverify");
        assert_eq!(args.vault_token.expose_secret(), "");

        args.set_token(SecretString::from("s.abc".to_string()));
        assert_eq!(args.vault_token.expose_secret(), "s.abc");
    }
}
