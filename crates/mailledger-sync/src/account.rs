//! Account binding for a worker invocation.

use serde_json::Value;

use crate::redact::Secrets;

/// The account and identity a worker is launched for.
///
/// `account` is the full account record including its secret settings; it is
/// written to the worker's stdin during the handshake and nowhere else.
#[derive(Clone)]
pub struct AccountBinding {
    account: Value,
    identity: Value,
    email: Option<String>,
    id: Option<String>,
    secrets: Secrets,
}

impl AccountBinding {
    /// Binds an account record and an identity record.
    ///
    /// The email address, id and secrets are read from the account record;
    /// missing fields are tolerated.
    #[must_use]
    pub fn new(account: Value, identity: Value) -> Self {
        let email = account
            .get("emailAddress")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = match account.get("id") {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        let secrets = account
            .get("settings")
            .map(Secrets::from_settings)
            .unwrap_or_default();

        Self {
            account,
            identity,
            email,
            id,
            secrets,
        }
    }

    /// Email address passed as `--info`.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Account id, if present.
    #[must_use]
    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    /// Secrets to redact from any output of this worker.
    #[must_use]
    pub const fn secrets(&self) -> &Secrets {
        &self.secrets
    }

    /// The two handshake lines: account record, then identity record.
    ///
    /// # Errors
    ///
    /// Returns an error if either record fails to serialize.
    pub fn handshake_payload(&self) -> serde_json::Result<Vec<u8>> {
        let mut payload = serde_json::to_vec(&self.account)?;
        payload.push(b'\n');
        serde_json::to_writer(&mut payload, &self.identity)?;
        payload.push(b'\n');
        Ok(payload)
    }
}

impl std::fmt::Debug for AccountBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountBinding")
            .field("id", &self.id)
            .field("email", &self.email)
            .field("secrets", &self.secrets)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn binding() -> AccountBinding {
        AccountBinding::new(
            json!({
                "id": 7,
                "emailAddress": "ann@example.com",
                "settings": {"imap_password": "secretpw"}
            }),
            json!({"token": "identity-token"}),
        )
    }

    #[test]
    fn test_fields_extracted() {
        let binding = binding();
        assert_eq!(binding.email(), Some("ann@example.com"));
        assert_eq!(binding.id(), Some("7"));
        assert_eq!(binding.secrets().imap_password.as_deref(), Some("secretpw"));
    }

    #[test]
    fn test_handshake_is_two_lines() {
        let payload = binding().handshake_payload().unwrap();
        let text = String::from_utf8(payload).unwrap();
        let lines: Vec<&str> = text.split_terminator('\n').collect();

        assert_eq!(lines.len(), 2);
        let account: Value = serde_json::from_str(lines[0]).unwrap();
        let identity: Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(account["emailAddress"], "ann@example.com");
        assert_eq!(identity["token"], "identity-token");
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_debug_hides_records() {
        let printed = format!("{:?}", binding());
        assert!(!printed.contains("secretpw"));
        assert!(!printed.contains("identity-token"));
    }

    #[test]
    fn test_sparse_account() {
        let binding = AccountBinding::new(json!({}), Value::Null);
        assert_eq!(binding.email(), None);
        assert_eq!(binding.id(), None);
        assert_eq!(binding.secrets(), &Secrets::default());
    }
}
