//! Masking of account secrets in worker output.
//!
//! Worker logs can echo passwords and tokens verbatim (for example when a
//! server rejects a LOGIN). Every string that leaves this crate attached to an
//! error goes through [`redact`] first.

/// Replacement for every occurrence of a secret.
pub const MASK: &str = "*********";

/// Secret account settings that must never reach a log.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    /// `OAuth2` refresh token.
    pub refresh_token: Option<String>,
    /// IMAP password.
    pub imap_password: Option<String>,
    /// SMTP password.
    pub smtp_password: Option<String>,
}

impl Secrets {
    /// Extracts secrets from an account `settings` object.
    ///
    /// Missing, null or non-string fields become `None`; this never fails.
    #[must_use]
    pub fn from_settings(settings: &serde_json::Value) -> Self {
        let field = |name: &str| {
            settings
                .get(name)
                .and_then(serde_json::Value::as_str)
                .map(str::to_string)
        };
        Self {
            refresh_token: field("refresh_token"),
            imap_password: field("imap_password"),
            smtp_password: field("smtp_password"),
        }
    }

    fn iter(&self) -> impl Iterator<Item = &str> {
        [
            self.refresh_token.as_deref(),
            self.imap_password.as_deref(),
            self.smtp_password.as_deref(),
        ]
        .into_iter()
        .flatten()
        .filter(|s| !s.is_empty())
    }
}

impl std::fmt::Debug for Secrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let shown = |s: &Option<String>| s.as_ref().map(|_| MASK);
        f.debug_struct("Secrets")
            .field("refresh_token", &shown(&self.refresh_token))
            .field("imap_password", &shown(&self.imap_password))
            .field("smtp_password", &shown(&self.smtp_password))
            .finish()
    }
}

/// Replaces every literal occurrence of each present secret with [`MASK`].
///
/// Matching is plain substring matching, so characters that are special in
/// regular expressions have no effect. Absent or empty secrets are skipped.
///
/// A secret that contains `*` can appear again in the output, formed by the
/// mask and the text around it: `"a*"` in `"pw=aa*"` becomes
/// `"pw=a*********"`. No secret characters are left behind in that case.
/// Secrets without `*` never survive.
#[must_use]
pub fn redact(text: &str, secrets: &Secrets) -> String {
    let mut out = text.to_string();
    for secret in secrets.iter() {
        if out.contains(secret) {
            out = out.replace(secret, MASK);
        }
    }
    out
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::redundant_clone,
    clippy::manual_string_new,
    clippy::needless_collect,
    clippy::unreadable_literal,
    clippy::used_underscore_items,
    clippy::similar_names
)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn imap(password: &str) -> Secrets {
        Secrets {
            imap_password: Some(password.to_string()),
            ..Secrets::default()
        }
    }

    #[test]
    fn test_masks_every_occurrence() {
        let secrets = Secrets {
            refresh_token: Some("tok-123".into()),
            imap_password: Some("secretpw".into()),
            smtp_password: Some("smtppw".into()),
        };
        let text = "LOGIN user secretpw\nAUTH smtppw\nretry secretpw with tok-123";

        let out = redact(text, &secrets);

        assert_eq!(
            out,
            "LOGIN user *********\nAUTH *********\nretry ********* with *********"
        );
    }

    #[test]
    fn test_regex_metacharacters_are_literal() {
        let out = redact("pw=a.b and pw=axb", &imap("a.b"));
        assert_eq!(out, "pw=********* and pw=axb");

        let out = redact("p(a)ss$^ here", &imap("p(a)ss$^"));
        assert_eq!(out, "********* here");
    }

    #[test]
    fn test_absent_secrets_are_noop() {
        let text = "nothing to hide, not-present either";
        assert_eq!(redact(text, &Secrets::default()), text);
        assert_eq!(redact("", &Secrets::default()), "");
    }

    #[test]
    fn test_empty_secret_is_ignored() {
        assert_eq!(redact("abc", &imap("")), "abc");
    }

    #[test]
    fn test_from_settings_tolerates_garbage() {
        let settings = serde_json::json!({
            "imap_password": "pw",
            "smtp_password": null,
            "refresh_token": 42,
        });
        let secrets = Secrets::from_settings(&settings);
        assert_eq!(secrets.imap_password.as_deref(), Some("pw"));
        assert_eq!(secrets.smtp_password, None);
        assert_eq!(secrets.refresh_token, None);

        assert_eq!(Secrets::from_settings(&serde_json::Value::Null), Secrets::default());
    }

    #[test]
    fn test_debug_does_not_print_secrets() {
        let printed = format!("{:?}", imap("hunter2"));
        assert!(!printed.contains("hunter2"));
        assert!(printed.contains(MASK));
    }

    #[test]
    fn test_secret_with_mask_char_is_masked() {
        let out = redact("pw=aa*", &imap("a*"));
        assert_eq!(out, "pw=a*********");
        assert!(out.contains("a*"));
        assert_eq!(out.matches('a').count(), 1);
    }

    proptest! {
        /// Holds for any secret that does not contain the mask character.
        #[test]
        fn prop_secret_never_survives(
            secret in "[a-zA-Z0-9.+?()\\[\\]{}^$|\\\\-]{1,16}",
            prefix in ".{0,32}",
            suffix in ".{0,32}",
        ) {
            let text = format!("{prefix}{secret}{suffix}{secret}");
            let out = redact(&text, &imap(&secret));
            prop_assert!(!out.contains(&secret));
        }

        #[test]
        fn prop_no_secrets_is_identity(text in ".{0,64}") {
            prop_assert_eq!(redact(&text, &Secrets::default()), text);
        }
    }
}
