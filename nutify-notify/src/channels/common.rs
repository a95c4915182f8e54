//! Functionality shared between channels.

use lazy_static::lazy_static;
use regex::Regex;

use nutify_common::secret::{SecretError, SecretStore};

use super::ChannelError;

lazy_static! {
    /// Intentionally simple: the SMTP server is the authority on deliverability;
    /// this only filters obvious junk before a dispatch is attempted.
    static ref EMAIL_RE: Regex =
        Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email regex");
}

/// Filter an address list down to plausible recipients.
///
/// Invalid addresses are dropped silently; an empty survivor list fails the
/// entire dispatch.
pub fn validate_recipients<'a>(
    addresses: impl IntoIterator<Item = &'a str>,
) -> Result<Vec<String>, ChannelError> {
    let valid: Vec<String> = addresses
        .into_iter()
        .map(str::trim)
        .filter(|a| EMAIL_RE.is_match(a))
        .map(str::to_owned)
        .collect();
    if valid.is_empty() {
        return Err(ChannelError::NoValidRecipients);
    }
    Ok(valid)
}

/// Decrypt a stored credential for a send.
///
/// A non-null ciphertext that will not decrypt under the current process
/// secret is a hard send-time error; a missing secret store fails closed the
/// same way.
pub fn decrypt_credential(
    secret: Option<&SecretStore>,
    ciphertext: Option<&str>,
) -> Result<Option<String>, ChannelError> {
    let Some(ciphertext) = ciphertext.filter(|c| !c.is_empty()) else {
        return Ok(None);
    };
    let Some(secret) = secret else {
        return Err(ChannelError::CredentialUnusable);
    };
    match secret.decrypt(ciphertext) {
        Ok(plaintext) => Ok(Some(plaintext)),
        Err(SecretError::KeyMismatch | SecretError::Corrupt | SecretError::MissingKey) => {
            Err(ChannelError::CredentialUnusable)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_recipients_filters_silently() {
        let valid = validate_recipients(vec![
            "ops@example.com",
            "not-an-address",
            " second@example.org ",
            "@broken.com",
        ])
        .unwrap();
        assert_eq!(valid, vec!["ops@example.com", "second@example.org"]);
    }

    #[test]
    fn test_validate_recipients_empty_fails() {
        let result = validate_recipients(vec!["nope", ""]);
        assert!(matches!(result, Err(ChannelError::NoValidRecipients)));
    }

    #[test]
    fn test_decrypt_credential() {
        let store = SecretStore::new("secret");
        let token = store.encrypt("hunter2");

        assert_eq!(
            decrypt_credential(Some(&store), Some(&token)).unwrap(),
            Some("hunter2".to_owned())
        );
        assert_eq!(decrypt_credential(Some(&store), None).unwrap(), None);
        assert_eq!(decrypt_credential(Some(&store), Some("")).unwrap(), None);

        // No secret store configured: fail closed on a stored credential.
        assert!(matches!(
            decrypt_credential(None, Some(&token)),
            Err(ChannelError::CredentialUnusable)
        ));

        // Wrong key: hard error.
        let other = SecretStore::new("other");
        assert!(matches!(
            decrypt_credential(Some(&other), Some(&token)),
            Err(ChannelError::CredentialUnusable)
        ));
    }
}
