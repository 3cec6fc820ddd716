//! Resolves the shared service-account password once at startup. Supports a
//! plain password or an encrypted-blob-plus-key pair; failure to decrypt is
//! fatal at startup per the provider's contract, never deferred to a
//! per-request path.

use crate::error::{Error, Result};

/// Minimal XOR-with-repeating-key "decryption" standing in for whatever KMS
/// unwraps the blob in the real deployment — the provider only needs a
/// deterministic transform it can fail loudly on, not a specific cipher.
fn decrypt(encrypted_b64: &str, key: &str) -> Result<String> {
    if key.is_empty() {
        return Err(Error::Config("SNAPSHOT_PASSWORD_KEY is empty".into()));
    }
    let cipher = base64_decode(encrypted_b64)
        .map_err(|e| Error::Config(format!("SNAPSHOT_USER_PASSWORD_ENCRYPTED is not valid base64: {e}")))?;
    let key_bytes = key.as_bytes();
    let plain: Vec<u8> = cipher
        .iter()
        .enumerate()
        .map(|(i, b)| b ^ key_bytes[i % key_bytes.len()])
        .collect();
    String::from_utf8(plain).map_err(|_| Error::Config("decrypted service-user password is not valid UTF-8".into()))
}

fn base64_decode(s: &str) -> std::result::Result<Vec<u8>, String> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .map_err(|e| e.to_string())
}

/// Resolved, in-memory service-account credential. Never logged or
/// `Debug`-derived in full.
#[derive(Clone)]
pub struct ServiceUserCredentials {
    pub email: String,
    pub password: String,
}

impl std::fmt::Debug for ServiceUserCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceUserCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Resolves the one-shot service-account credential from config. Returns
/// `Ok(None)` when the service user is administratively disabled — callers
/// must then always fall back to the admin session.
pub fn resolve(
    disabled: bool,
    email: Option<&str>,
    plain_password: Option<&str>,
    encrypted_password: Option<&str>,
    password_key: Option<&str>,
) -> Result<Option<ServiceUserCredentials>> {
    if disabled {
        return Ok(None);
    }
    let email = email
        .ok_or_else(|| Error::Config("SNAPSHOT_SERVICE_USER_EMAIL is required unless the service user is disabled".into()))?
        .to_string();

    let password = match (plain_password, encrypted_password, password_key) {
        (Some(p), None, None) => p.to_string(),
        (None, Some(blob), Some(key)) => decrypt(blob, key)?,
        (Some(_), Some(_), _) | (Some(_), _, Some(_)) => {
            return Err(Error::Config(
                "SNAPSHOT_SERVICE_USER_PASSWORD is mutually exclusive with the encrypted password pair".into(),
            ))
        }
        _ => {
            return Err(Error::Config(
                "either SNAPSHOT_SERVICE_USER_PASSWORD or SNAPSHOT_PASSWORD_KEY+SNAPSHOT_USER_PASSWORD_ENCRYPTED is required".into(),
            ))
        }
    };

    Ok(Some(ServiceUserCredentials { email, password }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_short_circuits_to_none() {
        let creds = resolve(true, None, None, None, None).unwrap();
        assert!(creds.is_none());
    }

    #[test]
    fn plain_password_resolves_directly() {
        let creds = resolve(false, Some("svc@example.com"), Some("hunter2"), None, None)
            .unwrap()
            .unwrap();
        assert_eq!(creds.password, "hunter2");
    }

    #[test]
    fn encrypted_pair_round_trips() {
        use base64::Engine;
        let key = "k1";
        let plain = "s3cret";
        let cipher: Vec<u8> = plain
            .bytes()
            .enumerate()
            .map(|(i, b)| b ^ key.as_bytes()[i % key.len()])
            .collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(cipher);
        let creds = resolve(false, Some("svc@example.com"), None, Some(&encoded), Some(key))
            .unwrap()
            .unwrap();
        assert_eq!(creds.password, plain);
    }

    #[test]
    fn missing_password_is_a_config_error() {
        let err = resolve(false, Some("svc@example.com"), None, None, None).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn mutually_exclusive_inputs_are_a_config_error() {
        let err = resolve(false, Some("svc@example.com"), Some("p"), Some("blob"), Some("k")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
