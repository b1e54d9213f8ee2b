use serde::{Deserialize, Serialize};
use tracing::debug;
use zeroize::Zeroizing;

use crate::error::RealmError;

/// Keyring service under which service-account passwords are stored.
pub const KEYCHAIN_SERVICE: &str = "ldaprealm";

/// How the password of the directory service account is obtained.
///
/// The meaning of the accompanying `credential` string depends on the
/// method: the password itself, an environment variable name, a shell
/// command, or a keychain account (defaulting to the bind DN).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialMethod {
    #[default]
    Plain,
    Env,
    Command,
    Keychain,
}

/// Resolve a password using the configured credential method.
pub struct CredentialProvider;

impl CredentialProvider {
    pub fn resolve(
        method: &CredentialMethod,
        credential: Option<&str>,
        account: &str,
    ) -> Result<Zeroizing<String>, RealmError> {
        match method {
            CredentialMethod::Plain => Ok(Zeroizing::new(
                required(credential, "a password")?.to_string(),
            )),
            CredentialMethod::Env => Self::from_env(required(credential, "a variable name")?),
            CredentialMethod::Command => Self::from_command(required(credential, "a command")?),
            CredentialMethod::Keychain => Self::from_keychain(credential.unwrap_or(account)),
        }
    }

    pub fn from_env(variable: &str) -> Result<Zeroizing<String>, RealmError> {
        std::env::var(variable)
            .map(Zeroizing::new)
            .map_err(|e| RealmError::Credential(format!("{variable}: {e}")))
    }

    /// Get password from a shell command (stdout, trailing newline removed).
    pub fn from_command(command: &str) -> Result<Zeroizing<String>, RealmError> {
        debug!("Running password command");
        let output = std::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .output()
            .map_err(|e| RealmError::Credential(format!("failed to run command: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(RealmError::Credential(format!(
                "password command failed ({}): {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = Zeroizing::new(output.stdout);
        let password = std::str::from_utf8(&stdout)
            .map_err(|e| RealmError::Credential(format!("invalid UTF-8 in password: {e}")))?
            .trim_end_matches('\n')
            .trim_end_matches('\r');
        Ok(Zeroizing::new(password.to_string()))
    }

    /// Get password from the OS keychain.
    pub fn from_keychain(account: &str) -> Result<Zeroizing<String>, RealmError> {
        let entry = keyring::Entry::new(KEYCHAIN_SERVICE, account)
            .map_err(|e| RealmError::Credential(format!("keychain access failed: {e}")))?;
        entry
            .get_password()
            .map(Zeroizing::new)
            .map_err(|e| RealmError::Credential(format!("keychain lookup for '{account}' failed: {e}")))
    }
}

fn required<'a>(credential: Option<&'a str>, what: &str) -> Result<&'a str, RealmError> {
    credential.ok_or_else(|| RealmError::Credential(format!("credential must name {what}")))
}
