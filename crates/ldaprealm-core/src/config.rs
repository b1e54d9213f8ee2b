use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::cache::{CachePolicy, CacheSettings};
use crate::connection::TlsMode;
use crate::credentials::CredentialMethod;
use crate::error::RealmError;
use crate::filter::{self, USERNAME_PLACEHOLDER};
use crate::tls;

/// Complete configuration of one LDAP realm.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmConfig {
    pub realm: RealmSection,
    pub connection: ConnectionConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authentication: Option<AuthenticationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authorization: Option<AuthorizationConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealmSection {
    pub name: String,
    #[serde(default = "default_true")]
    pub map_groups_to_roles: bool,
}

/// Whether referrals returned by the directory are chased.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReferralMode {
    #[default]
    Follow,
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub url: String,
    #[serde(default)]
    pub tls_mode: TlsMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub credential_method: CredentialMethod,
    #[serde(default, skip_serializing)]
    pub credential: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_search_time_limit")]
    pub search_time_limit_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default)]
    pub referrals: ReferralMode,
    #[serde(default = "default_max_referral_hops")]
    pub max_referral_hops: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trusted_fingerprints: Vec<String>,
}

impl ConnectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn search_time_limit(&self) -> Duration {
        Duration::from_secs(self.search_time_limit_secs)
    }

    /// Referral hops allowed per search; zero when referrals are ignored.
    pub fn referral_hops(&self) -> usize {
        match self.referrals {
            ReferralMode::Follow => self.max_referral_hops,
            ReferralMode::Ignore => 0,
        }
    }
}

/// Password verification against the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticationConfig {
    pub base_dn: String,
    #[serde(default)]
    pub recursive: bool,
    #[serde(default = "default_dn_attribute")]
    pub user_dn_attribute: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_attribute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub advanced_filter: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_load: Option<String>,
    #[serde(default)]
    pub allow_empty_passwords: bool,
    #[serde(default)]
    pub cache: CacheConfig,
}

/// Group resolution against the directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_to_dn: Option<UsernameToDnConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_search: Option<GroupSearchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsernameToDnConfig {
    #[serde(flatten)]
    pub kind: UsernameToDnKind,
    /// Search again even when authentication already resolved the user.
    #[serde(default)]
    pub force: bool,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UsernameToDnKind {
    UsernameIsDn,
    UsernameFilter {
        base_dn: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default = "default_dn_attribute")]
        user_dn_attribute: String,
        #[serde(default = "default_username_attribute")]
        attribute: String,
    },
    AdvancedFilter {
        base_dn: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default = "default_dn_attribute")]
        user_dn_attribute: String,
        filter: String,
    },
}

/// How a directory entry is named: by its simple name or by its DN.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NameForm {
    #[default]
    Simple,
    Distinguished,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupSearchConfig {
    #[serde(flatten)]
    pub kind: GroupSearchKind,
    #[serde(default)]
    pub group_name: NameForm,
    #[serde(default)]
    pub iterative: bool,
    #[serde(default = "default_dn_attribute")]
    pub group_dn_attribute: String,
    #[serde(default = "default_username_attribute")]
    pub group_name_attribute: String,
    #[serde(default = "default_true")]
    pub prefer_original_connection: bool,
    #[serde(default)]
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GroupSearchKind {
    /// Groups name their members.
    GroupToPrincipal {
        #[serde(default)]
        base_dn: String,
        #[serde(default)]
        recursive: bool,
        #[serde(default = "default_search_by")]
        search_by: NameForm,
        #[serde(default = "default_principal_attribute")]
        principal_attribute: String,
    },
    /// Members name their groups.
    PrincipalToGroup {
        #[serde(default = "default_group_attribute")]
        group_attribute: String,
        #[serde(default)]
        skip_missing_groups: bool,
        #[serde(default)]
        parse_group_name_from_dn: bool,
    },
}

/// Cache table attached to one search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(rename = "type", default)]
    pub policy: CachePolicy,
    #[serde(default = "default_eviction_time")]
    pub eviction_time_secs: u64,
    #[serde(default)]
    pub cache_failures: bool,
    #[serde(default)]
    pub max_cache_size: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            policy: CachePolicy::Off,
            eviction_time_secs: default_eviction_time(),
            cache_failures: false,
            max_cache_size: 0,
        }
    }
}

impl CacheConfig {
    pub fn settings(&self) -> CacheSettings {
        CacheSettings {
            eviction_time: Duration::from_secs(self.eviction_time_secs),
            cache_failures: self.cache_failures,
            max_size: self.max_cache_size,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_timeout() -> u64 {
    30
}
fn default_search_time_limit() -> u64 {
    10
}
fn default_page_size() -> u32 {
    500
}
fn default_max_referral_hops() -> usize {
    10
}
fn default_dn_attribute() -> String {
    "dn".to_string()
}
fn default_username_attribute() -> String {
    "uid".to_string()
}
fn default_search_by() -> NameForm {
    NameForm::Distinguished
}
fn default_principal_attribute() -> String {
    "member".to_string()
}
fn default_group_attribute() -> String {
    "memberOf".to_string()
}
fn default_eviction_time() -> u64 {
    900
}

impl RealmConfig {
    /// Parse configuration from a TOML string. Does not validate.
    pub fn from_toml(content: &str) -> Result<Self, RealmError> {
        toml::from_str(content).map_err(|e| RealmError::Configuration(e.to_string()))
    }

    /// Read, parse and validate a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, RealmError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            RealmError::Configuration(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check the configuration before any directory access.
    pub fn validate(&self) -> Result<(), RealmError> {
        if self.realm.name.trim().is_empty() {
            return Err(invalid("realm name must not be empty"));
        }

        let url = Url::parse(&self.connection.url)
            .map_err(|e| invalid(format!("invalid url '{}': {}", self.connection.url, e)))?;
        if !matches!(url.scheme(), "ldap" | "ldaps") {
            return Err(invalid(format!(
                "url '{}' must use the ldap or ldaps scheme",
                self.connection.url
            )));
        }
        for fingerprint in &self.connection.trusted_fingerprints {
            tls::parse_fingerprint(fingerprint)?;
        }

        if self.authentication.is_none() && self.authorization.is_none() {
            return Err(invalid(
                "realm defines neither authentication nor authorization",
            ));
        }

        if let Some(auth) = &self.authentication {
            auth.validate()?;
        }
        if let Some(authz) = &self.authorization {
            authz.validate(self.authentication.is_some())?;
        }
        Ok(())
    }
}

impl AuthenticationConfig {
    fn validate(&self) -> Result<(), RealmError> {
        require_base_dn(&self.base_dn, "authentication")?;
        match (&self.username_attribute, &self.advanced_filter) {
            (Some(_), Some(_)) => Err(invalid(
                "authentication defines both username_attribute and advanced_filter",
            )),
            (None, None) => Err(invalid(
                "authentication needs one of username_attribute or advanced_filter",
            )),
            (None, Some(filter)) => check_advanced_filter(filter),
            (Some(attr), None) if attr.trim().is_empty() => {
                Err(invalid("username_attribute must not be empty"))
            }
            (Some(_), None) => Ok(()),
        }
    }
}

impl AuthorizationConfig {
    fn validate(&self, has_authentication: bool) -> Result<(), RealmError> {
        let Some(groups) = &self.group_search else {
            return Err(invalid("authorization needs a group_search"));
        };
        if let GroupSearchKind::GroupToPrincipal { base_dn, .. } = &groups.kind {
            require_base_dn(base_dn, "group-to-principal group search")?;
        }

        match &self.username_to_dn {
            None if !has_authentication => Err(invalid(
                "authorization without authentication needs username_to_dn",
            )),
            None => Ok(()),
            Some(to_dn) => match &to_dn.kind {
                UsernameToDnKind::UsernameIsDn => Ok(()),
                UsernameToDnKind::UsernameFilter {
                    base_dn, attribute, ..
                } => {
                    require_base_dn(base_dn, "username-filter")?;
                    if attribute.trim().is_empty() {
                        return Err(invalid("username-filter attribute must not be empty"));
                    }
                    Ok(())
                }
                UsernameToDnKind::AdvancedFilter {
                    base_dn, filter, ..
                } => {
                    require_base_dn(base_dn, "advanced-filter")?;
                    check_advanced_filter(filter)
                }
            },
        }
    }
}

fn require_base_dn(base_dn: &str, owner: &str) -> Result<(), RealmError> {
    if base_dn.trim().is_empty() {
        return Err(invalid(format!("{owner} needs a base_dn")));
    }
    Ok(())
}

fn check_advanced_filter(filter: &str) -> Result<(), RealmError> {
    if !filter.contains(USERNAME_PLACEHOLDER) {
        return Err(invalid(format!(
            "advanced filter '{filter}' does not contain {USERNAME_PLACEHOLDER}"
        )));
    }
    filter::validate_filter(&filter::substitute(filter, "x"))
        .map_err(|e| invalid(format!("advanced filter '{filter}': {e}")))
}

fn invalid(message: impl Into<String>) -> RealmError {
    RealmError::Configuration(message.into())
}
