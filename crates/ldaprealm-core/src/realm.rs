//! The LDAP security realm.
//!
//! [`RealmBuilder`] validates a [`RealmConfig`], wires the searchers and
//! their caches, and hands back a running [`LdapRealm`]. Every operation on
//! the realm opens one [`ConnectionHandler`] for the attempt and closes it
//! before returning.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::cache::SearchCache;
use crate::config::{
    AuthenticationConfig, GroupSearchConfig, GroupSearchKind, RealmConfig, UsernameToDnConfig,
    UsernameToDnKind,
};
use crate::connection::LdapConnectionProvider;
use crate::directory::ConnectionProvider;
use crate::entry::DirectoryEntry;
use crate::error::RealmError;
use crate::groups::{GroupCache, GroupResolver};
use crate::handler::ConnectionHandler;
use crate::principal::{RealmGroup, RealmPrincipal, RealmRole, RealmUser, Subject};
use crate::search::{
    FilterUserSearcher, GroupToPrincipalSearcher, PrincipalToGroupSearcher, ResolvedUser,
    Searcher, UserFilter, UsernameIsDn,
};

/// Cache of user lookups keyed by login name.
pub type UserCache = SearchCache<String, ResolvedUser>;

/// The caches a management operation can address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum CacheTarget {
    Authentication,
    UsernameToDn,
    GroupSearch,
}

/// Selects cache entries by name and/or DN; an absent part matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheFilter {
    pub name: Option<String>,
    pub distinguished_name: Option<String>,
}

impl CacheFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            distinguished_name: None,
        }
    }

    pub fn by_dn(dn: impl Into<String>) -> Self {
        Self {
            name: None,
            distinguished_name: Some(dn.into()),
        }
    }

    fn is_empty(&self) -> bool {
        self.name.is_none() && self.distinguished_name.is_none()
    }

    fn matches_user(&self, key: &str, user: Option<&ResolvedUser>) -> bool {
        let name_ok = match self.name.as_deref() {
            Some(name) => key == name || user.and_then(|u| u.entry().simple_name()) == Some(name),
            None => true,
        };
        let dn_ok = match self.distinguished_name.as_deref() {
            Some(dn) => user.is_some_and(|u| u.entry().matches(None, Some(dn))),
            None => true,
        };
        name_ok && dn_ok
    }

    fn matches_principal(&self, principal: &DirectoryEntry) -> bool {
        principal.matches(self.name.as_deref(), self.distinguished_name.as_deref())
    }
}

/// One step of an authentication request, dispatched by [`LdapRealm::handle`].
///
/// Steps that produce a result carry a slot for it, filled in by the realm.
pub enum AuthStep {
    /// The realm the request is addressed to; must match this realm's name.
    RealmCheck(String),
    /// The login name the following steps apply to.
    Name(String),
    /// Check a password for the named user.
    VerifyPassword {
        password: Zeroizing<String>,
        verified: bool,
    },
    /// Resolve the named user's groups and roles.
    Authorize { subject: Option<Subject> },
}

impl AuthStep {
    pub fn verify(password: impl Into<String>) -> Self {
        AuthStep::VerifyPassword {
            password: Zeroizing::new(password.into()),
            verified: false,
        }
    }

    pub fn authorize() -> Self {
        AuthStep::Authorize { subject: None }
    }
}

impl fmt::Debug for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthStep::RealmCheck(realm) => f.debug_tuple("RealmCheck").field(realm).finish(),
            AuthStep::Name(name) => f.debug_tuple("Name").field(name).finish(),
            AuthStep::VerifyPassword { verified, .. } => f
                .debug_struct("VerifyPassword")
                .field("password", &"<redacted>")
                .field("verified", verified)
                .finish(),
            AuthStep::Authorize { subject } => {
                f.debug_struct("Authorize").field("subject", subject).finish()
            }
        }
    }
}

struct UsernameToDn {
    cache: Arc<UserCache>,
    force: bool,
}

struct Services {
    provider: Arc<dyn ConnectionProvider>,
    map_groups_to_roles: bool,
    allow_empty_passwords: bool,
    authentication: Option<Arc<UserCache>>,
    username_to_dn: Option<UsernameToDn>,
    groups: Option<GroupResolver>,
}

impl Services {
    fn clear_caches(&self) {
        if let Some(cache) = &self.authentication {
            cache.clear_all();
        }
        if let Some(mapping) = &self.username_to_dn {
            mapping.cache.clear_all();
        }
        if let Some(groups) = &self.groups {
            groups.cache().clear_all();
        }
    }
}

enum RealmState {
    Running(Arc<Services>),
    Stopped,
}

/// Builds a running [`LdapRealm`] from validated configuration.
pub struct RealmBuilder {
    config: RealmConfig,
    provider: Option<Arc<dyn ConnectionProvider>>,
}

impl RealmBuilder {
    pub fn new(config: RealmConfig) -> Self {
        Self {
            config,
            provider: None,
        }
    }

    /// Use `provider` instead of connecting to `connection.url`.
    pub fn provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn build(self) -> Result<LdapRealm, RealmError> {
        let config = self.config;
        config.validate()?;

        let provider: Arc<dyn ConnectionProvider> = match self.provider {
            Some(provider) => provider,
            None => Arc::new(LdapConnectionProvider::from_config(&config.connection)?),
        };
        let limits = Limits {
            time_limit: config.connection.search_time_limit(),
            max_referral_hops: config.connection.referral_hops(),
        };
        let realm = config.realm.name.clone();

        let authentication = config
            .authentication
            .as_ref()
            .map(|auth| Arc::new(authentication_cache(&realm, auth, &limits)));
        let authorization = config.authorization.as_ref();
        let username_to_dn = authorization
            .and_then(|authz| authz.username_to_dn.as_ref())
            .map(|mapping| username_mapping(&realm, mapping, &limits));
        let groups = authorization
            .and_then(|authz| authz.group_search.as_ref())
            .map(|search| group_resolver(&realm, search, &limits));

        let services = Services {
            provider,
            map_groups_to_roles: config.realm.map_groups_to_roles,
            allow_empty_passwords: config
                .authentication
                .as_ref()
                .is_some_and(|auth| auth.allow_empty_passwords),
            authentication,
            username_to_dn,
            groups,
        };
        info!(
            "Realm '{}' started against {}",
            realm,
            services.provider.describe()
        );
        Ok(LdapRealm {
            name: realm,
            state: RwLock::new(RealmState::Running(Arc::new(services))),
        })
    }
}

struct Limits {
    time_limit: std::time::Duration,
    max_referral_hops: usize,
}

fn authentication_cache(realm: &str, auth: &AuthenticationConfig, limits: &Limits) -> UserCache {
    let filter = match (&auth.username_attribute, &auth.advanced_filter) {
        (_, Some(template)) => UserFilter::Advanced(template.clone()),
        (Some(attr), None) => UserFilter::Attribute(attr.clone()),
        (None, None) => UserFilter::Attribute("uid".to_string()),
    };
    let searcher = FilterUserSearcher {
        recursive: auth.recursive,
        user_dn_attribute: auth.user_dn_attribute.clone(),
        username_load: auth.username_load.clone(),
        time_limit: limits.time_limit,
        max_referral_hops: limits.max_referral_hops,
        ..FilterUserSearcher::new(auth.base_dn.clone(), filter)
    };
    SearchCache::new(
        format!("{realm}/authentication"),
        auth.cache.policy,
        auth.cache.settings(),
        Arc::new(searcher),
    )
}

fn username_mapping(realm: &str, mapping: &UsernameToDnConfig, limits: &Limits) -> UsernameToDn {
    let filter_searcher = |base_dn: &str, recursive: bool, dn_attr: &str, filter: UserFilter| {
        FilterUserSearcher {
            recursive,
            user_dn_attribute: dn_attr.to_string(),
            time_limit: limits.time_limit,
            max_referral_hops: limits.max_referral_hops,
            ..FilterUserSearcher::new(base_dn, filter)
        }
    };
    let searcher: Arc<dyn Searcher<String, ResolvedUser>> = match &mapping.kind {
        UsernameToDnKind::UsernameIsDn => Arc::new(UsernameIsDn),
        UsernameToDnKind::UsernameFilter {
            base_dn,
            recursive,
            user_dn_attribute,
            attribute,
        } => Arc::new(filter_searcher(
            base_dn,
            *recursive,
            user_dn_attribute,
            UserFilter::Attribute(attribute.clone()),
        )),
        UsernameToDnKind::AdvancedFilter {
            base_dn,
            recursive,
            user_dn_attribute,
            filter,
        } => Arc::new(filter_searcher(
            base_dn,
            *recursive,
            user_dn_attribute,
            UserFilter::Advanced(filter.clone()),
        )),
    };
    UsernameToDn {
        cache: Arc::new(SearchCache::new(
            format!("{realm}/username-to-dn"),
            mapping.cache.policy,
            mapping.cache.settings(),
            searcher,
        )),
        force: mapping.force,
    }
}

fn group_resolver(realm: &str, search: &GroupSearchConfig, limits: &Limits) -> GroupResolver {
    let searcher: Arc<dyn Searcher<DirectoryEntry, Vec<DirectoryEntry>>> = match &search.kind {
        GroupSearchKind::GroupToPrincipal {
            base_dn,
            recursive,
            search_by,
            principal_attribute,
        } => Arc::new(GroupToPrincipalSearcher {
            recursive: *recursive,
            search_by: *search_by,
            principal_attribute: principal_attribute.clone(),
            group_dn_attribute: search.group_dn_attribute.clone(),
            group_name_attribute: search.group_name_attribute.clone(),
            prefer_original_connection: search.prefer_original_connection,
            time_limit: limits.time_limit,
            max_referral_hops: limits.max_referral_hops,
            ..GroupToPrincipalSearcher::new(base_dn.clone())
        }),
        GroupSearchKind::PrincipalToGroup {
            group_attribute,
            skip_missing_groups,
            parse_group_name_from_dn,
        } => Arc::new(PrincipalToGroupSearcher {
            group_attribute: group_attribute.clone(),
            group_name_attribute: search.group_name_attribute.clone(),
            skip_missing_groups: *skip_missing_groups,
            parse_group_name_from_dn: *parse_group_name_from_dn,
            prefer_original_connection: search.prefer_original_connection,
            time_limit: limits.time_limit,
            max_referral_hops: limits.max_referral_hops,
        }),
    };
    let cache: GroupCache = SearchCache::new(
        format!("{realm}/group-search"),
        search.cache.policy,
        search.cache.settings(),
        searcher,
    );
    GroupResolver::new(Arc::new(cache), search.iterative, search.group_name)
}

/// A running (or stopped) LDAP realm.
///
/// The realm is shared by all concurrent authentication attempts; its
/// caches are the only state that outlives an attempt.
pub struct LdapRealm {
    name: String,
    state: RwLock<RealmState>,
}

impl LdapRealm {
    pub fn builder(config: RealmConfig) -> RealmBuilder {
        RealmBuilder::new(config)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.state.read(), RealmState::Running(_))
    }

    /// Stop the realm: caches are emptied and every later call fails with
    /// [`RealmError::Stopped`]. Stopping twice is harmless.
    pub fn stop(&self) {
        let previous = std::mem::replace(&mut *self.state.write(), RealmState::Stopped);
        if let RealmState::Running(services) = previous {
            services.clear_caches();
            info!("Realm '{}' stopped", self.name);
        }
    }

    fn services(&self) -> Result<Arc<Services>, RealmError> {
        match &*self.state.read() {
            RealmState::Running(services) => Ok(services.clone()),
            RealmState::Stopped => Err(RealmError::Stopped(self.name.clone())),
        }
    }

    /// Check `password` for `username`. Any failure is reported as
    /// [`RealmError::AuthenticationFailed`].
    pub async fn verify(&self, username: &str, password: &str) -> Result<(), RealmError> {
        let services = self.services()?;
        let mut handler = ConnectionHandler::new(services.provider.clone());
        let result = self
            .verify_password(&services, &mut handler, username, password)
            .await;
        handler.close().await;
        result.map(|_| ())
    }

    /// Resolve the groups and roles of `username` without checking a password.
    pub async fn authorize(&self, username: &str) -> Result<Subject, RealmError> {
        let services = self.services()?;
        let mut handler = ConnectionHandler::new(services.provider.clone());
        let result = self
            .build_subject(&services, &mut handler, username, None)
            .await;
        handler.close().await;
        result
    }

    /// Verify the password, then resolve groups and roles.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Subject, RealmError> {
        let services = self.services()?;
        let mut handler = ConnectionHandler::new(services.provider.clone());
        let result = async {
            let user = self
                .verify_password(&services, &mut handler, username, password)
                .await?;
            self.build_subject(&services, &mut handler, username, Some(user))
                .await
        }
        .await;
        handler.close().await;
        result
    }

    /// Process a sequence of authentication steps in order.
    ///
    /// `Name` must come before the steps that need it. A failed
    /// `VerifyPassword` stops processing with
    /// [`RealmError::AuthenticationFailed`], so `Authorize` only runs for
    /// verified users when a password step is present.
    pub async fn handle(&self, steps: &mut [AuthStep]) -> Result<(), RealmError> {
        let services = self.services()?;
        let mut handler = ConnectionHandler::new(services.provider.clone());
        let result = self.dispatch(&services, &mut handler, steps).await;
        handler.close().await;
        result
    }

    async fn dispatch(
        &self,
        services: &Services,
        handler: &mut ConnectionHandler,
        steps: &mut [AuthStep],
    ) -> Result<(), RealmError> {
        let mut username: Option<String> = None;
        let mut user: Option<Arc<ResolvedUser>> = None;

        for step in steps.iter_mut() {
            match step {
                AuthStep::RealmCheck(realm) => {
                    if *realm != self.name {
                        return Err(RealmError::InvalidRequest(format!(
                            "request for realm '{}' sent to realm '{}'",
                            realm, self.name
                        )));
                    }
                }
                AuthStep::Name(name) => {
                    username = Some(name.clone());
                    user = None;
                }
                AuthStep::VerifyPassword { password, verified } => {
                    let name = required_name(&username)?;
                    let resolved = self
                        .verify_password(services, handler, name, password.as_str())
                        .await;
                    *verified = resolved.is_ok();
                    user = Some(resolved?);
                }
                AuthStep::Authorize { subject } => {
                    let name = required_name(&username)?;
                    *subject = Some(
                        self.build_subject(services, handler, name, user.clone())
                            .await?,
                    );
                }
            }
        }
        Ok(())
    }

    async fn verify_password(
        &self,
        services: &Services,
        handler: &mut ConnectionHandler,
        username: &str,
        password: &str,
    ) -> Result<Arc<ResolvedUser>, RealmError> {
        let cache = services.authentication.as_ref().ok_or_else(|| {
            RealmError::InvalidRequest(format!("realm '{}' has no authentication", self.name))
        })?;

        if password.is_empty() && !services.allow_empty_passwords {
            debug!("Rejecting empty password for '{}'", username);
            return Err(RealmError::AuthenticationFailed);
        }

        let user = cache
            .search(handler, &username.to_string())
            .await
            .map_err(|e| {
                debug!("User lookup for '{}' failed: {}", username, e);
                RealmError::AuthenticationFailed
            })?;

        if user.is_verified(password) {
            debug!("Password for '{}' matched the remembered one", username);
            return Ok(user);
        }

        let Some(dn) = user.entry().distinguished_name() else {
            debug!("User '{}' has no DN to bind as", username);
            return Err(RealmError::AuthenticationFailed);
        };
        let provider = match user.entry().referral_origin() {
            Some(origin) => match handler.find_for_referral(ConnectionHandler::ROOT, origin).await {
                Ok(Some(id)) => handler.provider(id)?,
                Ok(None) => {
                    warn!("Cannot reach {} to verify '{}'", origin, username);
                    return Err(RealmError::AuthenticationFailed);
                }
                Err(e) => {
                    warn!("Referral {} for '{}' failed: {}", origin, username, e);
                    return Err(RealmError::AuthenticationFailed);
                }
            },
            None => services.provider.clone(),
        };

        match provider.connect_as(dn, password).await {
            Ok(mut connection) => {
                if let Err(e) = connection.close().await {
                    warn!("Ignoring close failure after bind: {}", e);
                }
                user.remember(password);
                info!("Verified password for '{}'", username);
                Ok(user)
            }
            Err(RealmError::InvalidCredentials) => {
                user.forget_password();
                info!("Wrong password for '{}'", username);
                Err(RealmError::AuthenticationFailed)
            }
            Err(e) => {
                warn!("Bind as {} failed: {}", dn, e);
                Err(RealmError::AuthenticationFailed)
            }
        }
    }

    /// The directory entry that group searches start from.
    async fn principal_for(
        &self,
        services: &Services,
        handler: &mut ConnectionHandler,
        username: &str,
        verified: Option<Arc<ResolvedUser>>,
    ) -> Result<Arc<ResolvedUser>, RealmError> {
        let key = username.to_string();
        let lookup = match (&services.username_to_dn, verified) {
            (Some(mapping), Some(user)) if !mapping.force => return Ok(user),
            (None, Some(user)) => return Ok(user),
            (Some(mapping), _) => mapping.cache.search(handler, &key).await,
            (None, None) => match &services.authentication {
                Some(cache) => cache.search(handler, &key).await,
                None => {
                    return Err(RealmError::InvalidRequest(format!(
                        "realm '{}' cannot map user names to entries",
                        self.name
                    )))
                }
            },
        };
        lookup.map_err(|e| {
            debug!("Mapping '{}' to an entry failed: {}", username, e);
            RealmError::AuthenticationFailed
        })
    }

    async fn build_subject(
        &self,
        services: &Services,
        handler: &mut ConnectionHandler,
        username: &str,
        verified: Option<Arc<ResolvedUser>>,
    ) -> Result<Subject, RealmError> {
        let mut subject = Subject::new(self.name.clone());
        let display = verified
            .as_ref()
            .and_then(|u| u.entry().simple_name().map(str::to_string))
            .unwrap_or_else(|| username.to_string());
        subject.add(RealmPrincipal::User(RealmUser::new(display)));

        let Some(resolver) = &services.groups else {
            return Ok(subject);
        };
        let user = self
            .principal_for(services, handler, username, verified)
            .await?;
        let groups: BTreeSet<RealmGroup> = resolver.resolve_groups(user.entry(), handler).await?;

        for group in groups {
            if services.map_groups_to_roles {
                subject.add(RealmPrincipal::Role(RealmRole::new(group.name())));
            }
            subject.add(RealmPrincipal::Group(group));
        }
        debug!(
            "Subject for '{}' carries {} principals",
            username,
            subject.principals.len()
        );
        Ok(subject)
    }

    /// Remove entries matching `filter` from one cache; an empty filter
    /// clears it. Returns the number of entries removed.
    pub fn flush_cache(&self, target: CacheTarget, filter: &CacheFilter) -> Result<usize, RealmError> {
        let services = self.services()?;
        let removed = match target {
            CacheTarget::Authentication | CacheTarget::UsernameToDn => {
                let cache = user_cache(&services, target)?;
                if filter.is_empty() {
                    let size = cache.current_size();
                    cache.clear_all();
                    size
                } else {
                    cache.clear_where(|key, user| filter.matches_user(key, user))
                }
            }
            CacheTarget::GroupSearch => {
                let cache = group_cache(&services)?;
                if filter.is_empty() {
                    let size = cache.current_size();
                    cache.clear_all();
                    size
                } else {
                    cache.clear_where(|key, _| filter.matches_principal(key))
                }
            }
        };
        info!("Flushed {} entries from {} cache", removed, target);
        Ok(removed)
    }

    pub fn cache_contains(&self, target: CacheTarget, filter: &CacheFilter) -> Result<bool, RealmError> {
        let services = self.services()?;
        match target {
            CacheTarget::Authentication | CacheTarget::UsernameToDn => Ok(user_cache(&services, target)?
                .contains(|key, user| filter.matches_user(key, user))),
            CacheTarget::GroupSearch => {
                Ok(group_cache(&services)?.contains(|key, _| filter.matches_principal(key)))
            }
        }
    }

    pub fn cache_size(&self, target: CacheTarget) -> Result<usize, RealmError> {
        let services = self.services()?;
        match target {
            CacheTarget::Authentication | CacheTarget::UsernameToDn => {
                Ok(user_cache(&services, target)?.current_size())
            }
            CacheTarget::GroupSearch => Ok(group_cache(&services)?.current_size()),
        }
    }
}

fn required_name(username: &Option<String>) -> Result<&str, RealmError> {
    username
        .as_deref()
        .ok_or_else(|| RealmError::InvalidRequest("no user name supplied".to_string()))
}

fn user_cache(services: &Services, target: CacheTarget) -> Result<Arc<UserCache>, RealmError> {
    let cache = match target {
        CacheTarget::Authentication => services.authentication.clone(),
        CacheTarget::UsernameToDn => services.username_to_dn.as_ref().map(|m| m.cache.clone()),
        CacheTarget::GroupSearch => None,
    };
    cache.ok_or_else(|| not_configured(target))
}

fn group_cache(services: &Services) -> Result<Arc<GroupCache>, RealmError> {
    services
        .groups
        .as_ref()
        .map(|g| g.cache().clone())
        .ok_or_else(|| not_configured(CacheTarget::GroupSearch))
}

fn not_configured(target: CacheTarget) -> RealmError {
    RealmError::Management(format!("no {target} source is configured"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::memory::MemoryDirectory;

    const LDIF: &str = r#"dn: dc=example
dc: example

dn: ou=People,dc=example
ou: People

dn: uid=alice,ou=People,dc=example
uid: alice
userPassword: wonderland
memberOf: cn=Admins,ou=Groups,dc=example

dn: uid=bob,ou=People,dc=example
uid: bob
userPassword: builder

dn: ou=Groups,dc=example
ou: Groups

dn: cn=Admins,ou=Groups,dc=example
cn: Admins
memberOf: cn=Staff,ou=Groups,dc=example

dn: cn=Staff,ou=Groups,dc=example
cn: Staff
"#;

    const CONFIG: &str = r#"
[realm]
name = "ManagementRealm"

[connection]
url = "ldap://localhost:389"

[authentication]
base_dn = "ou=People,dc=example"
username_attribute = "uid"

[authentication.cache]
type = "by-search-time"
eviction_time_secs = 0

[authorization.group_search]
type = "principal-to-group"
group_name_attribute = "cn"
iterative = true

[authorization.group_search.cache]
type = "by-access-time"
eviction_time_secs = 0
"#;

    fn realm_with(config: &str) -> (LdapRealm, MemoryDirectory) {
        let dir = MemoryDirectory::from_ldif("ldap://localhost:389", LDIF).unwrap();
        let config = RealmConfig::from_toml(config).unwrap();
        let realm = LdapRealm::builder(config)
            .provider(Arc::new(dir.clone()))
            .build()
            .unwrap();
        (realm, dir)
    }

    fn realm() -> (LdapRealm, MemoryDirectory) {
        realm_with(CONFIG)
    }

    #[tokio::test]
    async fn test_authenticate_builds_subject() {
        let (realm, _) = realm();
        let subject = realm.authenticate("alice", "wonderland").await.unwrap();
        assert_eq!(subject.realm, "ManagementRealm");
        assert_eq!(subject.user().map(|u| u.name()), Some("alice"));
        let groups: Vec<_> = subject.groups().map(|g| g.name()).collect();
        assert_eq!(groups, vec!["Admins", "Staff"]);
        assert!(subject.has_role("Admins"));
        assert!(subject.has_role("Staff"));
    }

    #[tokio::test]
    async fn test_failures_are_opaque() {
        let (realm, _) = realm();
        assert_eq!(
            realm.verify("alice", "wrong").await,
            Err(RealmError::AuthenticationFailed)
        );
        assert_eq!(
            realm.verify("nobody", "wonderland").await,
            Err(RealmError::AuthenticationFailed)
        );
    }

    #[tokio::test]
    async fn test_empty_password_rejected_without_directory_access() {
        let (realm, dir) = realm();
        assert_eq!(
            realm.verify("alice", "").await,
            Err(RealmError::AuthenticationFailed)
        );
        assert_eq!(dir.stats().connections_opened, 0);
        assert_eq!(dir.stats().binds, 0);
    }

    #[tokio::test]
    async fn test_empty_password_allowed_when_configured() {
        let config = CONFIG.replace(
            "username_attribute = \"uid\"",
            "username_attribute = \"uid\"\nallow_empty_passwords = true",
        );
        let (realm, dir) = realm_with(&config);
        realm.verify("alice", "").await.unwrap();
        assert_eq!(dir.stats().binds, 1);
    }

    #[tokio::test]
    async fn test_remembered_password_skips_bind() {
        let (realm, dir) = realm();
        realm.verify("alice", "wonderland").await.unwrap();
        realm.verify("alice", "wonderland").await.unwrap();
        assert_eq!(dir.stats().binds, 1);

        // A different password goes back to the directory.
        assert!(realm.verify("alice", "other").await.is_err());
        assert_eq!(dir.stats().binds, 2);

        // Flushing the user forgets the memo.
        realm.verify("alice", "wonderland").await.unwrap();
        assert_eq!(dir.stats().binds, 3);
        realm
            .flush_cache(CacheTarget::Authentication, &CacheFilter::by_name("alice"))
            .unwrap();
        realm.verify("alice", "wonderland").await.unwrap();
        assert_eq!(dir.stats().binds, 4);
    }

    #[tokio::test]
    async fn test_connections_closed_after_attempt() {
        let (realm, dir) = realm();
        realm.authenticate("alice", "wonderland").await.unwrap();
        let stats = dir.stats();
        assert!(stats.connections_opened > 0);
        assert_eq!(stats.connections_opened, stats.connections_closed);
    }

    #[tokio::test]
    async fn test_handle_dispatches_steps() {
        let (realm, _) = realm();
        let mut steps = vec![
            AuthStep::RealmCheck("ManagementRealm".to_string()),
            AuthStep::Name("alice".to_string()),
            AuthStep::verify("wonderland"),
            AuthStep::authorize(),
        ];
        realm.handle(&mut steps).await.unwrap();
        assert!(matches!(steps[2], AuthStep::VerifyPassword { verified: true, .. }));
        match &steps[3] {
            AuthStep::Authorize { subject: Some(subject) } => {
                assert!(subject.has_role("Staff"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_handle_rejects_bad_requests() {
        let (realm, _) = realm();
        let mut wrong_realm = vec![AuthStep::RealmCheck("ApplicationRealm".to_string())];
        assert!(matches!(
            realm.handle(&mut wrong_realm).await,
            Err(RealmError::InvalidRequest(_))
        ));

        let mut nameless = vec![AuthStep::verify("wonderland")];
        assert!(matches!(
            realm.handle(&mut nameless).await,
            Err(RealmError::InvalidRequest(_))
        ));

        let mut wrong_password = vec![
            AuthStep::Name("alice".to_string()),
            AuthStep::verify("nope"),
            AuthStep::authorize(),
        ];
        assert_eq!(
            realm.handle(&mut wrong_password).await,
            Err(RealmError::AuthenticationFailed)
        );
        assert!(matches!(
            wrong_password[1],
            AuthStep::VerifyPassword { verified: false, .. }
        ));
        assert!(matches!(wrong_password[2], AuthStep::Authorize { subject: None }));
    }

    #[tokio::test]
    async fn test_management_operations() {
        let (realm, _) = realm();
        realm.authenticate("alice", "wonderland").await.unwrap();

        assert_eq!(realm.cache_size(CacheTarget::Authentication).unwrap(), 1);
        assert!(realm
            .cache_contains(
                CacheTarget::Authentication,
                &CacheFilter::by_dn("UID=alice,ou=People,dc=example")
            )
            .unwrap());
        assert!(realm
            .cache_contains(
                CacheTarget::GroupSearch,
                &CacheFilter::by_name("Admins")
            )
            .unwrap());
        assert_eq!(realm.cache_size(CacheTarget::GroupSearch).unwrap(), 3);

        assert_eq!(
            realm
                .flush_cache(CacheTarget::GroupSearch, &CacheFilter::by_name("Admins"))
                .unwrap(),
            1
        );
        assert_eq!(
            realm
                .flush_cache(CacheTarget::GroupSearch, &CacheFilter::all())
                .unwrap(),
            2
        );
        assert_eq!(realm.cache_size(CacheTarget::GroupSearch).unwrap(), 0);

        assert!(matches!(
            realm.cache_size(CacheTarget::UsernameToDn),
            Err(RealmError::Management(_))
        ));
    }

    #[tokio::test]
    async fn test_username_to_dn_reused_unless_forced() {
        let forced = format!(
            "{CONFIG}\n[authorization.username_to_dn]\ntype = \"username-filter\"\nbase_dn = \"ou=People,dc=example\"\nforce = true\n\n[authorization.username_to_dn.cache]\ntype = \"by-search-time\"\neviction_time_secs = 0\n"
        );
        let (realm, _) = realm_with(&forced);
        realm.authenticate("alice", "wonderland").await.unwrap();
        assert_eq!(realm.cache_size(CacheTarget::UsernameToDn).unwrap(), 1);

        let lazy = forced.replace("force = true", "force = false");
        let (realm, _) = realm_with(&lazy);
        realm.authenticate("alice", "wonderland").await.unwrap();
        assert_eq!(realm.cache_size(CacheTarget::UsernameToDn).unwrap(), 0);

        // Without a password step the mapping is searched.
        let subject = realm.authorize("alice").await.unwrap();
        assert!(subject.has_role("Admins"));
        assert_eq!(realm.cache_size(CacheTarget::UsernameToDn).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_roles_not_mapped_when_disabled() {
        let config = CONFIG.replace(
            "name = \"ManagementRealm\"",
            "name = \"ManagementRealm\"\nmap_groups_to_roles = false",
        );
        let (realm, _) = realm_with(&config);
        let subject = realm.authenticate("alice", "wonderland").await.unwrap();
        assert_eq!(subject.groups().count(), 2);
        assert_eq!(subject.roles().count(), 0);
    }

    #[tokio::test]
    async fn test_stopped_realm_refuses_work() {
        let (realm, _) = realm();
        realm.authenticate("alice", "wonderland").await.unwrap();
        assert!(realm.is_running());
        realm.stop();
        realm.stop();
        assert!(!realm.is_running());
        assert_eq!(
            realm.verify("alice", "wonderland").await,
            Err(RealmError::Stopped("ManagementRealm".to_string()))
        );
        assert!(matches!(
            realm.cache_size(CacheTarget::Authentication),
            Err(RealmError::Stopped(_))
        ));
    }

    #[test]
    fn test_invalid_configuration_fails_build() {
        let config = RealmConfig::from_toml(&CONFIG.replace(
            "username_attribute = \"uid\"",
            "username_attribute = \"uid\"\nadvanced_filter = \"(uid={0})\"",
        ))
        .unwrap();
        let dir = MemoryDirectory::from_ldif("ldap://localhost:389", LDIF).unwrap();
        let err = LdapRealm::builder(config)
            .provider(Arc::new(dir))
            .build()
            .err()
            .unwrap();
        assert!(matches!(err, RealmError::Configuration(_)));
    }

    #[test]
    fn test_cache_target_names() {
        assert_eq!(CacheTarget::UsernameToDn.to_string(), "username-to-dn");
        assert_eq!(
            "group-search".parse::<CacheTarget>().unwrap(),
            CacheTarget::GroupSearch
        );
    }
}
