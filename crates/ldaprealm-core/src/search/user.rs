use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::directory::{SearchRequest, SearchScope, DEFAULT_SEARCH_TIME_LIMIT};
use crate::entry::DirectoryEntry;
use crate::error::RealmError;
use crate::filter;
use crate::handler::ConnectionHandler;

use super::{dn_of, follow_referrals, requested_attributes, Searcher};

/// A user as resolved from a login name.
///
/// Besides the directory entry it remembers a salted digest of the last
/// password that bound successfully, so a cached user can be re-verified
/// without another bind. The memo lives exactly as long as the cache entry.
#[derive(Debug)]
pub struct ResolvedUser {
    entry: DirectoryEntry,
    verified: Mutex<Option<[u8; 32]>>,
}

impl ResolvedUser {
    pub fn new(entry: DirectoryEntry) -> Self {
        Self {
            entry,
            verified: Mutex::new(None),
        }
    }

    pub fn entry(&self) -> &DirectoryEntry {
        &self.entry
    }

    /// Whether `password` is the one last recorded with [`remember`](Self::remember).
    pub fn is_verified(&self, password: &str) -> bool {
        let digest = self.digest(password);
        self.verified.lock().is_some_and(|known| known == digest)
    }

    pub fn remember(&self, password: &str) {
        *self.verified.lock() = Some(self.digest(password));
    }

    pub fn forget_password(&self) {
        *self.verified.lock() = None;
    }

    fn digest(&self, password: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.entry.distinguished_name().unwrap_or_default().as_bytes());
        hasher.update([0u8]);
        hasher.update(password.as_bytes());
        hasher.finalize().into()
    }
}

/// The login name is already the DN; no directory access.
#[derive(Debug, Default)]
pub struct UsernameIsDn;

#[async_trait]
impl Searcher<String, ResolvedUser> for UsernameIsDn {
    async fn search(
        &self,
        _handler: &mut ConnectionHandler,
        username: &String,
    ) -> Result<ResolvedUser, RealmError> {
        Ok(ResolvedUser::new(DirectoryEntry::new(
            Some(username.clone()),
            Some(username.clone()),
            None,
        )))
    }
}

/// How the login name is turned into a filter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    /// `(attribute=name)`
    Attribute(String),
    /// A template with `{0}` standing for the name.
    Advanced(String),
}

impl UserFilter {
    pub fn build(&self, username: &str) -> String {
        match self {
            UserFilter::Attribute(attr) => filter::equality(attr, username),
            UserFilter::Advanced(template) => filter::substitute(template, username),
        }
    }
}

/// Finds a user below a base DN with a filter built from the login name.
#[derive(Debug, Clone)]
pub struct FilterUserSearcher {
    pub base_dn: String,
    pub recursive: bool,
    pub filter: UserFilter,
    pub user_dn_attribute: String,
    /// Attribute whose value replaces the login name, if present on the entry.
    pub username_load: Option<String>,
    pub time_limit: Duration,
    pub max_referral_hops: usize,
}

impl FilterUserSearcher {
    pub fn new(base_dn: impl Into<String>, filter: UserFilter) -> Self {
        Self {
            base_dn: base_dn.into(),
            recursive: false,
            filter,
            user_dn_attribute: "dn".to_string(),
            username_load: None,
            time_limit: DEFAULT_SEARCH_TIME_LIMIT,
            max_referral_hops: 10,
        }
    }
}

#[async_trait]
impl Searcher<String, ResolvedUser> for FilterUserSearcher {
    async fn search(
        &self,
        handler: &mut ConnectionHandler,
        username: &String,
    ) -> Result<ResolvedUser, RealmError> {
        let not_found = || RealmError::NotFound(format!("user '{username}'"));

        let mut wanted = vec![self.user_dn_attribute.as_str()];
        wanted.extend(self.username_load.as_deref());
        let request = SearchRequest::new(
            self.base_dn.as_str(),
            SearchScope::for_recursive(self.recursive),
            self.filter.build(username),
        )
        .attributes(requested_attributes(wanted))
        .time_limit(self.time_limit);

        debug!(
            "Searching for user '{}' below {} with {}",
            username, request.base, request.filter
        );
        let Some((_, entries)) = follow_referrals(
            handler,
            ConnectionHandler::ROOT,
            &request,
            self.max_referral_hops,
        )
        .await?
        else {
            return Err(not_found());
        };

        let mut entries = entries.into_iter();
        let found = entries.next().ok_or_else(not_found)?;
        let ignored = entries.count();
        if ignored > 0 {
            debug!(
                "User search for '{}' matched {} more entries, using {}",
                username, ignored, found.dn
            );
        }

        let dn = dn_of(&found, &self.user_dn_attribute).ok_or_else(|| {
            RealmError::NotFound(format!(
                "user '{}' has no {} attribute",
                username, self.user_dn_attribute
            ))
        })?;
        let name = self
            .username_load
            .as_deref()
            .and_then(|attr| found.first_value(attr))
            .unwrap_or(username.as_str())
            .to_string();

        Ok(ResolvedUser::new(DirectoryEntry::new(
            Some(name),
            Some(dn),
            found.origin,
        )))
    }
}
