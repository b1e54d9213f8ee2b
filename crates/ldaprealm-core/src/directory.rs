use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::entry::LdapEntry;
use crate::error::RealmError;

/// Default client-side search time limit.
pub const DEFAULT_SEARCH_TIME_LIMIT: Duration = Duration::from_secs(10);

/// Search scope, mirroring the LDAP scopes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchScope {
    Base,
    OneLevel,
    Subtree,
}

impl SearchScope {
    /// Subtree when searching recursively, one level otherwise.
    pub fn for_recursive(recursive: bool) -> Self {
        if recursive {
            SearchScope::Subtree
        } else {
            SearchScope::OneLevel
        }
    }
}

impl From<SearchScope> for ldap3::Scope {
    fn from(scope: SearchScope) -> Self {
        match scope {
            SearchScope::Base => ldap3::Scope::Base,
            SearchScope::OneLevel => ldap3::Scope::OneLevel,
            SearchScope::Subtree => ldap3::Scope::Subtree,
        }
    }
}

/// One directory query.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub base: String,
    pub scope: SearchScope,
    pub filter: String,
    pub attributes: Vec<String>,
    pub time_limit: Duration,
}

impl SearchRequest {
    pub fn new(base: impl Into<String>, scope: SearchScope, filter: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            scope,
            filter: filter.into(),
            attributes: Vec::new(),
            time_limit: DEFAULT_SEARCH_TIME_LIMIT,
        }
    }

    /// Read attributes off a single entry.
    pub fn read(dn: impl Into<String>) -> Self {
        Self::new(dn, SearchScope::Base, "(objectClass=*)")
    }

    pub fn attributes<I, S>(mut self, attrs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attrs.into_iter().map(Into::into).collect();
        self
    }

    pub fn time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = limit;
        self
    }

    /// The same request re-targeted at the base DN carried by a referral URL,
    /// if it carries one.
    pub fn retarget(&self, referral: &Url) -> Self {
        let mut next = self.clone();
        if let Some(base) = referral_base(referral) {
            next.base = base;
        }
        next
    }

    /// The request to send along a continuation reference. A one-level
    /// search continues as a read of the referenced entry itself.
    pub fn continuation(&self, reference: &Url) -> Self {
        let mut next = self.retarget(reference);
        if next.scope == SearchScope::OneLevel {
            next.scope = SearchScope::Base;
        }
        next
    }
}

/// The outcome of one search round-trip.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchStep {
    /// The search completed on this server. Parts of the searched tree held
    /// by other servers are listed as continuation references.
    Entries {
        entries: Vec<LdapEntry>,
        continuations: Vec<Url>,
    },
    /// The server redirected the whole search elsewhere.
    Referral(Vec<Url>),
}

impl SearchStep {
    /// A completed search with nothing left to chase.
    pub fn entries(entries: Vec<LdapEntry>) -> Self {
        SearchStep::Entries {
            entries,
            continuations: Vec::new(),
        }
    }
}

/// Where a referral leads, from the point of view of a provider.
pub enum ReferralTarget {
    /// The referral points back at the same directory; keep using it.
    Same,
    /// A different directory that should serve the referral.
    Other(Arc<dyn ConnectionProvider>),
    /// The referral cannot be followed.
    Unresolvable,
}

impl fmt::Debug for ReferralTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReferralTarget::Same => f.write_str("Same"),
            ReferralTarget::Other(p) => write!(f, "Other({})", p.describe()),
            ReferralTarget::Unresolvable => f.write_str("Unresolvable"),
        }
    }
}

/// A live connection to one directory server.
///
/// Connections are owned by a single authentication attempt and are not
/// shared between tasks.
#[async_trait]
pub trait DirectoryConnection: Send {
    async fn search(&mut self, request: &SearchRequest) -> Result<SearchStep, RealmError>;

    async fn close(&mut self) -> Result<(), RealmError>;
}

/// Source of directory connections for one server.
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    /// Short human-readable identity, normally the server URL.
    fn describe(&self) -> String;

    /// Open a connection bound as the configured service account.
    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, RealmError>;

    /// Open a connection bound as `dn`. Fails with
    /// [`RealmError::InvalidCredentials`] when the directory rejects the password.
    async fn connect_as(
        &self,
        dn: &str,
        password: &str,
    ) -> Result<Box<dyn DirectoryConnection>, RealmError>;

    /// Decide which directory should serve a referral.
    async fn find_for_referral(&self, referral: &Url) -> Result<ReferralTarget, RealmError>;
}

/// The base DN carried in the path of an LDAP URL, percent-decoded.
pub fn referral_base(referral: &Url) -> Option<String> {
    ldap3::get_url_params(referral)
        .ok()
        .map(|params| params.base.into_owned())
        .filter(|base| !base.is_empty())
}

/// `scheme://host:port` of a referral, the part that identifies a server.
pub fn server_of(url: &Url) -> String {
    let port = url
        .port_or_known_default()
        .or_else(|| match url.scheme() {
            "ldaps" => Some(636),
            "ldap" => Some(389),
            _ => None,
        })
        .map(|p| format!(":{p}"))
        .unwrap_or_default();
    format!(
        "{}://{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default().to_lowercase(),
        port
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scope_for_recursive() {
        assert_eq!(SearchScope::for_recursive(true), SearchScope::Subtree);
        assert_eq!(SearchScope::for_recursive(false), SearchScope::OneLevel);
    }

    #[test]
    fn test_referral_base() {
        let url = Url::parse("ldap://replica:1389/ou=People%2Cdc=example").unwrap();
        assert_eq!(referral_base(&url).as_deref(), Some("ou=People,dc=example"));
        let bare = Url::parse("ldap://replica:1389").unwrap();
        assert_eq!(referral_base(&bare), None);
    }

    #[test]
    fn test_retarget() {
        let request = SearchRequest::new("ou=People,dc=example", SearchScope::Subtree, "(uid=a)")
            .attributes(["uid"]);
        let url = Url::parse("ldap://replica/ou=Staff,dc=example").unwrap();
        let moved = request.retarget(&url);
        assert_eq!(moved.base, "ou=Staff,dc=example");
        assert_eq!(moved.filter, "(uid=a)");
        assert_eq!(moved.attributes, vec!["uid".to_string()]);
        let unchanged = request.retarget(&Url::parse("ldap://replica").unwrap());
        assert_eq!(unchanged.base, request.base);
    }

    #[test]
    fn test_continuation_narrows_one_level() {
        let url = Url::parse("ldap://replica/ou=Remote,dc=example").unwrap();
        let one = SearchRequest::new("dc=example", SearchScope::OneLevel, "(uid=a)");
        let next = one.continuation(&url);
        assert_eq!(next.base, "ou=Remote,dc=example");
        assert_eq!(next.scope, SearchScope::Base);

        let sub = SearchRequest::new("dc=example", SearchScope::Subtree, "(uid=a)");
        assert_eq!(sub.continuation(&url).scope, SearchScope::Subtree);
    }

    #[test]
    fn test_server_of() {
        let url = Url::parse("ldap://Replica.Example/ou=x").unwrap();
        assert_eq!(server_of(&url), "ldap://replica.example:389");
        let url = Url::parse("ldaps://dc1:10636").unwrap();
        assert_eq!(server_of(&url), "ldaps://dc1:10636");
    }
}
