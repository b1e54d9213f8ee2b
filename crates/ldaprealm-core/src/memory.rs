use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tracing::debug;
use url::Url;

use crate::directory::{
    referral_base, server_of, ConnectionProvider, DirectoryConnection, ReferralTarget,
    SearchRequest, SearchScope, SearchStep,
};
use crate::dn;
use crate::entry::LdapEntry;
use crate::error::RealmError;
use crate::filter;
use crate::ldif;

/// Counters describing how a [`MemoryDirectory`] has been used.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryStats {
    pub connections_opened: usize,
    pub connections_closed: usize,
    pub binds: usize,
    pub searches: usize,
}

/// One search as seen by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchRecord {
    pub server: String,
    pub base: String,
    pub filter: String,
}

/// A directory server held in memory, loaded from LDIF.
///
/// Serves searches with real filter evaluation and scoping, verifies binds
/// against `userPassword`, and redirects searches below entries of object
/// class `referral` to the URLs in their `ref` attribute. Peers registered
/// with [`add_peer`](Self::add_peer) answer those referrals.
#[derive(Clone)]
pub struct MemoryDirectory {
    inner: Arc<Inner>,
}

struct Inner {
    url: Url,
    server: String,
    entries: RwLock<Vec<LdapEntry>>,
    peers: RwLock<HashMap<String, MemoryDirectory>>,
    log: Mutex<Vec<SearchRecord>>,
    offline: AtomicBool,
    connections_opened: AtomicUsize,
    connections_closed: AtomicUsize,
    binds: AtomicUsize,
    searches: AtomicUsize,
}

impl MemoryDirectory {
    pub fn new(url: &str, entries: Vec<LdapEntry>) -> Result<Self, RealmError> {
        let url = Url::parse(url)
            .map_err(|e| RealmError::Configuration(format!("invalid directory URL '{url}': {e}")))?;
        Ok(Self {
            inner: Arc::new(Inner {
                server: server_of(&url),
                url,
                entries: RwLock::new(entries),
                peers: RwLock::new(HashMap::new()),
                log: Mutex::new(Vec::new()),
                offline: AtomicBool::new(false),
                connections_opened: AtomicUsize::new(0),
                connections_closed: AtomicUsize::new(0),
                binds: AtomicUsize::new(0),
                searches: AtomicUsize::new(0),
            }),
        })
    }

    /// Parse an LDIF string into a directory served at `url`.
    pub fn from_ldif(url: &str, content: &str) -> Result<Self, RealmError> {
        Self::new(url, ldif::parse_ldif(content)?)
    }

    /// Load an LDIF file into a directory served at `url`.
    pub fn load(url: &str, path: &Path) -> Result<Self, RealmError> {
        Self::new(url, ldif::load(path)?)
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    pub fn len(&self) -> usize {
        self.inner.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make `peer` reachable through referrals from this directory.
    pub fn add_peer(&self, peer: &MemoryDirectory) {
        self.inner
            .peers
            .write()
            .insert(peer.inner.server.clone(), peer.clone());
    }

    /// Add or replace an entry.
    pub fn put(&self, entry: LdapEntry) {
        let key = dn::normalize(&entry.dn);
        let mut entries = self.inner.entries.write();
        entries.retain(|e| dn::normalize(&e.dn) != key);
        entries.push(entry);
    }

    /// Remove an entry by DN. Returns whether it existed.
    pub fn remove(&self, dn: &str) -> bool {
        let key = dn::normalize(dn);
        let mut entries = self.inner.entries.write();
        let before = entries.len();
        entries.retain(|e| dn::normalize(&e.dn) != key);
        entries.len() != before
    }

    /// Look up an entry by exact DN (case-insensitive).
    pub fn entry(&self, dn: &str) -> Option<LdapEntry> {
        let key = dn::normalize(dn);
        self.inner
            .entries
            .read()
            .iter()
            .find(|e| dn::normalize(&e.dn) == key)
            .cloned()
    }

    /// Simulate the server becoming unreachable.
    pub fn set_offline(&self, offline: bool) {
        self.inner.offline.store(offline, Ordering::SeqCst);
    }

    pub fn stats(&self) -> DirectoryStats {
        DirectoryStats {
            connections_opened: self.inner.connections_opened.load(Ordering::SeqCst),
            connections_closed: self.inner.connections_closed.load(Ordering::SeqCst),
            binds: self.inner.binds.load(Ordering::SeqCst),
            searches: self.inner.searches.load(Ordering::SeqCst),
        }
    }

    pub fn search_log(&self) -> Vec<SearchRecord> {
        self.inner.log.lock().clone()
    }

    fn ensure_online(&self) -> Result<(), RealmError> {
        if self.inner.offline.load(Ordering::SeqCst) {
            return Err(RealmError::ConnectionFailed(format!(
                "{} is unreachable",
                self.inner.server
            )));
        }
        Ok(())
    }

    fn open(&self) -> Box<dyn DirectoryConnection> {
        self.inner.connections_opened.fetch_add(1, Ordering::SeqCst);
        Box::new(MemoryConnection {
            directory: self.clone(),
            open: true,
        })
    }

    fn execute(&self, request: &SearchRequest) -> Result<SearchStep, RealmError> {
        self.ensure_online()?;
        self.inner.searches.fetch_add(1, Ordering::SeqCst);
        self.inner.log.lock().push(SearchRecord {
            server: self.inner.server.clone(),
            base: request.base.clone(),
            filter: request.filter.clone(),
        });

        let entries = self.inner.entries.read();

        if let Some(referral) = entries
            .iter()
            .find(|e| e.has_object_class("referral") && dn::is_at_or_below(&request.base, &e.dn))
        {
            let urls: Vec<Url> = referral
                .values("ref")
                .iter()
                .filter_map(|r| Url::parse(r).ok())
                .map(|url| rewrite_referral(url, &referral.dn, &request.base))
                .collect();
            debug!("{}: base {} redirected to {:?}", self.inner.server, request.base, urls);
            return Ok(SearchStep::Referral(urls));
        }

        let base = dn::normalize(&request.base);
        if !entries.iter().any(|e| dn::normalize(&e.dn) == base) {
            return Err(RealmError::NoSuchEntry(request.base.clone()));
        }

        let parsed = filter::parse(&request.filter)
            .map_err(|e| RealmError::Directory(format!("invalid filter: {e}")))?;

        let (referrals, local): (Vec<&LdapEntry>, Vec<&LdapEntry>) = entries
            .iter()
            .filter(|e| match request.scope {
                SearchScope::Base => dn::normalize(&e.dn) == base,
                SearchScope::OneLevel => dn::is_child_of(&e.dn, &request.base),
                SearchScope::Subtree => dn::is_at_or_below(&e.dn, &request.base),
            })
            .partition(|e| e.has_object_class("referral"));

        let found = local
            .into_iter()
            .filter(|e| parsed.matches(e))
            .map(|e| e.clone().project(&request.attributes))
            .collect();
        let continuations: Vec<Url> = referrals
            .into_iter()
            .flat_map(|referral| {
                referral
                    .values("ref")
                    .iter()
                    .filter_map(|r| Url::parse(r).ok())
                    .map(|url| rewrite_referral(url, &referral.dn, &referral.dn))
                    .collect::<Vec<_>>()
            })
            .collect();
        if !continuations.is_empty() {
            debug!(
                "{}: search below {} continues at {:?}",
                self.inner.server, request.base, continuations
            );
        }
        Ok(SearchStep::Entries {
            entries: found,
            continuations,
        })
    }
}

/// Point a referral at the requested base, as servers do: the part of the
/// base below the referral entry is kept, the rest replaced by the URL's DN.
fn rewrite_referral(mut url: Url, referral_dn: &str, base: &str) -> Url {
    let target = referral_base(&url).unwrap_or_else(|| referral_dn.to_string());
    let base_parts = dn::components(base);
    let depth = base_parts
        .len()
        .saturating_sub(dn::components(referral_dn).len());
    let mut parts: Vec<&str> = base_parts[..depth].to_vec();
    parts.push(target.as_str());
    url.set_path(&format!("/{}", parts.join(",")));
    url
}

#[async_trait]
impl ConnectionProvider for MemoryDirectory {
    fn describe(&self) -> String {
        self.inner.url.to_string()
    }

    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, RealmError> {
        self.ensure_online()?;
        Ok(self.open())
    }

    async fn connect_as(
        &self,
        dn: &str,
        password: &str,
    ) -> Result<Box<dyn DirectoryConnection>, RealmError> {
        self.ensure_online()?;
        self.inner.binds.fetch_add(1, Ordering::SeqCst);
        // An empty password is an unauthenticated bind, which succeeds.
        if password.is_empty() {
            return Ok(self.open());
        }
        let verified = self
            .entry(dn)
            .map(|e| e.values("userPassword").iter().any(|p| p == password))
            .unwrap_or(false);
        if !verified {
            return Err(RealmError::InvalidCredentials);
        }
        Ok(self.open())
    }

    async fn find_for_referral(&self, referral: &Url) -> Result<ReferralTarget, RealmError> {
        let server = server_of(referral);
        if server == self.inner.server {
            return Ok(ReferralTarget::Same);
        }
        let peer = self.inner.peers.read().get(&server).cloned();
        Ok(match peer {
            Some(peer) => ReferralTarget::Other(Arc::new(peer)),
            None => ReferralTarget::Unresolvable,
        })
    }
}

struct MemoryConnection {
    directory: MemoryDirectory,
    open: bool,
}

#[async_trait]
impl DirectoryConnection for MemoryConnection {
    async fn search(&mut self, request: &SearchRequest) -> Result<SearchStep, RealmError> {
        if !self.open {
            return Err(RealmError::ConnectionFailed("connection closed".to_string()));
        }
        self.directory.execute(request)
    }

    async fn close(&mut self) -> Result<(), RealmError> {
        if std::mem::replace(&mut self.open, false) {
            self.directory
                .inner
                .connections_closed
                .fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}
