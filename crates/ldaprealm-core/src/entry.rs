use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::dn;

/// A raw directory record: its DN and attributes as returned by a search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LdapEntry {
    pub dn: String,
    pub attributes: BTreeMap<String, Vec<String>>,
    /// Set when the record was obtained from another server by following
    /// a continuation reference.
    #[serde(skip)]
    pub origin: Option<Url>,
}

impl LdapEntry {
    pub fn new(dn: String, attributes: BTreeMap<String, Vec<String>>) -> Self {
        Self {
            dn,
            attributes,
            origin: None,
        }
    }

    pub fn from_search_entry(entry: ldap3::SearchEntry) -> Self {
        Self::new(entry.dn, entry.attrs.into_iter().collect())
    }

    pub fn with_origin(mut self, origin: Option<Url>) -> Self {
        self.origin = origin;
        self
    }

    /// All values of an attribute, matching the name case-insensitively.
    pub fn values(&self, attr: &str) -> &[String] {
        self.attributes
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(attr))
            .map(|(_, vals)| vals.as_slice())
            .unwrap_or(&[])
    }

    /// Get the first value of an attribute, if present.
    pub fn first_value(&self, attr: &str) -> Option<&str> {
        self.values(attr).first().map(|s| s.as_str())
    }

    pub fn has_object_class(&self, class: &str) -> bool {
        self.values("objectClass")
            .iter()
            .any(|c| c.eq_ignore_ascii_case(class))
    }

    /// Keep only the requested attributes. An empty list or `*` keeps everything.
    pub fn project(mut self, attrs: &[String]) -> Self {
        if attrs.is_empty() || attrs.iter().any(|a| a == "*") {
            return self;
        }
        self.attributes
            .retain(|name, _| attrs.iter().any(|a| a.eq_ignore_ascii_case(name)));
        self
    }
}

/// A resolved directory identity: a user or a group as the realm sees it.
///
/// Immutable once built. Equality and hashing cover the simple name, the
/// DN, the resolution chain and the referral origin.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DirectoryEntry {
    simple_name: Option<String>,
    distinguished_name: Option<String>,
    previous: Option<Arc<DirectoryEntry>>,
    referral_origin: Option<Url>,
}

impl DirectoryEntry {
    pub fn new(
        simple_name: Option<String>,
        distinguished_name: Option<String>,
        referral_origin: Option<Url>,
    ) -> Self {
        Self {
            simple_name,
            distinguished_name,
            previous: None,
            referral_origin,
        }
    }

    pub fn simple_name(&self) -> Option<&str> {
        self.simple_name.as_deref()
    }

    pub fn distinguished_name(&self) -> Option<&str> {
        self.distinguished_name.as_deref()
    }

    pub fn referral_origin(&self) -> Option<&Url> {
        self.referral_origin.as_ref()
    }

    pub fn previous(&self) -> Option<&DirectoryEntry> {
        self.previous.as_deref()
    }

    /// Record that this entry was reached from `previous` during a group walk.
    pub fn reached_from(&self, previous: &DirectoryEntry) -> Self {
        Self {
            previous: Some(Arc::new(previous.clone())),
            ..self.clone()
        }
    }

    /// This entry without its resolution chain, as used for cache lookups.
    pub fn detached(&self) -> Self {
        Self {
            previous: None,
            ..self.clone()
        }
    }

    /// Names along the resolution chain, starting with this entry.
    pub fn chain(&self) -> Vec<&str> {
        let mut names = Vec::new();
        let mut current = Some(self);
        while let Some(entry) = current {
            names.push(entry.display_name());
            current = entry.previous();
        }
        names
    }

    /// Match against a partial (name, DN) pair; an absent part matches anything.
    pub fn matches(&self, name: Option<&str>, distinguished_name: Option<&str>) -> bool {
        let name_ok = match name {
            Some(n) => self.simple_name.as_deref() == Some(n),
            None => true,
        };
        let dn_ok = match distinguished_name {
            Some(d) => self
                .distinguished_name
                .as_deref()
                .map(|own| dn::normalize(own) == dn::normalize(d))
                .unwrap_or(false),
            None => true,
        };
        name_ok && dn_ok
    }

    fn display_name(&self) -> &str {
        self.simple_name
            .as_deref()
            .or(self.distinguished_name.as_deref())
            .unwrap_or("?")
    }
}

impl fmt::Display for DirectoryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.simple_name.as_deref().unwrap_or("-"),
            self.distinguished_name.as_deref().unwrap_or("-")
        )?;
        if let Some(origin) = &self.referral_origin {
            write!(f, " via {origin}")?;
        }
        Ok(())
    }
}
