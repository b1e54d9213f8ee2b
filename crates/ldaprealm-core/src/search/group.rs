use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::NameForm;
use crate::directory::{SearchRequest, SearchScope, DEFAULT_SEARCH_TIME_LIMIT};
use crate::dn;
use crate::entry::DirectoryEntry;
use crate::error::RealmError;
use crate::filter;
use crate::handler::ConnectionHandler;

use super::{dn_of, follow_referrals, requested_attributes, start_for, Searcher};

/// Groups list their members: search a group subtree for entries whose
/// member attribute names the principal.
#[derive(Debug, Clone)]
pub struct GroupToPrincipalSearcher {
    pub base_dn: String,
    pub recursive: bool,
    /// Which name of the principal the member attribute holds.
    pub search_by: NameForm,
    pub principal_attribute: String,
    pub group_dn_attribute: String,
    pub group_name_attribute: String,
    pub prefer_original_connection: bool,
    pub time_limit: Duration,
    pub max_referral_hops: usize,
}

impl GroupToPrincipalSearcher {
    pub fn new(base_dn: impl Into<String>) -> Self {
        Self {
            base_dn: base_dn.into(),
            recursive: false,
            search_by: NameForm::Distinguished,
            principal_attribute: "member".to_string(),
            group_dn_attribute: "dn".to_string(),
            group_name_attribute: "uid".to_string(),
            prefer_original_connection: true,
            time_limit: DEFAULT_SEARCH_TIME_LIMIT,
            max_referral_hops: 10,
        }
    }
}

#[async_trait]
impl Searcher<DirectoryEntry, Vec<DirectoryEntry>> for GroupToPrincipalSearcher {
    async fn search(
        &self,
        handler: &mut ConnectionHandler,
        principal: &DirectoryEntry,
    ) -> Result<Vec<DirectoryEntry>, RealmError> {
        let value = match self.search_by {
            NameForm::Simple => principal.simple_name(),
            NameForm::Distinguished => principal.distinguished_name(),
        };
        let Some(value) = value else {
            debug!("{} has no {:?} name to search groups by", principal, self.search_by);
            return Ok(Vec::new());
        };

        let Some(start) = start_for(handler, principal, self.prefer_original_connection).await?
        else {
            warn!("Cannot reach the directory {} came from", principal);
            return Ok(Vec::new());
        };

        let request = SearchRequest::new(
            self.base_dn.as_str(),
            SearchScope::for_recursive(self.recursive),
            filter::equality(&self.principal_attribute, value),
        )
        .attributes(requested_attributes([
            self.group_dn_attribute.as_str(),
            self.group_name_attribute.as_str(),
        ]))
        .time_limit(self.time_limit);

        let entries = match follow_referrals(handler, start, &request, self.max_referral_hops).await {
            Ok(Some((_, entries))) => entries,
            Ok(None) => return Ok(Vec::new()),
            Err(e) if e.is_not_found() => {
                debug!("Group base {} not found: {}", self.base_dn, e);
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let mut seen = HashSet::new();
        let mut groups = Vec::with_capacity(entries.len());
        for entry in entries {
            let group = DirectoryEntry::new(
                entry.first_value(&self.group_name_attribute).map(str::to_string),
                dn_of(&entry, &self.group_dn_attribute),
                entry.origin,
            );
            if seen.insert(group.clone()) {
                groups.push(group);
            }
        }
        debug!("{} is listed in {} groups", principal, groups.len());
        Ok(groups)
    }
}

/// Principals list their groups: read the group attribute off the
/// principal, then look up each named group's simple name.
#[derive(Debug, Clone)]
pub struct PrincipalToGroupSearcher {
    pub group_attribute: String,
    pub group_name_attribute: String,
    pub skip_missing_groups: bool,
    /// Take the simple name from the group DN's RDN when it has the right type.
    pub parse_group_name_from_dn: bool,
    pub prefer_original_connection: bool,
    pub time_limit: Duration,
    pub max_referral_hops: usize,
}

impl Default for PrincipalToGroupSearcher {
    fn default() -> Self {
        Self {
            group_attribute: "memberOf".to_string(),
            group_name_attribute: "uid".to_string(),
            skip_missing_groups: false,
            parse_group_name_from_dn: false,
            prefer_original_connection: true,
            time_limit: DEFAULT_SEARCH_TIME_LIMIT,
            max_referral_hops: 10,
        }
    }
}

#[async_trait]
impl Searcher<DirectoryEntry, Vec<DirectoryEntry>> for PrincipalToGroupSearcher {
    async fn search(
        &self,
        handler: &mut ConnectionHandler,
        principal: &DirectoryEntry,
    ) -> Result<Vec<DirectoryEntry>, RealmError> {
        let Some(principal_dn) = principal.distinguished_name() else {
            return Ok(Vec::new());
        };
        let Some(start) = start_for(handler, principal, self.prefer_original_connection).await?
        else {
            warn!("Cannot reach the directory {} came from", principal);
            return Ok(Vec::new());
        };

        let read = SearchRequest::read(principal_dn)
            .attributes([self.group_attribute.as_str()])
            .time_limit(self.time_limit);
        let (node, entries) =
            match follow_referrals(handler, start, &read, self.max_referral_hops).await {
                Ok(Some(found)) => found,
                Ok(None) => return Ok(Vec::new()),
                Err(e) if e.is_not_found() => {
                    debug!("{} not found while reading its groups", principal_dn);
                    return Ok(Vec::new());
                }
                Err(e) => return Err(e),
            };
        let group_dns: Vec<String> = entries
            .first()
            .map(|entry| entry.values(&self.group_attribute).to_vec())
            .unwrap_or_default();

        let mut groups = Vec::with_capacity(group_dns.len());
        for group_dn in group_dns {
            if self.parse_group_name_from_dn {
                if let Some(name) = dn::rdn_value(&group_dn, &self.group_name_attribute) {
                    let origin = handler.origin(node).cloned();
                    groups.push(DirectoryEntry::new(Some(name), Some(group_dn), origin));
                    continue;
                }
            }

            let read = SearchRequest::read(group_dn.as_str())
                .attributes([self.group_name_attribute.as_str()])
                .time_limit(self.time_limit);
            match follow_referrals(handler, node, &read, self.max_referral_hops).await {
                Ok(Some((_, found))) => match found.into_iter().next() {
                    Some(group) => groups.push(DirectoryEntry::new(
                        group.first_value(&self.group_name_attribute).map(str::to_string),
                        Some(group_dn),
                        group.origin,
                    )),
                    None => self.missing(&group_dn)?,
                },
                Ok(None) => warn!("Skipping group {} behind an unusable referral", group_dn),
                Err(e) if e.is_not_found() => self.missing(&group_dn)?,
                Err(e) => return Err(e),
            }
        }
        debug!("{} lists {} groups", principal, groups.len());
        Ok(groups)
    }
}

impl PrincipalToGroupSearcher {
    fn missing(&self, group_dn: &str) -> Result<(), RealmError> {
        if self.skip_missing_groups {
            warn!("Skipping missing group {}", group_dn);
            Ok(())
        } else {
            Err(RealmError::NotFound(format!("group '{group_dn}'")))
        }
    }
}
