//! Stateless search strategies.
//!
//! A [`Searcher`] performs the directory queries for one key and turns the
//! raw records into [`DirectoryEntry`] values. It neither caches nor owns
//! connections; both come from the caller.

pub mod group;
pub mod user;

use async_trait::async_trait;
use tracing::{debug, warn};
use url::Url;

use crate::directory::{SearchRequest, SearchStep};
use crate::entry::{DirectoryEntry, LdapEntry};
use crate::error::RealmError;
use crate::handler::{ConnectionHandler, HandlerId};

pub use group::{GroupToPrincipalSearcher, PrincipalToGroupSearcher};
pub use user::{FilterUserSearcher, ResolvedUser, UserFilter, UsernameIsDn};

/// Resolves a key to a result through the connections of one attempt.
#[async_trait]
pub trait Searcher<K, R>: Send + Sync
where
    K: Send + Sync,
    R: Send,
{
    async fn search(&self, handler: &mut ConnectionHandler, key: &K) -> Result<R, RealmError>;
}

/// Run `request` starting at node `start`, following referrals for at most
/// `max_hops` hops.
///
/// Returns the node that finally answered together with its entries, or
/// `None` when the referral chain could not be followed to an answer.
/// Continuation references in the answer are searched through the handler
/// too, within the same hop budget; a branch that cannot be followed is
/// skipped. Entries answered by a node reached through a referral carry
/// that referral as their origin.
pub async fn follow_referrals(
    handler: &mut ConnectionHandler,
    start: HandlerId,
    request: &SearchRequest,
    max_hops: usize,
) -> Result<Option<(HandlerId, Vec<LdapEntry>)>, RealmError> {
    let Some(answer) = resolve(handler, start, request.clone(), max_hops, 0).await? else {
        return Ok(None);
    };
    let node = answer.node;
    let mut entries = Vec::new();
    let mut pending = vec![answer];

    while let Some(answer) = pending.pop() {
        entries.extend(answer.entries);
        for reference in &answer.continuations {
            if answer.hops >= max_hops {
                warn!(
                    "Not following continuation {} after {} referral hops",
                    reference, answer.hops
                );
                continue;
            }
            let Some(id) = handler.find_for_referral(answer.node, reference).await? else {
                warn!("Skipping unusable continuation {}", reference);
                continue;
            };
            debug!("Following continuation {} for {}", reference, answer.request.base);
            let next = answer.request.continuation(reference);
            match resolve(handler, id, next, max_hops, answer.hops + 1).await {
                Ok(Some(found)) => pending.push(found),
                Ok(None) => {}
                Err(e) => warn!("Continuation {} failed: {}", reference, e),
            }
        }
    }
    Ok(Some((node, entries)))
}

/// One answered request, before its continuations are chased.
struct Answer {
    node: HandlerId,
    request: SearchRequest,
    entries: Vec<LdapEntry>,
    continuations: Vec<Url>,
    hops: usize,
}

async fn resolve(
    handler: &mut ConnectionHandler,
    start: HandlerId,
    mut request: SearchRequest,
    max_hops: usize,
    mut hops: usize,
) -> Result<Option<Answer>, RealmError> {
    let mut node = start;

    loop {
        let step = handler.connection(node).await?.search(&request).await?;
        let urls = match step {
            SearchStep::Entries {
                entries,
                continuations,
            } => {
                let origin = handler.origin(node).cloned();
                let entries = entries
                    .into_iter()
                    .map(|entry| match entry.origin {
                        Some(_) => entry,
                        None => entry.with_origin(origin.clone()),
                    })
                    .collect();
                return Ok(Some(Answer {
                    node,
                    request,
                    entries,
                    continuations,
                    hops,
                }));
            }
            SearchStep::Referral(urls) => urls,
        };

        if hops >= max_hops {
            warn!(
                "Giving up on {} after {} referral hops",
                request.base, hops
            );
            return Ok(None);
        }
        hops += 1;

        let mut next = None;
        for url in &urls {
            if let Some(id) = handler.find_for_referral(node, url).await? {
                next = Some((id, url));
                break;
            }
        }
        match next {
            Some((id, url)) => {
                debug!("Following referral for {} to {}", request.base, url);
                request = request.retarget(url);
                node = id;
            }
            None => {
                warn!("No usable referral among {:?} for {}", urls, request.base);
                return Ok(None);
            }
        }
    }
}

/// Where searches about `entry` should start: the directory it came from
/// when it was found through a referral and the original connection is not
/// preferred, the starting directory otherwise. `None` when that directory
/// cannot be reached.
pub(crate) async fn start_for(
    handler: &mut ConnectionHandler,
    entry: &DirectoryEntry,
    prefer_original_connection: bool,
) -> Result<Option<HandlerId>, RealmError> {
    match entry.referral_origin() {
        Some(origin) if !prefer_original_connection => {
            handler.find_for_referral(ConnectionHandler::ROOT, origin).await
        }
        _ => Ok(Some(ConnectionHandler::ROOT)),
    }
}

/// The DN of `entry` according to `attribute`; `dn` means the entry's own name.
pub(crate) fn dn_of(entry: &LdapEntry, attribute: &str) -> Option<String> {
    if attribute.eq_ignore_ascii_case("dn") {
        Some(entry.dn.clone())
    } else {
        entry.first_value(attribute).map(str::to_string)
    }
}

/// Attributes to request so that `wanted` can be read back; `dn` needs none.
pub(crate) fn requested_attributes<'a>(wanted: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let mut attrs: Vec<String> = Vec::new();
    for attr in wanted {
        if !attr.eq_ignore_ascii_case("dn") && !attrs.iter().any(|a| a.eq_ignore_ascii_case(attr)) {
            attrs.push(attr.to_string());
        }
    }
    if attrs.is_empty() {
        // RFC 4511 "no attributes"
        attrs.push("1.1".to_string());
    }
    attrs
}
