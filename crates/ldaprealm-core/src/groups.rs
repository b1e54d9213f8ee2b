use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::cache::SearchCache;
use crate::config::NameForm;
use crate::entry::DirectoryEntry;
use crate::error::RealmError;
use crate::handler::ConnectionHandler;
use crate::principal::RealmGroup;

/// Cache of group searches keyed by the principal whose groups were looked up.
pub type GroupCache = SearchCache<DirectoryEntry, Vec<DirectoryEntry>>;

/// Walks group memberships starting from a resolved user.
///
/// With `iterative` set, the groups found are searched in turn for the
/// groups they belong to. A visited set keeps cyclic group graphs finite
/// and reports each group once however many paths lead to it.
pub struct GroupResolver {
    cache: Arc<GroupCache>,
    iterative: bool,
    group_name: NameForm,
}

impl GroupResolver {
    pub fn new(cache: Arc<GroupCache>, iterative: bool, group_name: NameForm) -> Self {
        Self {
            cache,
            iterative,
            group_name,
        }
    }

    pub fn cache(&self) -> &Arc<GroupCache> {
        &self.cache
    }

    pub async fn resolve_groups(
        &self,
        user: &DirectoryEntry,
        handler: &mut ConnectionHandler,
    ) -> Result<BTreeSet<RealmGroup>, RealmError> {
        let mut visited: HashSet<DirectoryEntry> = HashSet::new();
        let mut groups = BTreeSet::new();
        let mut stack: Vec<Vec<DirectoryEntry>> = vec![vec![user.clone()]];

        while let Some(frame) = stack.pop() {
            for principal in frame {
                let found = self.cache.search(handler, &principal.detached()).await?;
                let mut next = Vec::new();
                for group in found.iter() {
                    if !visited.insert(group.detached()) {
                        trace!("Group {} already visited", group);
                        continue;
                    }
                    let group = group.reached_from(&principal);
                    trace!("Found group along {}", group.chain().join(" <- "));

                    match self.name_of(&group) {
                        Some(name) => {
                            groups.insert(RealmGroup::new(name));
                        }
                        None => debug!("Group {} has no {:?} name", group, self.group_name),
                    }
                    if self.iterative {
                        next.push(group);
                    }
                }
                if !next.is_empty() {
                    stack.push(next);
                }
            }
        }

        debug!("Resolved {} groups for {}", groups.len(), user);
        Ok(groups)
    }

    fn name_of<'a>(&self, group: &'a DirectoryEntry) -> Option<&'a str> {
        match self.group_name {
            NameForm::Simple => group.simple_name(),
            NameForm::Distinguished => group.distinguished_name(),
        }
    }
}
