use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};
use url::Url;

use crate::directory::{ConnectionProvider, DirectoryConnection, ReferralTarget};
use crate::error::RealmError;

/// Identifies one directory reachable within an authentication attempt:
/// the starting directory, or one reached through a referral.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

struct Node {
    provider: Arc<dyn ConnectionProvider>,
    connection: Option<Box<dyn DirectoryConnection>>,
    origin: Option<Url>,
}

/// Connections used by a single authentication attempt.
///
/// The handler owns one node per directory it has talked to. Nodes reached
/// through referrals are registered once per referral URL and shared for the
/// rest of the attempt. [`close`](Self::close) closes every opened connection
/// exactly once; dropping an unclosed handler drops them.
pub struct ConnectionHandler {
    nodes: Vec<Node>,
    referrals: HashMap<Url, HandlerId>,
}

impl ConnectionHandler {
    pub const ROOT: HandlerId = HandlerId(0);

    pub fn new(provider: Arc<dyn ConnectionProvider>) -> Self {
        Self {
            nodes: vec![Node {
                provider,
                connection: None,
                origin: None,
            }],
            referrals: HashMap::new(),
        }
    }

    /// The connection for `id`, opened on first use.
    pub async fn connection(
        &mut self,
        id: HandlerId,
    ) -> Result<&mut (dyn DirectoryConnection + 'static), RealmError> {
        let node = self.node_mut(id)?;
        if node.connection.is_none() {
            let provider = node.provider.clone();
            debug!("Opening directory connection to {}", provider.describe());
            node.connection = Some(provider.connect().await?);
        }
        node.connection
            .as_deref_mut()
            .ok_or_else(|| RealmError::ConnectionFailed("connection unavailable".to_string()))
    }

    pub fn provider(&self, id: HandlerId) -> Result<Arc<dyn ConnectionProvider>, RealmError> {
        self.nodes
            .get(id.0)
            .map(|n| n.provider.clone())
            .ok_or_else(|| unknown(id))
    }

    /// The referral URL through which `id` was reached, `None` for the root.
    pub fn origin(&self, id: HandlerId) -> Option<&Url> {
        self.nodes.get(id.0).and_then(|n| n.origin.as_ref())
    }

    /// Resolve a referral seen while talking to `from`.
    ///
    /// Returns `from` itself when the referral points back at the same
    /// directory, a (possibly cached) node for a different directory, or
    /// `None` when the referral cannot be followed.
    pub async fn find_for_referral(
        &mut self,
        from: HandlerId,
        referral: &Url,
    ) -> Result<Option<HandlerId>, RealmError> {
        if let Some(id) = self.referrals.get(referral) {
            return Ok(Some(*id));
        }

        let provider = self.provider(from)?;
        match provider.find_for_referral(referral).await? {
            ReferralTarget::Same => Ok(Some(from)),
            ReferralTarget::Other(target) => {
                let id = HandlerId(self.nodes.len());
                debug!(
                    "Referral {} from {} resolved to {}",
                    referral,
                    provider.describe(),
                    target.describe()
                );
                self.nodes.push(Node {
                    provider: target,
                    connection: None,
                    origin: Some(referral.clone()),
                });
                self.referrals.insert(referral.clone(), id);
                Ok(Some(id))
            }
            ReferralTarget::Unresolvable => {
                warn!("Referral {} cannot be followed", referral);
                Ok(None)
            }
        }
    }

    /// Number of connections currently open.
    pub fn open_connections(&self) -> usize {
        self.nodes.iter().filter(|n| n.connection.is_some()).count()
    }

    /// Close every open connection. Close failures are logged and ignored.
    pub async fn close(&mut self) {
        for node in &mut self.nodes {
            if let Some(mut connection) = node.connection.take() {
                if let Err(e) = connection.close().await {
                    warn!(
                        "Ignoring close failure for {}: {}",
                        node.provider.describe(),
                        e
                    );
                }
            }
        }
    }

    fn node_mut(&mut self, id: HandlerId) -> Result<&mut Node, RealmError> {
        self.nodes.get_mut(id.0).ok_or_else(|| unknown(id))
    }
}

fn unknown(id: HandlerId) -> RealmError {
    RealmError::InvalidRequest(format!("unknown connection handle {}", id.0))
}
