//! LDAP identity resolution and search caching for a security realm.
//!
//! A [`realm::LdapRealm`] verifies passwords by binding as the user found
//! through a filter search, then walks the user's group memberships. User
//! and group searches go through [`cache::SearchCache`]s shared by every
//! attempt; directory connections belong to one attempt and are tracked by
//! a [`handler::ConnectionHandler`] that follows referrals.

pub mod cache;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod directory;
pub mod dn;
pub mod entry;
pub mod error;
pub mod filter;
pub mod groups;
pub mod handler;
pub mod ldif;
pub mod memory;
pub mod principal;
pub mod realm;
pub mod search;
pub mod tls;

pub use config::RealmConfig;
pub use error::RealmError;
pub use realm::{AuthStep, CacheFilter, CacheTarget, LdapRealm, RealmBuilder};
