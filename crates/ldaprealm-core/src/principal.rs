use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// A principal attached to an authenticated subject.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(tag = "kind", content = "name", rename_all = "lowercase")]
pub enum RealmPrincipal {
    User(RealmUser),
    Group(RealmGroup),
    Role(RealmRole),
}

macro_rules! name_holder {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(name: impl Into<String>) -> Self {
                Self(name.into())
            }

            pub fn name(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }
    };
}

name_holder!(
    /// The authenticated user, named as supplied (or as loaded from the directory).
    RealmUser
);
name_holder!(
    /// A group the user belongs to, directly or through an iterative walk.
    RealmGroup
);
name_holder!(
    /// A role granted to the user; one per group when groups map to roles.
    RealmRole
);

/// The outcome of a successful authentication: who the user is and what
/// they belong to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Subject {
    pub realm: String,
    pub principals: BTreeSet<RealmPrincipal>,
}

impl Subject {
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            principals: BTreeSet::new(),
        }
    }

    pub fn add(&mut self, principal: RealmPrincipal) {
        self.principals.insert(principal);
    }

    pub fn user(&self) -> Option<&RealmUser> {
        self.principals.iter().find_map(|p| match p {
            RealmPrincipal::User(u) => Some(u),
            _ => None,
        })
    }

    pub fn groups(&self) -> impl Iterator<Item = &RealmGroup> {
        self.principals.iter().filter_map(|p| match p {
            RealmPrincipal::Group(g) => Some(g),
            _ => None,
        })
    }

    pub fn roles(&self) -> impl Iterator<Item = &RealmRole> {
        self.principals.iter().filter_map(|p| match p {
            RealmPrincipal::Role(r) => Some(r),
            _ => None,
        })
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles().any(|r| r.name() == role)
    }
}
