use std::path::PathBuf;
use std::sync::Arc;

use ldaprealm_core::config::RealmConfig;
use ldaprealm_core::handler::ConnectionHandler;
use ldaprealm_core::memory::MemoryDirectory;
use ldaprealm_core::search::{FilterUserSearcher, Searcher, UserFilter};
use ldaprealm_core::{CacheFilter, CacheTarget, LdapRealm, RealmError};

fn fixture(name: &str) -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/../../tests/fixtures")).join(name)
}

/// The example directory with the partners directory reachable by referral.
fn directories() -> (MemoryDirectory, MemoryDirectory) {
    let primary = MemoryDirectory::load("ldap://ldap.example:389", &fixture("example.ldif")).unwrap();
    let partners =
        MemoryDirectory::load("ldap://partners.example:389", &fixture("partners.ldif")).unwrap();
    primary.add_peer(&partners);
    (primary, partners)
}

const PRINCIPAL_TO_GROUP: &str = r#"
[realm]
name = "ManagementRealm"

[connection]
url = "ldap://ldap.example:389"

[authentication]
base_dn = "ou=People,dc=example"
recursive = true
username_attribute = "uid"

[authentication.cache]
type = "by-access-time"
eviction_time_secs = 300
max_cache_size = 10

[authorization.group_search]
type = "principal-to-group"
group_name_attribute = "cn"
iterative = true

[authorization.group_search.cache]
type = "by-search-time"
"#;

const GROUP_TO_PRINCIPAL: &str = r#"
[realm]
name = "ManagementRealm"

[connection]
url = "ldap://ldap.example:389"

[authentication]
base_dn = "ou=People,dc=example"
recursive = true
username_attribute = "uid"

[authorization.group_search]
type = "group-to-principal"
base_dn = "ou=Groups,dc=example"
group_name_attribute = "cn"
iterative = true
"#;

fn realm(config: &str, directory: &MemoryDirectory) -> LdapRealm {
    let config = RealmConfig::from_toml(config).unwrap();
    LdapRealm::builder(config)
        .provider(Arc::new(directory.clone()))
        .build()
        .unwrap()
}

fn group_names(subject: &ldaprealm_core::principal::Subject) -> Vec<&str> {
    subject.groups().map(|g| g.name()).collect()
}

#[tokio::test]
async fn test_username_filter_resolves_user() {
    let (primary, _) = directories();
    let mut handler = ConnectionHandler::new(Arc::new(primary));
    let searcher = FilterUserSearcher::new(
        "ou=People,dc=example",
        UserFilter::Attribute("uid".to_string()),
    );

    let alice = searcher
        .search(&mut handler, &"alice".to_string())
        .await
        .unwrap();
    assert_eq!(alice.entry().simple_name(), Some("alice"));
    assert_eq!(
        alice.entry().distinguished_name(),
        Some("uid=alice,ou=People,dc=example")
    );

    let missing = searcher
        .search(&mut handler, &"missing".to_string())
        .await
        .unwrap_err();
    assert!(matches!(missing, RealmError::NotFound(_)));
    handler.close().await;
}

#[tokio::test]
async fn test_principal_to_group_walk() {
    let (primary, _) = directories();
    let realm = realm(PRINCIPAL_TO_GROUP, &primary);

    let subject = realm.authenticate("alice", "wonderland").await.unwrap();
    assert_eq!(group_names(&subject), vec!["Admins", "Everyone", "Staff"]);
    assert!(subject.has_role("Everyone"));

    // A contractor deeper in the tree, found by the recursive search.
    let subject = realm.authenticate("carol", "contract").await.unwrap();
    assert_eq!(group_names(&subject), vec!["Developers", "Everyone", "Staff"]);
}

#[tokio::test]
async fn test_group_to_principal_walk() {
    let (primary, _) = directories();
    let realm = realm(GROUP_TO_PRINCIPAL, &primary);

    let subject = realm.authenticate("alice", "wonderland").await.unwrap();
    assert_eq!(group_names(&subject), vec!["Admins", "Everyone", "Staff"]);
}

#[tokio::test]
async fn test_group_behind_referral() {
    let (primary, partners) = directories();
    let realm = realm(PRINCIPAL_TO_GROUP, &primary);

    let subject = realm.authenticate("bob", "builder").await.unwrap();
    assert_eq!(
        group_names(&subject),
        vec!["Developers", "Everyone", "Partners", "Staff"]
    );
    assert!(partners
        .search_log()
        .iter()
        .any(|r| r.base == "cn=Partners,ou=Groups,dc=partners"));
}

#[tokio::test]
async fn test_user_behind_referral_binds_remotely() {
    let (primary, partners) = directories();
    let config = PRINCIPAL_TO_GROUP
        .replace(
            "base_dn = \"ou=People,dc=example\"\nrecursive = true",
            "base_dn = \"ou=Remote,ou=People,dc=example\"",
        )
        .replace("iterative = true", "iterative = true\nprefer_original_connection = false");
    let realm = realm(&config, &primary);

    let subject = realm.authenticate("erin", "faraway").await.unwrap();
    assert_eq!(group_names(&subject), vec!["Partners"]);
    assert_eq!(partners.stats().binds, 1);
    assert_eq!(primary.stats().binds, 0);

    // The membership read went straight to the directory the user came from.
    assert!(!primary
        .search_log()
        .iter()
        .any(|r| r.base == "uid=erin,ou=Remote,ou=People,dc=example"));

    assert_eq!(
        realm.verify("erin", "wrong").await,
        Err(RealmError::AuthenticationFailed)
    );
}

#[tokio::test]
async fn test_recursive_search_follows_continuation_to_remote_user() {
    let (primary, partners) = directories();
    let realm = realm(PRINCIPAL_TO_GROUP, &primary);

    let subject = realm.authenticate("erin", "faraway").await.unwrap();
    assert_eq!(subject.user().map(|u| u.to_string()).as_deref(), Some("erin"));
    assert_eq!(group_names(&subject), vec!["Partners"]);

    // Found below the ou=Remote continuation and bound where she lives.
    assert!(partners
        .search_log()
        .iter()
        .any(|r| r.base == "ou=Remote,ou=People,dc=example" && r.filter == "(uid=erin)"));
    assert_eq!(partners.stats().binds, 1);
    assert_eq!(primary.stats().binds, 0);

    assert_eq!(
        primary.stats().connections_opened,
        primary.stats().connections_closed
    );
    assert_eq!(
        partners.stats().connections_opened,
        partners.stats().connections_closed
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_logins_search_once() {
    let (primary, _) = directories();
    let realm = Arc::new(realm(PRINCIPAL_TO_GROUP, &primary));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let realm = realm.clone();
            tokio::spawn(async move { realm.authorize("alice").await })
        })
        .collect();
    for task in tasks {
        let subject = task.await.unwrap().unwrap();
        assert!(subject.has_role("Admins"));
    }

    let user_searches = primary
        .search_log()
        .iter()
        .filter(|r| r.filter == "(uid=alice)")
        .count();
    assert_eq!(user_searches, 1);
    assert_eq!(realm.cache_size(CacheTarget::Authentication).unwrap(), 1);
}

#[tokio::test]
async fn test_flush_forces_new_search() {
    let (primary, _) = directories();
    let realm = realm(PRINCIPAL_TO_GROUP, &primary);

    realm.authorize("alice").await.unwrap();
    let before = primary.stats().searches;
    realm.authorize("alice").await.unwrap();
    assert_eq!(primary.stats().searches, before);

    assert_eq!(
        realm
            .flush_cache(
                CacheTarget::Authentication,
                &CacheFilter::by_dn("uid=alice,ou=People,dc=example")
            )
            .unwrap(),
        1
    );
    realm.authorize("alice").await.unwrap();
    assert_eq!(primary.stats().searches, before + 1);
}

#[tokio::test]
async fn test_offline_directory_fails_opaquely() {
    let (primary, _) = directories();
    let realm = realm(PRINCIPAL_TO_GROUP, &primary);
    primary.set_offline(true);
    assert_eq!(
        realm.verify("alice", "wonderland").await,
        Err(RealmError::AuthenticationFailed)
    );
    primary.set_offline(false);
    // The failure was not remembered.
    realm.verify("alice", "wonderland").await.unwrap();
}
