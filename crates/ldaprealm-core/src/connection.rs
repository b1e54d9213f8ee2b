use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::adapters::{Adapter, PagedResults};
use ldap3::{Ldap, LdapConnAsync, LdapConnSettings, LdapResult, SearchEntry, SearchOptions};
use rustls::ClientConfig;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;
use zeroize::Zeroizing;

use crate::config::ConnectionConfig;
use crate::credentials::CredentialProvider;
use crate::directory::{
    server_of, ConnectionProvider, DirectoryConnection, ReferralTarget, SearchRequest, SearchScope,
    SearchStep,
};
use crate::entry::LdapEntry;
use crate::error::RealmError;
use crate::tls;

const RC_SUCCESS: u32 = 0;
const RC_REFERRAL: u32 = 10;
const RC_NO_SUCH_OBJECT: u32 = 32;
const RC_INVALID_CREDENTIALS: u32 = 49;

/// TLS mode for LDAP connections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// LDAPS, then StartTLS, then plain LDAP.
    #[default]
    Auto,
    Ldaps,
    StartTls,
    None,
}

impl TlsMode {
    /// Human-readable label for display.
    pub fn label(&self) -> &'static str {
        match self {
            TlsMode::Auto => "Auto",
            TlsMode::Ldaps => "LDAPS",
            TlsMode::StartTls => "StartTLS",
            TlsMode::None => "None",
        }
    }
}

/// Settings shared by every connection a provider opens.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: Url,
    pub tls_mode: TlsMode,
    pub timeout: Duration,
    pub search_time_limit: Duration,
    pub page_size: u32,
    pub follow_referrals: bool,
    pub trusted_fingerprints: Vec<String>,
}

impl ConnectionSettings {
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, RealmError> {
        let url = Url::parse(&config.url)
            .map_err(|e| RealmError::Configuration(format!("connection url '{}': {e}", config.url)))?;
        Ok(Self {
            url,
            tls_mode: config.tls_mode,
            timeout: config.timeout(),
            search_time_limit: config.search_time_limit(),
            page_size: config.page_size,
            follow_referrals: config.referral_hops() > 0,
            trusted_fingerprints: config.trusted_fingerprints.clone(),
        })
    }

    fn host(&self) -> &str {
        self.url.host_str().unwrap_or("localhost")
    }

    fn port(&self) -> u16 {
        self.url.port().unwrap_or(match self.url.scheme() {
            "ldaps" => 636,
            _ => 389,
        })
    }
}

struct ProviderInner {
    settings: ConnectionSettings,
    service_account: Option<(String, Zeroizing<String>)>,
    tls: Option<Arc<ClientConfig>>,
}

/// Opens ldap3 connections to one directory server.
///
/// Cloning is cheap; providers created for referral targets share the
/// service account and TLS configuration of the provider they came from.
#[derive(Clone)]
pub struct LdapConnectionProvider {
    inner: Arc<ProviderInner>,
}

impl LdapConnectionProvider {
    pub fn new(
        settings: ConnectionSettings,
        service_account: Option<(String, Zeroizing<String>)>,
    ) -> Result<Self, RealmError> {
        let tls = match settings.tls_mode {
            TlsMode::None if settings.url.scheme() != "ldaps" => None,
            _ => Some(tls::build_client_config(&settings.trusted_fingerprints)?),
        };
        Ok(Self {
            inner: Arc::new(ProviderInner {
                settings,
                service_account,
                tls,
            }),
        })
    }

    /// Provider for the configured server, resolving the service account
    /// password with the configured credential method.
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, RealmError> {
        let settings = ConnectionSettings::from_config(config)?;
        let service_account = match &config.bind_dn {
            Some(dn) => {
                let password = CredentialProvider::resolve(
                    &config.credential_method,
                    config.credential.as_deref(),
                    dn,
                )?;
                Some((dn.clone(), password))
            }
            None => None,
        };
        Self::new(settings, service_account)
    }

    pub fn settings(&self) -> &ConnectionSettings {
        &self.inner.settings
    }

    fn for_server(&self, url: Url) -> Self {
        let settings = ConnectionSettings {
            url,
            ..self.inner.settings.clone()
        };
        Self {
            inner: Arc::new(ProviderInner {
                settings,
                service_account: self.inner.service_account.clone(),
                tls: self.inner.tls.clone(),
            }),
        }
    }

    async fn open(&self) -> Result<Ldap, RealmError> {
        let settings = &self.inner.settings;
        if settings.url.scheme() == "ldaps" {
            return self.connect_ldaps(settings.port()).await;
        }
        match settings.tls_mode {
            TlsMode::Auto => self.auto_connect().await,
            TlsMode::Ldaps => self.connect_ldaps(settings.port()).await,
            TlsMode::StartTls => self.connect_starttls().await,
            TlsMode::None => self.connect_plain().await,
        }
    }

    async fn auto_connect(&self) -> Result<Ldap, RealmError> {
        let settings = &self.inner.settings;
        let port = settings.port();
        let ldaps_port = if port == 389 { 636 } else { port };

        match self.connect_ldaps(ldaps_port).await {
            Ok(ldap) => {
                info!("Connected to {} via LDAPS on port {}", settings.host(), ldaps_port);
                return Ok(ldap);
            }
            Err(e) => warn!("LDAPS to {} failed ({}), trying StartTLS", settings.host(), e),
        }

        match self.connect_starttls().await {
            Ok(ldap) => {
                info!("Connected to {} via StartTLS on port {}", settings.host(), port);
                return Ok(ldap);
            }
            Err(e) => warn!("StartTLS to {} failed ({}), trying plain LDAP", settings.host(), e),
        }

        let ldap = self.connect_plain().await?;
        info!("Connected to {} via plain LDAP on port {}", settings.host(), port);
        Ok(ldap)
    }

    async fn connect_ldaps(&self, port: u16) -> Result<Ldap, RealmError> {
        let url = format!("ldaps://{}:{}", self.inner.settings.host(), port);
        self.dial(&url, false, "LDAPS").await
    }

    async fn connect_starttls(&self) -> Result<Ldap, RealmError> {
        let settings = &self.inner.settings;
        let url = format!("ldap://{}:{}", settings.host(), settings.port());
        self.dial(&url, true, "StartTLS").await
    }

    async fn connect_plain(&self) -> Result<Ldap, RealmError> {
        let settings = &self.inner.settings;
        let url = format!("ldap://{}:{}", settings.host(), settings.port());
        self.dial(&url, false, "plain LDAP").await
    }

    async fn dial(&self, url: &str, starttls: bool, label: &str) -> Result<Ldap, RealmError> {
        let mut conn_settings = LdapConnSettings::new()
            .set_conn_timeout(self.inner.settings.timeout)
            .set_starttls(starttls);
        if let Some(config) = &self.inner.tls {
            conn_settings = conn_settings.set_config(config.clone());
        }
        let (conn, ldap) = LdapConnAsync::with_settings(conn_settings, url)
            .await
            .map_err(|e| RealmError::ConnectionFailed(format!("{label}: {e}")))?;
        ldap3::drive!(conn);
        Ok(ldap)
    }

    async fn bound(&self, dn: &str, password: &str) -> Result<LdapDirectoryConnection, RealmError> {
        let mut ldap = self.open().await?;
        let result = ldap
            .simple_bind(dn, password)
            .await
            .map_err(|e| RealmError::ConnectionFailed(format!("bind: {e}")))?;
        match result.rc {
            RC_SUCCESS => {
                debug!("Bound to {} as {}", self.describe(), dn);
                Ok(LdapDirectoryConnection::new(ldap, self.clone()))
            }
            RC_INVALID_CREDENTIALS => {
                let _ = ldap.unbind().await;
                Err(RealmError::InvalidCredentials)
            }
            rc => {
                let _ = ldap.unbind().await;
                Err(RealmError::Directory(format!(
                    "bind as {dn} failed: rc={rc} {}",
                    result.text
                )))
            }
        }
    }
}

#[async_trait]
impl ConnectionProvider for LdapConnectionProvider {
    fn describe(&self) -> String {
        server_of(&self.inner.settings.url)
    }

    async fn connect(&self) -> Result<Box<dyn DirectoryConnection>, RealmError> {
        match &self.inner.service_account {
            Some((dn, password)) => Ok(Box::new(self.bound(dn, password).await?)),
            None => {
                let ldap = self.open().await?;
                Ok(Box::new(LdapDirectoryConnection::new(ldap, self.clone())))
            }
        }
    }

    async fn connect_as(
        &self,
        dn: &str,
        password: &str,
    ) -> Result<Box<dyn DirectoryConnection>, RealmError> {
        Ok(Box::new(self.bound(dn, password).await?))
    }

    async fn find_for_referral(&self, referral: &Url) -> Result<ReferralTarget, RealmError> {
        if server_of(referral) == self.describe() {
            return Ok(ReferralTarget::Same);
        }
        if !self.inner.settings.follow_referrals {
            return Ok(ReferralTarget::Unresolvable);
        }
        if !matches!(referral.scheme(), "ldap" | "ldaps") || referral.host_str().is_none() {
            return Ok(ReferralTarget::Unresolvable);
        }
        let server = Url::parse(&server_of(referral))
            .map_err(|e| RealmError::ReferralUnresolvable(format!("{referral}: {e}")))?;
        Ok(ReferralTarget::Other(Arc::new(self.for_server(server))))
    }
}

/// A bound ldap3 connection.
pub struct LdapDirectoryConnection {
    ldap: Ldap,
    provider: LdapConnectionProvider,
    open: bool,
}

impl LdapDirectoryConnection {
    fn new(ldap: Ldap, provider: LdapConnectionProvider) -> Self {
        Self {
            ldap,
            provider,
            open: true,
        }
    }

    fn time_limit(&self, request: &SearchRequest) -> (i32, Duration) {
        let limit = request.time_limit.min(self.provider.settings().search_time_limit);
        let secs = i32::try_from(limit.as_secs()).unwrap_or(i32::MAX);
        // Client-side timeout gets a little slack over the server limit.
        (secs, limit + Duration::from_secs(1))
    }

    /// One search round-trip, all pages included.
    async fn round_trip(&mut self, request: &SearchRequest) -> Result<RoundTrip, RealmError> {
        let page_size = self.provider.settings().page_size;
        let (server_limit, client_timeout) = self.time_limit(request);
        let attrs: Vec<&str> = request.attributes.iter().map(String::as_str).collect();

        let mut adapters: Vec<Box<dyn Adapter<_, _>>> = Vec::new();
        if page_size > 0 && request.scope != SearchScope::Base {
            let size = i32::try_from(page_size).unwrap_or(i32::MAX);
            adapters.push(Box::new(PagedResults::new(size)));
        }

        let mut stream = self
            .ldap
            .with_search_options(SearchOptions::new().timelimit(server_limit))
            .with_timeout(client_timeout)
            .streaming_search_with(
                adapters,
                &request.base,
                request.scope.into(),
                &request.filter,
                attrs,
            )
            .await?;

        let mut trip = RoundTrip::default();
        while let Some(entry) = stream.next().await? {
            if entry.is_ref() {
                trip.continuations.extend(ldap3::parse_refs(entry.0));
            } else if !entry.is_intermediate() {
                trip.entries
                    .push(LdapEntry::from_search_entry(SearchEntry::construct(entry)));
            }
        }
        trip.referral = completion(&request.base, stream.finish().await)?;
        Ok(trip)
    }
}

/// Map the final result of a search: referral URLs for a redirect, empty
/// for success, an error otherwise.
fn completion(base: &str, result: LdapResult) -> Result<Vec<String>, RealmError> {
    match result.rc {
        RC_SUCCESS => Ok(Vec::new()),
        RC_REFERRAL if !result.refs.is_empty() => Ok(result.refs),
        RC_REFERRAL => Err(RealmError::ReferralUnresolvable(format!(
            "{base}: referral without URLs"
        ))),
        RC_NO_SUCH_OBJECT => Err(RealmError::NoSuchEntry(base.to_string())),
        rc => Err(RealmError::Directory(format!(
            "search below {base} failed: rc={rc} {}",
            result.text
        ))),
    }
}

#[derive(Default)]
struct RoundTrip {
    entries: Vec<LdapEntry>,
    referral: Vec<String>,
    continuations: Vec<String>,
}

#[async_trait]
impl DirectoryConnection for LdapDirectoryConnection {
    async fn search(&mut self, request: &SearchRequest) -> Result<SearchStep, RealmError> {
        debug!(
            "Search {} base={} filter={}",
            self.provider.describe(),
            request.base,
            request.filter
        );
        let trip = self.round_trip(request).await?;

        if !trip.referral.is_empty() {
            let urls = parse_urls(&trip.referral);
            if urls.is_empty() {
                return Err(RealmError::ReferralUnresolvable(format!(
                    "{}: {:?}",
                    request.base, trip.referral
                )));
            }
            return Ok(SearchStep::Referral(urls));
        }

        let continuations = parse_urls(&trip.continuations);
        if !continuations.is_empty() {
            debug!(
                "Search below {} continues at {:?}",
                request.base, continuations
            );
        }
        Ok(SearchStep::Entries {
            entries: trip.entries,
            continuations,
        })
    }

    async fn close(&mut self) -> Result<(), RealmError> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.ldap.unbind().await.map_err(RealmError::from)
    }
}

fn parse_urls(raw: &[String]) -> Vec<Url> {
    raw.iter()
        .filter_map(|r| match Url::parse(r) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!("Ignoring malformed referral {}: {}", r, e);
                None
            }
        })
        .collect()
}
