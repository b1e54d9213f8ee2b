use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use ldaprealm_core::memory::MemoryDirectory;
use ldaprealm_core::principal::Subject;
use ldaprealm_core::{LdapRealm, RealmConfig};

#[derive(Parser, Debug)]
#[command(
    name = "ldaprealm",
    version,
    about = "Authenticate users and resolve their groups against an LDAP realm"
)]
struct Cli {
    /// Path to config file (default: ~/.config/ldaprealm/realm.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serve the realm from an LDIF file instead of the configured server
    #[arg(long)]
    ldif: Option<PathBuf>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Verify a password and print the resulting subject
    Authenticate {
        username: String,
        /// Read the password from the first line of stdin instead of prompting
        #[arg(long)]
        password_stdin: bool,
    },
    /// Resolve a user's groups and roles without a password
    Groups { username: String },
    /// Validate the configuration and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    let path = cli.config.clone().unwrap_or_else(default_config_path);
    let config = load_config(&path)?;
    debug!("Loaded configuration from {}", path.display());

    let (username, password) = match &cli.command {
        Command::Check => {
            config.validate()?;
            return print_check(&config, cli.json);
        }
        Command::Authenticate {
            username,
            password_stdin,
        } => (username, Some(read_password(*password_stdin)?)),
        Command::Groups { username } => (username, None),
    };

    let mut builder = LdapRealm::builder(config.clone());
    if let Some(ldif) = &cli.ldif {
        let directory = MemoryDirectory::load(&config.connection.url, ldif)
            .with_context(|| format!("failed to load {}", ldif.display()))?;
        info!(
            "Serving {} entries from {} as {}",
            directory.len(),
            ldif.display(),
            config.connection.url
        );
        builder = builder.provider(Arc::new(directory));
    }
    let realm = builder.build()?;

    let outcome = match &password {
        Some(password) => realm.authenticate(username, password).await,
        None => realm.authorize(username).await,
    };
    realm.stop();

    match outcome {
        Ok(subject) => print_subject(&subject, cli.json),
        Err(e) => bail!("{e}"),
    }
}

fn init_logging(verbose: bool) -> Result<()> {
    let default = if verbose {
        "ldaprealm=debug,ldaprealm_core=debug"
    } else {
        "ldaprealm=info,ldaprealm_core=info"
    };
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default))?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();
    Ok(())
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("ldaprealm")
        .join("realm.toml")
}

/// The TOML file, overridden by `LDAPREALM__SECTION__KEY` variables.
fn load_config(path: &Path) -> Result<RealmConfig> {
    let settings = config::Config::builder()
        .add_source(config::File::from(path.to_path_buf()).required(true))
        .add_source(
            config::Environment::with_prefix("LDAPREALM")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .with_context(|| format!("failed to read {}", path.display()))?;
    let config: RealmConfig = settings
        .try_deserialize()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn read_password(from_stdin: bool) -> Result<Zeroizing<String>> {
    if from_stdin {
        let mut line = Zeroizing::new(String::new());
        std::io::stdin().lock().read_line(&mut line)?;
        let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
        return Ok(Zeroizing::new(trimmed));
    }
    let password = rpassword::read_password_from_tty(Some("Password: "))
        .context("failed to read password")?;
    Ok(Zeroizing::new(password))
}

fn print_subject(subject: &Subject, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(subject)?);
        return Ok(());
    }
    println!("realm: {}", subject.realm);
    if let Some(user) = subject.user() {
        println!("user:  {user}");
    }
    for group in subject.groups() {
        println!("group: {group}");
    }
    for role in subject.roles() {
        println!("role:  {role}");
    }
    Ok(())
}

fn print_check(config: &RealmConfig, json: bool) -> Result<()> {
    let authentication = config.authentication.is_some();
    let group_search = config
        .authorization
        .as_ref()
        .is_some_and(|a| a.group_search.is_some());
    if json {
        let summary = serde_json::json!({
            "realm": config.realm.name,
            "url": config.connection.url,
            "authentication": authentication,
            "group_search": group_search,
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        println!(
            "realm '{}' at {}: authentication {}, group search {}",
            config.realm.name,
            config.connection.url,
            if authentication { "on" } else { "off" },
            if group_search { "on" } else { "off" },
        );
    }
    Ok(())
}
