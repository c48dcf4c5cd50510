//! mcpreg - MCP registry client CLI

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use thiserror::Error;
use tokio::io::AsyncReadExt;

use mcpreg::config::ConfigStoreError;
use mcpreg::crypto::Cipher;
use mcpreg::logging::init_logging;
use mcpreg::registries::normalize_url;
use mcpreg::settings::SettingsError;
use mcpreg::spawn::PackageSpawner;
use mcpreg::storage::StorageError;
use mcpreg::{
    ConfigStore, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionService, DiscoveryClient,
    DiscoveryError, EncryptedFileStorage, PackageConfig, Paths, Reconciler, Registry, RegistrationHandle,
    RegistryCatalog, RegistryError, RemoteConfig, SecretRedactor, ServerDetail, ServerLookup,
    SetupError, Settings, TransportFactory, Variant,
};

#[derive(Parser)]
#[command(name = "mcpreg")]
#[command(about = "MCP registry client - discover, configure, and connect MCP servers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug output
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage registries
    Registries {
        #[command(subcommand)]
        action: RegistriesAction,
    },

    /// List servers from one registry, or from every known registry
    Browse {
        /// Registry URL (omit to query all registries)
        url: Option<String>,

        /// Start listing at this cursor (requires URL)
        #[arg(long, requires = "url")]
        cursor: Option<String>,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Connect to a server and save the configuration
    Setup {
        #[command(subcommand)]
        variant: SetupVariant,
    },

    /// Manage saved configurations
    Configs {
        #[command(subcommand)]
        action: ConfigsAction,
    },

    /// Reconnect every saved configuration and keep running until Ctrl-C
    Run,

    /// Mask stored secrets in text read from a file or stdin
    Redact {
        /// Input file (default: stdin)
        file: Option<PathBuf>,

        /// Field holding a serialized JSON document to redact (key or /json/pointer)
        #[arg(long)]
        embedded_field: Option<String>,
    },

    /// Show resolved paths (for debugging)
    Paths,
}

#[derive(Subcommand)]
enum RegistriesAction {
    /// List registered and suggested registries
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Add a registry
    Add {
        /// Base URL serving /v0/servers
        url: String,

        /// Display name
        #[arg(long, default_value = "")]
        name: String,
    },

    /// Remove a registry
    Remove {
        url: String,
    },
}

#[derive(Subcommand)]
enum SetupVariant {
    /// Connect to one of the server's remotes
    Remote {
        /// Server ID
        server_id: String,

        /// Remote index
        #[arg(long, default_value_t = 0)]
        remote: usize,

        /// Header value, NAME=VALUE (repeatable)
        #[arg(long = "header", value_parser = parse_pair)]
        headers: Vec<(String, String)>,
    },

    /// Spawn one of the server's packages
    Package {
        /// Server ID
        server_id: String,

        /// Package index
        #[arg(long, default_value_t = 0)]
        package: usize,

        /// Runtime argument value, INDEX=VALUE (repeatable)
        #[arg(long = "runtime-arg", value_parser = parse_index_pair)]
        runtime_args: Vec<(usize, String)>,

        /// Package argument value, INDEX=VALUE (repeatable)
        #[arg(long = "arg", value_parser = parse_index_pair)]
        package_args: Vec<(usize, String)>,

        /// Environment variable, NAME=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_pair)]
        env: Vec<(String, String)>,
    },
}

#[derive(Subcommand)]
enum ConfigsAction {
    /// List saved configurations
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a saved configuration
    Remove {
        /// Server ID
        server_id: String,

        /// remote:<n> or package:<n>
        variant: Variant,
    },
}

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Store(#[from] ConfigStoreError),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Setup(#[from] SetupError),
    #[error("Failed to read {what}: {source}")]
    Input { what: String, source: std::io::Error },
    #[error("Failed to serialize output: {0}")]
    Output(#[from] serde_json::Error),
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    if name.is_empty() {
        return Err(format!("empty name in '{}'", s));
    }
    Ok((name.to_string(), value.to_string()))
}

fn parse_index_pair(s: &str) -> Result<(usize, String), String> {
    let (index, value) = parse_pair(s)?;
    let index = index
        .parse()
        .map_err(|_| format!("expected INDEX=VALUE, got '{}'", s))?;
    Ok((index, value))
}

/// Everything a command may need, wired from paths and settings.
struct App {
    paths: Paths,
    settings: Settings,
    catalog: RegistryCatalog,
    storage: Arc<EncryptedFileStorage>,
    store: Arc<ConfigStore>,
    client: Arc<DiscoveryClient>,
    factory: Arc<TransportFactory>,
    connections: ConnectionManager,
    _suggestions: Vec<RegistrationHandle>,
}

impl App {
    async fn open(paths: Paths) -> Result<Self, CliError> {
        let settings = Settings::load(&paths.settings_path()).await?;
        let catalog = RegistryCatalog::load(paths.registries_path()).await;

        let mut suggestions = Vec::new();
        for registry in &settings.suggested_registries {
            match catalog.suggest(registry.clone()) {
                Ok(handle) => suggestions.push(handle),
                Err(e) => tracing::warn!(registry = %registry.server_url, error = %e, "ignoring suggested registry"),
            }
        }

        let storage = Arc::new(EncryptedFileStorage::open(paths.secrets_path(), Cipher::machine()).await?);
        let store = Arc::new(ConfigStore::new(storage.clone()));
        let client = Arc::new(DiscoveryClient::new(&settings)?);
        let factory = Arc::new(TransportFactory::new(
            PackageSpawner::from_settings(&settings),
            settings.connect_timeout(),
        ));

        Ok(Self {
            paths,
            settings,
            catalog,
            storage,
            store,
            client,
            factory,
            connections: ConnectionManager::new(),
            _suggestions: suggestions,
        })
    }

    fn service(&self) -> ConnectionService {
        ConnectionService::new(
            self.catalog.clone(),
            self.client.clone(),
            self.factory.clone(),
            self.store.clone(),
            self.connections.clone(),
        )
    }

    fn reconciler(&self) -> Reconciler {
        Reconciler::new(
            self.store.clone(),
            self.client.clone(),
            self.factory.clone(),
            self.connections.clone(),
        )
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.debug);

    if let Err(e) = run(cli.command).await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(command: Commands) -> Result<(), CliError> {
    let paths = Paths::resolve();
    match command {
        // Works even when settings are broken.
        Commands::Paths => {
            print_paths(&paths);
            Ok(())
        }
        command => {
            let app = App::open(paths).await?;
            dispatch(&app, command).await
        }
    }
}

async fn dispatch(app: &App, command: Commands) -> Result<(), CliError> {
    match command {
        Commands::Paths => {
            print_paths(&app.paths);
            Ok(())
        }
        Commands::Registries { action } => registries(app, action).await,
        Commands::Browse { url, cursor, json } => browse(app, url, cursor, json).await,
        Commands::Setup { variant } => setup(app, variant).await,
        Commands::Configs { action } => configs(app, action).await,
        Commands::Run => run_forever(app).await,
        Commands::Redact { file, embedded_field } => redact(app, file, embedded_field).await,
    }
}

fn print_paths(paths: &Paths) {
    println!("Config dir:  {}", paths.config_dir.display());
    println!("Data dir:    {}", paths.data_dir.display());
    for (label, path) in [
        ("Registries:", paths.registries_path()),
        ("Settings:  ", paths.settings_path()),
        ("Secrets:   ", paths.secrets_path()),
    ] {
        println!("{} {} (exists: {})", label, path.display(), path.exists());
    }
}

async fn registries(app: &App, action: RegistriesAction) -> Result<(), CliError> {
    match action {
        RegistriesAction::List { json } => {
            let mut all = app.catalog.list();
            all.extend(app.catalog.list_suggested());
            if json {
                println!("{}", serde_json::to_string_pretty(&all)?);
                return Ok(());
            }
            if all.is_empty() {
                println!("No registries configured. Add one with: mcpreg registries add <url>");
                return Ok(());
            }
            println!("{:<10} {:<24} URL", "KIND", "NAME");
            println!("{}", "-".repeat(80));
            for registry in all {
                let kind = if registry.suggested { "suggested" } else { "added" };
                println!("{:<10} {:<24} {}", kind, registry.name, registry.server_url);
            }
        }
        RegistriesAction::Add { url, name } => {
            // The registration outlives this process through the registry file.
            let _handle = app.catalog.create(Registry::new(&url, name)).await?;
            println!("Added {}", url.trim());
        }
        RegistriesAction::Remove { url } => {
            app.catalog.unregister(&url).await?;
            println!("Removed {}", url);
        }
    }
    Ok(())
}

async fn browse(app: &App, url: Option<String>, cursor: Option<String>, json: bool) -> Result<(), CliError> {
    let (servers, errors) = match url {
        Some(url) => {
            let servers = app.client.list_details(normalize_url(&url), cursor.as_deref()).await?;
            (servers, Vec::new())
        }
        None => app.client.list_all_servers(&app.catalog.discovery_urls()).await,
    };

    for e in &errors {
        eprintln!("Warning: {}", e);
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&servers)?);
    } else if servers.is_empty() {
        println!("No servers found in registries.");
    } else {
        print_browse_table(&servers);
    }
    Ok(())
}

async fn setup(app: &App, variant: SetupVariant) -> Result<(), CliError> {
    let config = match variant {
        SetupVariant::Remote {
            server_id,
            remote,
            headers,
        } => ConnectionConfig::Remote(RemoteConfig {
            server_id,
            remote_id: remote,
            headers: headers.into_iter().collect(),
        }),
        SetupVariant::Package {
            server_id,
            package,
            runtime_args,
            package_args,
            env,
        } => ConnectionConfig::Package(PackageConfig {
            server_id,
            package_id: package,
            runtime_arguments: runtime_args.into_iter().collect(),
            package_arguments: package_args.into_iter().collect(),
            environment_variables: env.into_iter().collect::<BTreeMap<_, _>>(),
        }),
    };

    let service = app.service();
    let config_id = service.setup(config).await?;
    println!("Configured {}", config_id);
    println!("Start it with: mcpreg run");
    app.connections.stop_all().await;
    Ok(())
}

async fn configs(app: &App, action: ConfigsAction) -> Result<(), CliError> {
    let service = app.service();
    match action {
        ConfigsAction::List { json } => {
            let configs = app.store.list().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&service.statuses().await?)?);
                return Ok(());
            }
            if configs.is_empty() {
                println!("No saved configurations.");
                return Ok(());
            }
            const INDENT: &str = "        ";
            for config in &configs {
                println!("{}", config.id());
                println!("{}Server:  {}", INDENT, config.server_id());
                println!("{}Variant: {}", INDENT, config.variant());
                let names: Vec<&str> = match config {
                    ConnectionConfig::Remote(c) => c.headers.keys().map(String::as_str).collect(),
                    ConnectionConfig::Package(c) => c.environment_variables.keys().map(String::as_str).collect(),
                };
                if !names.is_empty() {
                    println!("{}Secrets: {}", INDENT, names.join(", "));
                }
                println!();
            }
        }
        ConfigsAction::Remove { server_id, variant } => {
            service.remove(&server_id, variant).await?;
            println!("Removed {}", mcpreg::config::config_id(&server_id, variant));
        }
    }
    Ok(())
}

async fn run_forever(app: &App) -> Result<(), CliError> {
    let reconciler = app.reconciler();
    let mut events = app.connections.subscribe();
    let events_task = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                ConnectionEvent::Started { config_id, .. } => println!("started  {}", config_id),
                ConnectionEvent::Stopped { config_id, reason, .. } => println!("stopped  {} ({})", config_id, reason),
            }
        }
    });

    if app.settings.reconcile_on_startup {
        let report = reconciler.run(&app.catalog).await;
        for (config_id, error) in &report.failed {
            eprintln!("Warning: {}: {}", config_id, error);
        }
        for config_id in &report.stale {
            eprintln!("Warning: {} no longer matches its server", config_id);
        }
    }
    let watcher = reconciler.watch(&app.catalog);

    tracing::info!(running = app.connections.list().len(), "waiting for Ctrl-C");
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C, shutting down");
    }

    watcher.abort();
    app.connections.stop_all().await;
    events_task.abort();
    Ok(())
}

async fn redact(app: &App, file: Option<PathBuf>, embedded_field: Option<String>) -> Result<(), CliError> {
    let content = match &file {
        Some(path) => tokio::fs::read_to_string(path)
            .await
            .map_err(|source| CliError::Input {
                what: path.display().to_string(),
                source,
            })?,
        None => {
            let mut buf = String::new();
            tokio::io::stdin()
                .read_to_string(&mut buf)
                .await
                .map_err(|source| CliError::Input {
                    what: "stdin".to_string(),
                    source,
                })?;
            buf
        }
    };

    let stored = SecretRedactor::from_storage(&*app.storage).await?;
    let from_configs = SecretRedactor::collect(&app.store.list().await?, &[]);
    let redactor = SecretRedactor::new(stored.secrets().iter().chain(from_configs.secrets()).cloned());

    let output = match embedded_field {
        Some(field) => redactor.redact_embedded(&content, &field),
        None => redactor.redact(&content),
    };
    print!("{}", output);
    Ok(())
}

fn print_browse_table(servers: &[ServerDetail]) {
    const INDENT: &str = "        ";

    for s in servers {
        println!("{}", s.id);
        println!("{}Name:      {}", INDENT, s.name);
        if !s.version.is_empty() {
            println!("{}Version:   {}", INDENT, s.version);
        }
        if !s.description.is_empty() {
            println!("{}Summary:   {}", INDENT, s.description.lines().next().unwrap_or("").trim());
        }
        for (i, remote) in s.remotes.iter().enumerate() {
            println!("{}remote:{}  {} ({})", INDENT, i, remote.kind.as_str(), remote.url);
        }
        for (i, package) in s.packages.iter().enumerate() {
            let version = package.version.as_deref().map(|v| format!("@{}", v)).unwrap_or_default();
            println!("{}package:{} {} {}{}", INDENT, i, package.registry_type, package.identifier, version);
        }
        if !s.valid_schema {
            println!("{}Warning:   listing does not match the registry schema", INDENT);
        }
        println!("{}Registry:  {}", INDENT, s.registry_url);
        println!();
    }
}
