use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use mcpreg::config::ConfigStoreError;
use mcpreg::factory::FactoryError;
use mcpreg::models::{Remote, RemoteType};
use mcpreg::transport::HttpTransport;
use mcpreg::{
    ConfigStore, ConnectionConfig, ConnectionEvent, ConnectionManager, ConnectionService, DiscoveryError,
    MemoryStorage, Reconciler, Registry, RegistryCatalog, RemoteConfig, ServerDetail, ServerLookup, SetupError,
    Status, Transport, TransportBuilder, Variant,
};

const REGISTRY: &str = "https://registry.test";

struct FakeLookup {
    registries: HashMap<String, Vec<ServerDetail>>,
}

#[async_trait]
impl ServerLookup for FakeLookup {
    async fn list_registry(&self, registry_url: &str) -> Result<Vec<ServerDetail>, DiscoveryError> {
        self.registries
            .get(registry_url)
            .cloned()
            .ok_or_else(|| DiscoveryError::Status {
                url: registry_url.to_string(),
                status: reqwest::StatusCode::BAD_GATEWAY,
            })
    }
}

#[derive(Default)]
struct CountingBuilder {
    builds: AtomicUsize,
    fail_for: Option<String>,
}

impl CountingBuilder {
    fn failing_for(server_id: &str) -> Self {
        Self {
            builds: AtomicUsize::new(0),
            fail_for: Some(server_id.to_string()),
        }
    }

    fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportBuilder for CountingBuilder {
    async fn build(&self, server: &ServerDetail, _config: &ConnectionConfig) -> Result<Transport, FactoryError> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        if self.fail_for.as_deref() == Some(server.id.as_str()) {
            return Err(FactoryError::UnsupportedRemote("unknown"));
        }
        Ok(idle_transport())
    }
}

fn idle_transport() -> Transport {
    Transport::StreamableHttp(
        HttpTransport::new("http://127.0.0.1:1/mcp", &BTreeMap::new(), Duration::from_secs(1)).unwrap(),
    )
}

fn server(id: &str, registry_url: &str, remotes: usize) -> ServerDetail {
    ServerDetail {
        id: id.to_string(),
        registry_url: registry_url.to_string(),
        name: format!("io.test/{}", id.to_lowercase()),
        description: String::new(),
        version: "1.0.0".to_string(),
        remotes: (0..remotes)
            .map(|i| Remote {
                kind: RemoteType::StreamableHttp,
                url: format!("https://mcp.test/{}/{}", id, i),
                headers: Vec::new(),
            })
            .collect(),
        packages: Vec::new(),
        meta: Default::default(),
        valid_schema: true,
    }
}

fn remote_config(server_id: &str, remote_id: usize) -> ConnectionConfig {
    ConnectionConfig::Remote(RemoteConfig {
        server_id: server_id.to_string(),
        remote_id,
        headers: BTreeMap::from([("Authorization".to_string(), "Bearer t".to_string())]),
    })
}

fn lookup(registries: &[(&str, Vec<ServerDetail>)]) -> Arc<FakeLookup> {
    Arc::new(FakeLookup {
        registries: registries
            .iter()
            .map(|(url, servers)| (url.to_string(), servers.clone()))
            .collect(),
    })
}

fn store() -> Arc<ConfigStore> {
    Arc::new(ConfigStore::new(Arc::new(MemoryStorage::new())))
}

async fn next_event(events: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
    tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .expect("timed out waiting for connection event")
        .unwrap()
}

#[tokio::test]
async fn running_server_is_not_reconnected() {
    let store = store();
    store.add(remote_config("X", 0)).await.unwrap();
    let x = server("X", REGISTRY, 1);

    let connections = ConnectionManager::new();
    connections.insert(&remote_config("X", 0), &x, idle_transport());

    let builder = Arc::new(CountingBuilder::default());
    let reconciler = Reconciler::new(store, lookup(&[(REGISTRY, vec![x])]), builder.clone(), connections.clone());

    let report = reconciler.reconcile_registry(REGISTRY).await;
    assert_eq!(report.already_running, ["X:remote:0"]);
    assert!(report.started.is_empty());
    assert_eq!(builder.builds(), 0);
    assert_eq!(connections.list().len(), 1);
}

#[tokio::test]
async fn reports_started_stale_and_failed() {
    let store = store();
    store.add(remote_config("A", 0)).await.unwrap();
    store.add(remote_config("B", 3)).await.unwrap();
    store.add(remote_config("F", 0)).await.unwrap();
    store.add(remote_config("Z", 0)).await.unwrap();

    let servers = vec![server("A", REGISTRY, 1), server("B", REGISTRY, 1), server("F", REGISTRY, 1)];
    let builder = Arc::new(CountingBuilder::failing_for("F"));
    let connections = ConnectionManager::new();
    let reconciler = Reconciler::new(
        store.clone(),
        lookup(&[(REGISTRY, servers)]),
        builder.clone(),
        connections.clone(),
    );

    let report = reconciler.reconcile_registry(REGISTRY).await;
    assert_eq!(report.started, ["A:remote:0"]);
    assert_eq!(report.stale, ["B:remote:3"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "F:remote:0");
    assert_eq!(builder.builds(), 2);

    assert!(connections.is_running("A:remote:0"));
    assert!(!connections.is_server_running("Z"));
    // Stale and unlisted configurations stay stored.
    assert_eq!(store.list().await.unwrap().len(), 4);
}

#[tokio::test]
async fn unreachable_registry_gives_empty_report() {
    let store = store();
    store.add(remote_config("A", 0)).await.unwrap();
    let builder = Arc::new(CountingBuilder::default());
    let reconciler = Reconciler::new(store, lookup(&[]), builder.clone(), ConnectionManager::new());

    let report = reconciler.reconcile_registry("https://down.test").await;
    assert_eq!(report, Default::default());
    assert_eq!(builder.builds(), 0);
}

#[tokio::test]
async fn run_covers_every_registry() {
    let other = "https://other.test";
    let store = store();
    store.add(remote_config("A", 0)).await.unwrap();
    store.add(remote_config("B", 0)).await.unwrap();

    let catalog = RegistryCatalog::in_memory();
    let _first = catalog.register(Registry::new(REGISTRY, "one")).await.unwrap();
    let _second = catalog.register(Registry::new(other, "two")).await.unwrap();

    let connections = ConnectionManager::new();
    let reconciler = Reconciler::new(
        store,
        lookup(&[(REGISTRY, vec![server("A", REGISTRY, 1)]), (other, vec![server("B", other, 1)])]),
        Arc::new(CountingBuilder::default()),
        connections.clone(),
    );

    let mut report = reconciler.run(&catalog).await;
    report.started.sort();
    assert_eq!(report.started, ["A:remote:0", "B:remote:0"]);
    assert_eq!(connections.list().len(), 2);
}

#[tokio::test]
async fn newly_registered_registry_is_reconciled() {
    let store = store();
    store.add(remote_config("A", 0)).await.unwrap();

    let catalog = RegistryCatalog::in_memory();
    let connections = ConnectionManager::new();
    let reconciler = Reconciler::new(
        store,
        lookup(&[(REGISTRY, vec![server("A", REGISTRY, 1)])]),
        Arc::new(CountingBuilder::default()),
        connections.clone(),
    );
    let mut events = connections.subscribe();
    let watcher = reconciler.watch(&catalog);

    let _handle = catalog.register(Registry::new(REGISTRY, "late")).await.unwrap();

    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Started {
            config_id: "A:remote:0".to_string(),
            server_id: "A".to_string(),
        }
    );
    watcher.abort();
}

#[tokio::test]
async fn closed_transport_leaves_the_table() {
    let connections = ConnectionManager::new();
    let mut events = connections.subscribe();
    let a = server("A", REGISTRY, 1);

    let running = connections.insert(&remote_config("A", 0), &a, idle_transport());
    assert!(matches!(next_event(&mut events).await, ConnectionEvent::Started { .. }));

    running.transport.close().await;
    match next_event(&mut events).await {
        ConnectionEvent::Stopped { config_id, reason, .. } => {
            assert_eq!(config_id, "A:remote:0");
            assert_eq!(reason, "closed");
        }
        other => panic!("unexpected event: {other:?}"),
    }
    assert!(!connections.is_running("A:remote:0"));
}

struct Fixture {
    service: ConnectionService,
    builder: Arc<CountingBuilder>,
    _registration: mcpreg::RegistrationHandle,
}

async fn service_with(builder: CountingBuilder) -> Fixture {
    let catalog = RegistryCatalog::in_memory();
    let registration = catalog.register(Registry::new(REGISTRY, "test")).await.unwrap();
    let builder = Arc::new(builder);
    let service = ConnectionService::new(
        catalog,
        lookup(&[(REGISTRY, vec![server("A", REGISTRY, 2), server("F", REGISTRY, 1)])]),
        builder.clone(),
        store(),
        ConnectionManager::new(),
    );
    Fixture {
        service,
        builder,
        _registration: registration,
    }
}

#[tokio::test]
async fn setup_start_stop_remove() {
    let Fixture { service, builder, .. } = service_with(CountingBuilder::default()).await;

    let id = service.setup(remote_config("A", 1)).await.unwrap();
    assert_eq!(id, "A:remote:1");
    let statuses = service.statuses().await.unwrap();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].status, Status::Running);
    assert_eq!(statuses[0].variant, "remote:1");

    service.stop(&id).await.unwrap();
    assert_eq!(service.statuses().await.unwrap()[0].status, Status::Stopped);
    assert!(matches!(service.stop(&id).await, Err(SetupError::NotRunning(_))));

    service.start("A", Variant::Remote(1)).await.unwrap();
    service.start("A", Variant::Remote(1)).await.unwrap();
    assert_eq!(builder.builds(), 2);
    assert!(service.connections().is_running(&id));

    service.remove("A", Variant::Remote(1)).await.unwrap();
    assert!(service.statuses().await.unwrap().is_empty());
    assert!(!service.connections().is_running(&id));
    assert!(matches!(
        service.remove("A", Variant::Remote(1)).await,
        Err(SetupError::Store(ConfigStoreError::NotFound { .. }))
    ));
}

#[tokio::test]
async fn failed_setup_stores_nothing() {
    let Fixture { service, .. } = service_with(CountingBuilder::failing_for("F")).await;

    let err = service.setup(remote_config("F", 0)).await.unwrap_err();
    assert!(matches!(err, SetupError::Factory(_)));

    let err = service.setup(remote_config("missing", 0)).await.unwrap_err();
    assert!(matches!(err, SetupError::Discovery(DiscoveryError::ServerNotFound(_))));

    assert!(service.store().list().await.unwrap().is_empty());
    assert!(service.connections().list().is_empty());
}
