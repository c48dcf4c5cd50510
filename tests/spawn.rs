//! Package connections end to end, with coreutils standing in for package runners.
#![cfg(target_os = "linux")]

use std::collections::BTreeMap;
use std::time::Duration;

use mcpreg::config::PackageConfig;
use mcpreg::factory::FactoryError;
use mcpreg::models::{Argument, ArgumentKind, Input, Package, RegistryType};
use mcpreg::spawn::{PackageSpawner, SpawnError};
use mcpreg::transport::CloseReason;
use mcpreg::{ConnectionConfig, ServerDetail, Transport, TransportBuilder, TransportFactory};

fn server(package: Package) -> ServerDetail {
    ServerDetail {
        id: "pkg".to_string(),
        registry_url: "https://registry.test".to_string(),
        name: "io.test/pkg".to_string(),
        description: String::new(),
        version: "1.0.0".to_string(),
        remotes: Vec::new(),
        packages: vec![package],
        meta: Default::default(),
        valid_schema: true,
    }
}

fn positional(value: &str) -> Argument {
    Argument {
        kind: ArgumentKind::Positional,
        input: Input::default().with_value(value),
    }
}

fn config(env: &[(&str, &str)]) -> ConnectionConfig {
    ConnectionConfig::Package(PackageConfig {
        server_id: "pkg".to_string(),
        package_id: 0,
        runtime_arguments: BTreeMap::new(),
        package_arguments: BTreeMap::new(),
        environment_variables: env.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
    })
}

fn factory(pypi_runner: &str) -> TransportFactory {
    TransportFactory::new(PackageSpawner::new("npx", pypi_runner), Duration::from_secs(5))
}

async fn read_line(transport: &Transport) -> Option<String> {
    let Transport::Stdio(stdio) = transport else {
        panic!("expected a stdio transport");
    };
    tokio::time::timeout(Duration::from_secs(5), stdio.read_line())
        .await
        .expect("timed out reading from child")
        .unwrap()
}

#[tokio::test]
async fn resolved_environment_reaches_the_child() {
    let package = Package {
        registry_type: RegistryType::Pypi,
        identifier: "sh".to_string(),
        version: None,
        runtime_arguments: Vec::new(),
        package_arguments: vec![positional("-c"), positional("echo \"$API_TOKEN|$MODE\"; cat")],
        environment_variables: vec![
            Input::named("API_TOKEN").required().secret(),
            Input::named("MODE").with_default("fast"),
        ],
    };

    let transport = factory("env")
        .build(&server(package), &config(&[("API_TOKEN", "abc")]))
        .await
        .unwrap();
    assert_eq!(transport.kind(), "stdio");
    assert_eq!(read_line(&transport).await.as_deref(), Some("abc|fast"));

    let Transport::Stdio(stdio) = &transport else {
        unreachable!()
    };
    stdio.send_line("ping").await.unwrap();
    assert_eq!(read_line(&transport).await.as_deref(), Some("ping"));

    transport.close().await;
    let reason = tokio::time::timeout(Duration::from_secs(5), transport.closed())
        .await
        .unwrap();
    assert!(!matches!(reason, CloseReason::Failed(_)), "unexpected close: {reason}");
}

#[tokio::test]
async fn child_exit_is_reported() {
    let package = Package {
        registry_type: RegistryType::Pypi,
        identifier: "sh".to_string(),
        version: None,
        runtime_arguments: Vec::new(),
        package_arguments: vec![positional("-c"), positional("exit 7")],
        environment_variables: Vec::new(),
    };

    let transport = factory("env").build(&server(package), &config(&[])).await.unwrap();
    let reason = tokio::time::timeout(Duration::from_secs(5), transport.closed())
        .await
        .unwrap();
    assert_eq!(reason, CloseReason::Exited(Some(7)));
}

#[tokio::test]
async fn missing_required_variable_spawns_nothing() {
    let package = Package {
        registry_type: RegistryType::Pypi,
        identifier: "sh".to_string(),
        version: None,
        runtime_arguments: Vec::new(),
        package_arguments: Vec::new(),
        environment_variables: vec![Input::named("API_TOKEN").required()],
    };

    let err = factory("env").build(&server(package), &config(&[])).await.unwrap_err();
    assert!(matches!(err, FactoryError::Spawn(SpawnError::Template(_))), "{err}");
}

#[tokio::test]
async fn missing_runner_gives_install_hint() {
    let package = Package {
        registry_type: RegistryType::Pypi,
        identifier: "anything".to_string(),
        version: None,
        runtime_arguments: Vec::new(),
        package_arguments: Vec::new(),
        environment_variables: Vec::new(),
    };

    let err = factory("mcpreg-no-such-runner")
        .build(&server(package), &config(&[]))
        .await
        .unwrap_err();
    match err {
        FactoryError::Spawn(SpawnError::RunnerMissing { runner, hint, .. }) => {
            assert_eq!(runner, "mcpreg-no-such-runner");
            assert!(hint.contains("docs.astral.sh/uv"));
        }
        other => panic!("unexpected error: {other}"),
    }
}
