//! Package spawners: turn a registry package into a child process.

use std::collections::BTreeMap;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

use crate::config::PackageConfig;
use crate::models::{Package, RegistryType};
use crate::settings::Settings;
use crate::template::{self, TemplateError};
use crate::transport::{Launch, StdioTransport, TransportError};

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("Unsupported registry type: {0}")]
    Unsupported(String),
    #[error("Package has no identifier")]
    MissingIdentifier,
    #[error("{runner} is required to run {registry_type} MCP servers but was not found. {hint}")]
    RunnerMissing {
        runner: String,
        registry_type: RegistryType,
        hint: &'static str,
    },
    #[error(transparent)]
    Template(#[from] TemplateError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Spawns packages through the runner configured for their ecosystem.
#[derive(Debug, Clone)]
pub struct PackageSpawner {
    npm_runner: String,
    pypi_runner: String,
}

impl PackageSpawner {
    pub fn new(npm_runner: impl Into<String>, pypi_runner: impl Into<String>) -> Self {
        Self {
            npm_runner: npm_runner.into(),
            pypi_runner: pypi_runner.into(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(&settings.npm_runner, &settings.pypi_runner)
    }

    pub fn runner(&self, registry_type: &RegistryType) -> Result<&str, SpawnError> {
        match registry_type {
            RegistryType::Npm => Ok(&self.npm_runner),
            RegistryType::Pypi => Ok(&self.pypi_runner),
            RegistryType::Other(other) => Err(SpawnError::Unsupported(other.clone())),
        }
    }

    /// Resolve the command line and environment for a package.
    ///
    /// argv is `runtime arguments + identifier + package arguments`.
    pub fn plan(&self, package: &Package, config: &PackageConfig) -> Result<Launch, SpawnError> {
        let program = self.runner(&package.registry_type)?.to_string();
        if package.identifier.is_empty() {
            return Err(SpawnError::MissingIdentifier);
        }

        let mut args = Vec::new();
        for (i, argument) in package.runtime_arguments.iter().enumerate() {
            let value = config.runtime_arguments.get(&i).map(String::as_str);
            args.extend(template::render_argument(argument, value)?);
        }
        args.push(package.identifier.clone());
        for (i, argument) in package.package_arguments.iter().enumerate() {
            let value = config.package_arguments.get(&i).map(String::as_str);
            args.extend(template::render_argument(argument, value)?);
        }

        let mut env = BTreeMap::new();
        for input in &package.environment_variables {
            let Some(name) = input.name.as_deref() else {
                continue;
            };
            let value = config.environment_variables.get(name).map(String::as_str);
            if let Some(resolved) = template::resolve_input(input, value)? {
                env.insert(name.to_string(), resolved);
            }
        }

        Ok(Launch { program, args, env })
    }

    /// Resolve, check the runner is installed, and start the package.
    pub async fn spawn(&self, package: &Package, config: &PackageConfig) -> Result<StdioTransport, SpawnError> {
        let launch = self.plan(package, config)?;
        if !command_exists(&launch.program).await {
            return Err(SpawnError::RunnerMissing {
                runner: launch.program,
                registry_type: package.registry_type.clone(),
                hint: install_hint(&package.registry_type),
            });
        }
        tracing::info!(
            registry_type = %package.registry_type,
            identifier = %package.identifier,
            runner = %launch.program,
            "spawning package"
        );
        Ok(StdioTransport::spawn(&launch)?)
    }
}

fn install_hint(registry_type: &RegistryType) -> &'static str {
    match registry_type {
        RegistryType::Npm => "Please install Node.js: https://nodejs.org/en/download",
        RegistryType::Pypi => "Please install uv: https://docs.astral.sh/uv/getting-started/installation/",
        RegistryType::Other(_) => "",
    }
}

/// Whether `program --version` runs and exits successfully.
async fn command_exists(program: &str) -> bool {
    Command::new(program)
        .arg("--version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}
