//! # Account-Keeper Service
//!
//! Binary entry point for the Account-Keeper HTTP service.
//!
//! This executable:
//! - Loads configuration from files and the environment
//! - Initializes structured logging
//! - Connects the account store and the dead-letter sink
//! - Starts the HTTP server from account-keeper-api
//!
//! Exit codes: 1 bind failure, 2 server failure, 3 configuration error,
//! 4 account store initialisation failure.

use account_keeper_api::{
    build_dead_letter_sink, start_server, AppState, LoggingConfig, ServiceConfig, ServiceError,
    StoreConfig,
};
use account_keeper_core::{AccountStore, InMemoryAccountStore};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() {
    // -------------------------------------------------------------------------
    // Load configuration
    //
    // Sources (later sources override earlier ones):
    //  1. /etc/account-keeper/service.yaml
    //  2. ./config/service.yaml
    //  3. Path given by AK_CONFIG_FILE
    //  4. Environment variables prefixed AK__ (double-underscore separator)
    //     e.g. AK__SERVER__PORT=9090 sets server.port = 9090
    //
    // Logging is configured from the loaded file, so it is initialised only
    // once loading has finished, successfully or not.
    // -------------------------------------------------------------------------
    let service_config = match load_config() {
        Ok(config) => {
            init_tracing(&config.logging);
            config
        }
        Err(e) => {
            init_tracing(&LoggingConfig::default());
            error!(error = %e, "Failed to load service configuration; aborting");
            std::process::exit(exit_code(&e));
        }
    };

    info!("Starting Account-Keeper Service");

    if let Err(e) = run(service_config).await {
        error!(error = %e, "Account-Keeper Service stopped with an error");
        std::process::exit(exit_code(&e));
    }
}

async fn run(config: ServiceConfig) -> Result<(), ServiceError> {
    // Before any connection is opened, so bad settings exit with code 3
    config.validate()?;

    let store = build_store(&config).await?;
    let dead_letters = build_dead_letter_sink(&config.dead_letter).await?;

    let state = AppState::from_config(config, store, dead_letters)?;

    info!(
        host = %state.config.server.host,
        port = state.config.server.port,
        cascade_cancel_on_delete = state.config.reconciler.cascade_cancel_on_delete,
        "Service configured"
    );

    start_server(state).await
}

fn load_config() -> Result<ServiceConfig, ServiceError> {
    let mut config_builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/account-keeper/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/service")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Ok(explicit_path) = std::env::var("AK_CONFIG_FILE") {
        if !explicit_path.is_empty() {
            config_builder = config_builder.add_source(
                config::File::with_name(&explicit_path)
                    .required(true)
                    .format(config::FileFormat::Yaml),
            );
        }
    }

    config_builder
        .add_source(
            config::Environment::with_prefix("AK")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|cfg| cfg.try_deserialize::<ServiceConfig>())
        .map_err(|e| {
            ServiceError::Configuration(account_keeper_api::ConfigError::Invalid {
                message: e.to_string(),
            })
        })
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!(
            "account_keeper_service={level},account_keeper_api={level},account_keeper_core={level},tower_http=info",
            level = logging.level
        )
        .into()
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json_format {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_current_span(true))
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn build_store(config: &ServiceConfig) -> Result<Arc<dyn AccountStore>, ServiceError> {
    match &config.store {
        StoreConfig::Memory => {
            warn!("Using the in-memory account store; accounts are lost on restart");
            Ok(Arc::new(InMemoryAccountStore::new()))
        }
        #[cfg(feature = "postgres")]
        StoreConfig::Postgres {
            url,
            max_connections,
        } => {
            use account_keeper_core::adapters::PostgresAccountStore;

            let store = PostgresAccountStore::connect(
                url,
                *max_connections,
                config.reconciler.to_policy().store_timeout,
            )
            .await
            .map_err(|e| ServiceError::StoreInitFailed {
                message: e.to_string(),
            })?;
            store
                .ensure_schema()
                .await
                .map_err(|e| ServiceError::StoreInitFailed {
                    message: e.to_string(),
                })?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        StoreConfig::Postgres { .. } => Err(ServiceError::Configuration(
            account_keeper_api::ConfigError::Invalid {
                message: "store.type 'postgres' requires the 'postgres' feature".to_string(),
            },
        )),
    }
}

fn exit_code(error: &ServiceError) -> i32 {
    match error {
        ServiceError::BindFailed { .. } => 1,
        ServiceError::ServerFailed { .. } => 2,
        ServiceError::Configuration(_) => 3,
        ServiceError::StoreInitFailed { .. } => 4,
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
