use log::debug;
use sqlx::migrate::Migrator;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use thiserror::Error;

use crate::{
    domain::ElectricityPriceProvider,
    fjordkraft::Fjordkraft,
    price_repository::{PostgresPriceRepository, PriceRepository},
    settings::{Config, ConfigError},
};

static MIGRATOR: Migrator = sqlx::migrate!();

#[derive(Debug, Error)]
pub(crate) enum SetupError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to create database pool: {0}")]
    Database(#[from] sqlx::Error),
    #[error("failed to create tables: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Setup the app state that is given to every route handler and command.
/// Contains the DB connection pool, the fjordkraft provider
/// and a price repository
pub(crate) async fn setup_app_state(config: &Config) -> Result<AppState, SetupError> {
    let db_pool = setup_db(config).await?;

    let price_repository = PostgresPriceRepository::new(db_pool.clone());

    Ok(AppState::new(
        db_pool,
        Arc::new(Fjordkraft::new()),
        Arc::new(price_repository),
    ))
}

async fn setup_db(config: &Config) -> Result<PgPool, SetupError> {
    let url = config.database_url()?;

    debug!(
        "connecting to {}://{}:{}{}",
        url.scheme(),
        url.host_str().unwrap_or_default(),
        url.port().unwrap_or_default(),
        url.path()
    );

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(url.as_str())
        .await?;

    MIGRATOR.run(&pool).await?;

    Ok(pool)
}

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) db: PgPool,
    pub(crate) electricity_provider: Arc<dyn ElectricityPriceProvider>,
    pub(crate) price_repository: Arc<dyn PriceRepository>,
}

impl AppState {
    pub(crate) fn new(
        db: PgPool,
        electricity_provider: Arc<dyn ElectricityPriceProvider>,
        price_repository: Arc<dyn PriceRepository>,
    ) -> Self {
        Self {
            db,
            electricity_provider,
            price_repository,
        }
    }
}
