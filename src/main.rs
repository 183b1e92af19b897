use std::convert::Infallible;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::{
    domain::ElectricityPriceProvider,
    fjordkraft::Fjordkraft,
    operations::{fetch_and_persist_prices, price_series, DEFAULT_PERIOD_DAYS},
    settings::{Config, ConfigError},
    setup::setup_app_state,
};

mod domain;
mod fjordkraft;
mod http;
mod operations;
mod price_repository;
mod settings;
mod setup;

const APP_NAME: &str = "fjordtrack";

#[derive(Parser, Debug)]
#[command(name = APP_NAME, version, about = "Tracks fjordkraft electricity prices per region")]
struct Cli {
    /// Defaults to `serve`
    #[command(subcommand)]
    cmd: Option<Command>,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Serve prices and series over http
    Serve,
    /// Print the current prices without storing them
    Fetch,
    /// Store the prices that changed since the previous run
    Sync,
    /// Print the price series of the plotted region
    Series {
        /// Number of days to look back
        #[arg(
            default_value_t = DEFAULT_PERIOD_DAYS,
            value_parser = clap::value_parser!(i64).range(0..)
        )]
        days: i64,
    },
    /// Inspect or change the configuration, defaults to `show`
    Config {
        #[command(subcommand)]
        action: Option<ConfigAction>,
    },
}

#[derive(Subcommand, Debug, PartialEq)]
enum ConfigAction {
    /// List every setting
    Show,
    /// Set a key and write the local config file
    Set {
        key: String,
        #[arg(value_parser = parse_value)]
        value: Value,
    },
    /// Remove a key and write the local config file
    Unset { key: String },
    /// Write the settings to the working directory
    SaveLocal,
    /// Write the settings to the home directory
    SaveGlobal,
}

/// Plain words are stored as strings, anything else that parses as json keeps its type.
fn parse_value(raw: &str) -> Result<Value, Infallible> {
    Ok(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn print_json<T: Serialize>(value: &T) -> Result<(), String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    println!("{}", rendered);
    Ok(())
}

/// `set` and `unset` are written to the local config file right away.
fn run_config_action(action: ConfigAction, mut config: Config) -> Result<(), ConfigError> {
    match action {
        ConfigAction::Show => {
            for (key, value) in config.iter() {
                println!("{} = {}", key, value);
            }
            Ok(())
        }
        ConfigAction::Set { key, value } => {
            config.set(key, value)?;
            config.save_local()
        }
        ConfigAction::Unset { key } => {
            if !config.contains_key(&key) {
                return Err(ConfigError::Missing { key });
            }
            config.remove(&key);
            config.save_local()
        }
        ConfigAction::SaveGlobal => config.save_global(),
        ConfigAction::SaveLocal => config.save_local(),
    }
}

async fn run(command: Command, config: Config) -> Result<(), String> {
    match command {
        Command::Config { action } => {
            let action = action.unwrap_or(ConfigAction::Show);
            return run_config_action(action, config).map_err(|e| e.to_string());
        }
        Command::Fetch => {
            let prices = Fjordkraft::new()
                .fetch_prices()
                .await
                .map_err(|e| e.to_string())?;
            return print_json(&prices);
        }
        _ => {}
    }

    let state = setup_app_state(&config).await.map_err(|e| e.to_string())?;

    let result = match command {
        Command::Sync => fetch_and_persist_prices(
            &*state.electricity_provider,
            &*state.price_repository,
            None,
        )
        .await
        .map_err(|e| e.to_string())
        .and_then(|changes| print_json(&changes)),
        Command::Series { days } => price_series(&*state.price_repository, days)
            .await
            .map_err(|e| e.to_string())
            .and_then(|series| print_json(&series)),
        _ => http::start_http_server(state.clone())
            .await
            .map_err(|e| e.to_string()),
    };

    state.db.close().await;

    result
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let command = cli.cmd.unwrap_or(Command::Serve);

    dotenv::dotenv().ok();

    let config = match Config::from_default_locations() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };

    tracing_subscriber::fmt()
        .with_max_level(config.log_level())
        .init();

    info!("Starting {} ({:?})", APP_NAME, command);
    debug!("{} settings in effect", config.len());

    match run(command, config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Option<Command>, clap::Error> {
        let args = std::iter::once(APP_NAME).chain(args.iter().copied());

        Cli::try_parse_from(args).map(|cli| cli.cmd)
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(&[]).unwrap(), None);
        assert_eq!(parse(&["serve"]).unwrap(), Some(Command::Serve));
        assert_eq!(parse(&["sync"]).unwrap(), Some(Command::Sync));
        assert_eq!(parse(&["fetch"]).unwrap(), Some(Command::Fetch));
        assert_eq!(
            parse(&["series"]).unwrap(),
            Some(Command::Series {
                days: DEFAULT_PERIOD_DAYS
            })
        );
        assert_eq!(
            parse(&["series", "7"]).unwrap(),
            Some(Command::Series { days: 7 })
        );
    }

    #[test]
    fn test_parse_config_actions() {
        assert_eq!(
            parse(&["config"]).unwrap(),
            Some(Command::Config { action: None })
        );
        assert_eq!(
            parse(&["config", "save-global"]).unwrap(),
            Some(Command::Config {
                action: Some(ConfigAction::SaveGlobal)
            })
        );
        assert_eq!(
            parse(&["config", "set", "database.port", "6543"]).unwrap(),
            Some(Command::Config {
                action: Some(ConfigAction::Set {
                    key: "database.port".to_string(),
                    value: Value::from(6543),
                })
            })
        );
        assert_eq!(
            parse(&["config", "set", "database.host", "db.local"]).unwrap(),
            Some(Command::Config {
                action: Some(ConfigAction::Set {
                    key: "database.host".to_string(),
                    value: Value::from("db.local"),
                })
            })
        );
        assert_eq!(
            parse(&["config", "unset", "loglevel"]).unwrap(),
            Some(Command::Config {
                action: Some(ConfigAction::Unset {
                    key: "loglevel".to_string()
                })
            })
        );
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(parse(&["series", "-3"]).is_err());
        assert!(parse(&["series", "week"]).is_err());
        assert!(parse(&["plot"]).is_err());
        assert!(parse(&["config", "set", "database.port"]).is_err());
    }

    #[test]
    fn test_cli_definition_is_consistent() {
        use clap::CommandFactory;

        Cli::command().debug_assert();
    }
}
