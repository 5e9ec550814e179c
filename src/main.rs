use clap::{Parser, Subcommand};
use crowdnav::advisory::NoAdvisory;
use crowdnav::config::AppConfig;
use crowdnav::locator::locate;
use crowdnav::routing::{plan_route, RouteResponse};
use crowdnav::server::{self, AppState};
use crowdnav::store::{self, MemoryZoneStore};
use crowdnav::sync::{SyncOrchestrator, ZoneState};
use crowdnav::types::Coordinate;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sync loop and the HTTP API
    Serve {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
    },
    /// Print the zone containing a coordinate
    Locate {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long, allow_hyphen_values = true)]
        lat: f64,
        #[arg(long, allow_hyphen_values = true)]
        lon: f64,
    },
    /// Plan a route between two zones and print it as JSON
    Route {
        #[arg(short, long, value_name = "FILE", default_value = "config.toml")]
        config: PathBuf,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Serve { config } => {
            info!(config = ?config, "serving");
            let app_config = AppConfig::load_from_file(config)?;

            let zones = store::load_zones_geojson(&app_config.input.zones)?;
            // the orchestrator seeds the store with the validated zones on startup
            let repository = Arc::new(MemoryZoneStore::default());

            let (orchestrator, handle) =
                SyncOrchestrator::new(zones, repository.clone(), repository, &app_config.sync);
            tokio::spawn(orchestrator.run());

            let state = AppState {
                sync: handle,
                advisory: Arc::new(NoAdvisory),
                advisory_timeout: app_config.advisory.timeout(),
            };
            server::start_server(&app_config, state).await?;
        }
        Commands::Locate { config, lat, lon } => {
            let app_config = AppConfig::load_from_file(config)?;
            let zones = store::load_zones_geojson(&app_config.input.zones)?;

            println!("{}", locate(Coordinate::new(*lat, *lon), &zones));
        }
        Commands::Route { config, from, to } => {
            let app_config = AppConfig::load_from_file(config)?;
            // classify seeded occupancy before planning
            let state = ZoneState::new(store::load_zones_geojson(&app_config.input.zones)?);

            let route = plan_route(from, to, state.zones())?;
            println!("{}", serde_json::to_string_pretty(&RouteResponse::from(route))?);
        }
    }

    Ok(())
}
