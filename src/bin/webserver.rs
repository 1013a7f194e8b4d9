// This is where we create the default webserver for running the binary
// locally: config, logging, the application, and the background loops.

use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use locomote::application::{application::Application, config::configuration::Configuration};
use locomote::builder::hook;
use locomote::content::GlobSet;
use locomote::gc::{self, GcConfig};
use tracing::{debug, error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let configuration = Configuration::parse();

    Application::install_logging(&configuration);
    info!("Locomote content server 🚂");

    let application = Application::initialize(configuration).await?;
    debug!("initialized application");

    run(application).await
}

pub async fn run(application: Application) -> Result<()> {
    let mut joins = tokio::task::JoinSet::new();

    // Background tasks: hook listener, cache sweeper, startup recovery
    {
        let app = application.clone();
        joins.spawn(async move {
            let host = app.config.updates_host.clone();
            hook::listen(&host, app.config.updates_port, app.builder.clone()).await
        });
    }
    {
        let app = application.clone();
        let preserve = GlobSet::new(&app.config.gc_preserve)?;
        let config = GcConfig {
            interval: Duration::from_secs(app.config.gc_interval_secs),
            max_age: Duration::from_secs(app.config.gc_max_age_days * 24 * 3600),
            preserve,
        };
        tokio::spawn(gc::run_loop(app.config.cache_dir.clone(), config));
    }

    application.schedule_initial_indexing();
    if let Err(err) = application.builder.startup_scan().await {
        error!(%err, "startup build scan failed");
    }

    joins.spawn(locomote::webserver::start(application));

    while let Some(result) = joins.join_next().await {
        if let Ok(Err(err)) = result {
            error!(?err, "locomote failed");
            return Err(err);
        }
    }

    Ok(())
}
