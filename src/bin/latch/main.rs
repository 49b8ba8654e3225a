use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use clap::Command;
use log::info;

use latch::config::Config;
use latch::dlock::{CoordinatorOptions, LockCoordinator};
use latch::replica::redis::RedisReplica;
use latch::router;

fn main() -> anyhow::Result<()> {
    let matches = Command::new("latch")
        .about("Quorum-based distributed lock coordinator")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(Command::new("server").about("Run the lock coordinator server"))
        .get_matches();

    match matches.subcommand() {
        Some(("server", _)) => server(),
        _ => unreachable!(),
    }
}

fn server() -> anyhow::Result<()> {
    let _logger = latch::logger::init()?;
    let config = Config::from_env()?;
    actix_rt::System::new().block_on(serve(config))
}

async fn serve(config: Config) -> anyhow::Result<()> {
    let replicas = config
        .replica_addresses
        .iter()
        .map(|addr| Ok(Arc::new(RedisReplica::new(addr)?)))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let coordinator = LockCoordinator::new(replicas, CoordinatorOptions::from(&config))?;

    info!(
        "latch coordinator serving on port {} against {} replicas",
        config.listen_port,
        coordinator.replica_count()
    );

    let coordinator = web::Data::new(coordinator);
    HttpServer::new(move || {
        App::new()
            .app_data(coordinator.clone())
            .configure(router::configure::<RedisReplica>)
    })
    .bind(("0.0.0.0", config.listen_port))?
    .run()
    .await?;

    Ok(())
}
