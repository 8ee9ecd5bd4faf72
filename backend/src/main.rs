use actix_cors::Cors;
use actix_web::middleware::{DefaultHeaders, Logger};
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use log::{error, info};

use housing_backend::config::AppConfig;
use housing_backend::routes::{self, AppState};
use housing_backend::service::build_service;

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .format_module_path(false)
        .init();

    info!("Starting California Housing Model API");

    let config = AppConfig::from_env();
    let paths = config
        .resolve_artifacts()
        .context("resolving artifact paths")?;
    info!("Model artifact: {}", paths.model.display());
    info!("Model metadata: {}", paths.metadata.display());

    let service = build_service(&paths)
        .map_err(|e| {
            error!("Cannot load prediction service: {}", e);
            e
        })
        .context("loading prediction service")?;

    let state = web::Data::new(AppState { service, paths });
    let bind_address = config.bind_address();

    info!("Listening on http://{}", bind_address);
    info!("Workers: {}", config.workers);
    info!("   GET  /health    - health check");
    info!("   GET  /metadata  - features and accuracy metrics");
    info!("   POST /predict   - single prediction (?debug=true for raw errors)");

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(Logger::default())
            .wrap(DefaultHeaders::new().add(("X-Content-Type-Options", "nosniff")))
            .wrap(cors)
            .app_data(state.clone())
            .configure(routes::configure)
            .default_service(web::route().to(routes::not_found))
    })
    .workers(config.workers)
    .bind(&bind_address)?
    .run()
    .await?;

    Ok(())
}
