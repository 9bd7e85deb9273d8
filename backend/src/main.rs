mod config;
mod inference;
mod routes;
mod storage;

use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{App, HttpServer, web};
use config::AppConfig;
use inference::classifier::Classifier;
use inference::model::ModelHandle;
use routes::{AppState, configure_routes};
use std::env;
use storage::history_store::HistoryStore;
use storage::uploads::UploadStore;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv::dotenv().ok();
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    if let Ok(current_dir) = env::current_dir() {
        log::info!("Current working directory: {}", current_dir.display());
    } else {
        log::error!("Failed to get the current working directory.");
    }

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            log::error!("Invalid configuration: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                e.to_string(),
            ));
        }
    };
    log::info!("Configuration: {:?}", config);

    let uploads = UploadStore::new(config.upload_folder.clone());
    uploads.ensure_folder()?;
    let history = HistoryStore::new(config.history_folder.clone());
    history.ensure_folder()?;
    log::info!(
        "Uploads in {}, history in {}",
        uploads.folder().display(),
        history.folder().display()
    );

    let model = ModelHandle::load(&config.model_path);
    if !model.is_loaded() {
        log::warn!("Serving without a model: every classification will fail");
    }
    log::info!(
        "Classification head mode: {:?}, input normalization: {:?}",
        config.head_mode,
        config.normalization
    );

    let state = web::Data::new(AppState {
        model,
        classifier: Classifier::new(config.head_mode, config.normalization),
        uploads,
        history,
        max_upload_bytes: config.max_upload_bytes,
        history_pagination: config.history_pagination,
    });

    let allowed_origin = config.allowed_origin.clone();
    let bind_address = config.bind_address();
    log::info!("Starting server on {}:{}", bind_address.0, bind_address.1);

    HttpServer::new(move || {
        App::new()
            .wrap(Logger::default())
            .wrap(cors(&allowed_origin))
            .app_data(state.clone())
            .configure(configure_routes)
    })
    .bind(bind_address)?
    .run()
    .await
}

fn cors(allowed_origin: &str) -> Cors {
    let cors = if allowed_origin == "*" {
        Cors::default().allow_any_origin()
    } else {
        Cors::default().allowed_origin(allowed_origin)
    };
    cors.allowed_methods(vec!["GET", "POST", "OPTIONS"])
        .allowed_headers(vec![
            actix_web::http::header::ACCEPT,
            actix_web::http::header::CONTENT_TYPE,
        ])
        .max_age(3600)
}
