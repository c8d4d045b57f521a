mod chat;
mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod pipeline;
mod retrieval;
mod routes;
mod state;
mod upload;

use anyhow::Result;
use aws_config::Region;
use aws_sdk_s3::config::Credentials;
use std::net::SocketAddr;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use std::sync::Arc;

use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::llm_client::LlmClient;
use crate::pipeline::events::RedisEventDispatcher;
use crate::pipeline::recovery::spawn_scheduler;
use crate::pipeline::store::postgres::PgVideoStore;
use crate::retrieval::embeddings::OpenAiEmbeddingClient;
use crate::routes::build_router;
use crate::state::AppState;
use crate::upload::handlers::UploadRegistry;
use crate::upload::S3Transport;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "{}={}",
                env!("CARGO_PKG_NAME").replace('-', "_"),
                &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting vidchat API v{}", env!("CARGO_PKG_VERSION"));

    // PostgreSQL
    let pool = create_pool(&config.database_url).await?;
    run_migrations(&pool).await?;
    let store = Arc::new(PgVideoStore::new(pool));

    // Redis event stream
    let redis = redis::Client::open(config.redis_url.clone())?;
    let dispatcher = Arc::new(RedisEventDispatcher::new(redis, config.event_stream.clone()));
    info!("Publishing pipeline events to stream '{}'", config.event_stream);

    // S3 / MinIO
    let s3 = build_s3_client(&config).await;
    let transport = Arc::new(S3Transport::new(s3, config.s3_bucket.clone()));
    info!("S3 transport initialized (bucket: {})", config.s3_bucket);

    // Model providers
    let embedder = Arc::new(OpenAiEmbeddingClient::new(
        config.openai_api_key.clone(),
        config.embedding_model.clone(),
        config.embedding_dims,
    ));
    let llm = Arc::new(LlmClient::new(config.anthropic_api_key.clone()));
    info!(
        "Model providers initialized (embeddings: {}, chat: {})",
        config.embedding_model,
        llm_client::MODEL
    );

    let _scheduler = spawn_scheduler(store.clone(), dispatcher.clone(), config.recovery.clone());

    let state = AppState {
        store,
        dispatcher,
        embedder,
        llm,
        transport,
        upload_jobs: UploadRegistry::default(),
        config: config.clone(),
    };

    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Constructs an S3 client configured for MinIO (local) or AWS (production).
async fn build_s3_client(config: &Config) -> aws_sdk_s3::Client {
    let credentials = Credentials::new(
        &config.aws_access_key_id,
        &config.aws_secret_access_key,
        None,
        None,
        "vidchat-static",
    );

    let s3_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
        .region(Region::new("us-east-1"))
        .credentials_provider(credentials)
        .endpoint_url(&config.s3_endpoint)
        .load()
        .await;

    let s3 = aws_sdk_s3::config::Builder::from(&s3_config)
        .force_path_style(true)
        .build();
    aws_sdk_s3::Client::from_conf(s3)
}
