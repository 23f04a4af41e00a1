//! Storage server binary
//!
//! Reads the deployment configuration from the environment, opens the engine
//! (single or sharded), and serves the binary protocol until ctrl-c.

use std::net::SocketAddr;
use std::sync::Arc;

use noema_storage::{
    Backend, EmbeddingConfig, Engine, HttpEmbeddingClient, ServerConfig, ShardedEngine,
    StorageServer,
};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    info!("Starting Noema storage server");

    let config = ServerConfig::from_env();
    let addr: SocketAddr = config.listen_address.parse()?;

    info!("Configuration:");
    info!("  Listen address: {}", addr);
    info!("  Storage dir: {}", config.engine.storage_dir.display());
    info!("  Vector dimension: {}", config.engine.vector_dimension);
    info!(
        "  Reconcile intervals: {}/{}/{} ms",
        config.engine.reconcile_interval_ms_low,
        config.engine.reconcile_interval_ms_high,
        config.engine.reconcile_interval_ms_max
    );
    info!(
        "  Checkpoint every {} writes, wal_fsync={}",
        config.engine.checkpoint_every_n_writes, config.engine.wal_fsync
    );
    info!("  Shards: {}", config.num_shards);
    info!(
        "  Embedding service: {}",
        config.engine.embedding_service_url
    );

    let embedding = Arc::new(HttpEmbeddingClient::new(EmbeddingConfig {
        service_url: config.engine.embedding_service_url.clone(),
        ..Default::default()
    })?);

    let backend = if config.num_shards > 1 {
        let sharded = ShardedEngine::open(config.engine.clone(), config.num_shards)?;
        let stats = sharded.stats();
        info!(
            "Sharded engine ready: {} concepts, {} edges across {} shards",
            stats.total_concepts, stats.total_edges, stats.num_shards
        );
        Backend::Sharded(Arc::new(sharded))
    } else {
        let engine = Engine::open(config.engine.clone())?;
        let stats = engine.stats();
        info!(
            "Engine ready: {} concepts, {} edges, sequence {}",
            stats.snapshot.concept_count, stats.snapshot.edge_count, stats.snapshot.sequence
        );
        Backend::Single(Arc::new(engine))
    };

    let server = Arc::new(StorageServer::new(backend, embedding));
    server.serve(addr).await?;

    info!("Server shutdown complete");
    Ok(())
}
