//! `cfce-server`: boots the Causal-Fractal Context Engine's HTTP surface.
//!
//! Startup sequence follows the crate's config layer: `dotenvy` loads a
//! local `.env`, `clap` parses CLI flags (env-overridable, matching
//! `config.rs`'s file-plus-env-merge philosophy), `tracing-subscriber` is
//! initialized from `RUST_LOG`, `Settings::load` reads (or seeds) the
//! settings file, and every external collaborator is constructed behind
//! the trait object the orchestrator depends on.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use clap::Parser;

use cfce::api::{self, AppState};
use cfce::causal::filter::CausalFilter;
use cfce::causal::CausalGraph;
use cfce::coarse_grainer::CoarseGrainer;
use cfce::config::Settings;
use cfce::embedder::OpenAiEmbeddings;
use cfce::llm::OpenRouterLlm;
use cfce::orchestrator::Orchestrator;
use cfce::security::DefaultSecurity;
use cfce::store::TreeStore;
use cfce::summarizer::LlmSummarizer;
use cfce::tokenizer::TiktokenTokenizer;
use cfce::vector::VectorIndex;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "cfce-server", about = "Causal-Fractal Context Engine server")]
struct Cli {
    /// Address to bind the HTTP server to.
    #[arg(long, env = "CFCE_BIND_ADDR", default_value = "0.0.0.0:8080")]
    bind_addr: SocketAddr,

    /// Path to the JSON settings file; created with defaults if missing.
    #[arg(long, env = "CFCE_SETTINGS_PATH", default_value = "data/settings.json")]
    settings_path: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let settings = Settings::load(&cli.settings_path).context("loading settings")?;

    let embedder: Arc<dyn cfce::embedder::Embedder> = Arc::new(OpenAiEmbeddings::new(
        std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        "text-embedding-3-small".to_string(),
        settings.embedding_dimension,
    ));

    let store = Arc::new(TreeStore::new(settings.db_path.clone(), Arc::clone(&embedder)));
    store.init_db().context("initializing tree store schema")?;

    let vector_index = Arc::new(
        VectorIndex::new(settings.vector_index_path.clone(), Arc::clone(&embedder))
            .context("initializing vector index")?,
    );

    let causal_graph = CausalGraph::load(&settings.causal_graph_path).context("loading causal graph")?;
    let causal_graph = Arc::new(RwLock::new(Arc::new(causal_graph)));
    let causal_filter = Arc::new(CausalFilter::new(Arc::clone(&causal_graph)));

    let llm = Arc::new(OpenRouterLlm::new(settings.openrouter_api_key.clone(), settings.model.clone()));

    let summarizer = Arc::new(LlmSummarizer::new(
        std::env::var("ANTHROPIC_API_KEY").ok(),
        std::env::var("OPENAI_API_KEY").ok(),
        std::env::var("GOOGLE_API_KEY").ok(),
    ));
    let coarse_grainer = CoarseGrainer::spawn(
        Arc::clone(&store),
        summarizer,
        settings.similarity_threshold,
        settings.summarization_model.clone(),
    );

    let tokenizer = Arc::new(TiktokenTokenizer::new().context("loading cl100k_base tokenizer")?);

    let orchestrator = Arc::new(Orchestrator::new(
        store,
        Arc::clone(&vector_index),
        causal_filter,
        llm,
        coarse_grainer,
        Arc::new(DefaultSecurity),
        tokenizer,
        settings.system_persona.clone(),
        settings.temperature,
        settings.max_context_tokens,
        settings.prompt_injection_block_threshold,
    ));

    let state = AppState { orchestrator, vector_index };

    let app = api::router()
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(tower_http::timeout::TimeoutLayer::new(std::time::Duration::from_secs(120)));

    tracing::info!(addr = %cli.bind_addr, "starting cfce-server");
    let listener = tokio::net::TcpListener::bind(cli.bind_addr)
        .await
        .with_context(|| format!("binding {}", cli.bind_addr))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
