//! Process entry point (§4.13, §6 "Process CLI"). Loads configuration,
//! initializes tracing, builds the workflow registry, storage, rate
//! limiter, and LLM adapter, wires them into the Axum router, and serves.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use llm_council::backend::MockBackend;
use llm_council::config::{AppConfig, Cli, LogFormat};
use llm_council::engine::registry::{WorkflowConfig, WorkflowDefinition};
use llm_council::engine::stages::parallel_query::{ParallelQueryConfig, ParallelQueryStage};
use llm_council::engine::stages::peer_ranking::{PeerRankingConfig, PeerRankingStage};
use llm_council::engine::stages::synthesis::{SynthesisConfig, SynthesisStage};
use llm_council::engine::template::TemplateRenderer;
use llm_council::engine::WorkflowRegistry;
use llm_council::http::{rate_limiter_for, router, AppState};
use llm_council::llm::CouncilClient;
use llm_council::storage::FileConversationStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = AppConfig::from_env()?;
    config.apply_cli(&cli);
    init_tracing(&config);

    let registry = Arc::new(build_registry(&config));
    let storage = Arc::new(FileConversationStore::new(config.data_dir.clone()));
    let rate_limiter = Arc::new(rate_limiter_for(&config));
    let llm = Arc::new(build_llm_client(&config));
    let templates = Arc::new(TemplateRenderer::new());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    let config = Arc::new(config);
    let state = Arc::new(AppState {
        registry,
        storage,
        config: config.clone(),
        llm,
        templates,
        rate_limiter,
    });

    let app = router(state);
    tracing::info!(%addr, "starting llm-council-server");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    match config.log_format {
        LogFormat::Json => {
            tracing_subscriber::fmt().json().with_env_filter(filter).init();
        }
        LogFormat::Compact => {
            tracing_subscriber::fmt().compact().with_env_filter(filter).init();
        }
    }
}

fn build_registry(config: &AppConfig) -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register(WorkflowDefinition {
        id: "llm-council".to_string(),
        name: "LLM Council".to_string(),
        version: "1".to_string(),
        description: Some(
            "Fans a question out to a council of models, peer-ranks the answers, and synthesizes a final response."
                .to_string(),
        ),
        stages: vec![
            Arc::new(ParallelQueryStage::new(ParallelQueryConfig {
                models: config.council_models.clone(),
                system_prompt: None,
                user_prompt_template: None,
            })),
            Arc::new(PeerRankingStage::new(PeerRankingConfig {
                models: config.council_models.clone(),
                ranking_prompt_template: None,
            })),
            Arc::new(SynthesisStage::new(SynthesisConfig {
                chairman_model: config.chairman_model.clone(),
                chairman_max_tokens: config.chairman_max_tokens,
                synthesis_prompt_template: None,
            })),
        ],
        config: WorkflowConfig {
            timeout_ms: Some(config.http_request_timeout_ms),
            max_retries: None,
            streaming_enabled: true,
        },
    });
    registry
}

fn build_llm_client(config: &AppConfig) -> CouncilClient {
    let client = if config.mock_mode {
        CouncilClient::new(
            "http://mock",
            Arc::new(MockBackend::fixed("This is a mock response.")),
        )
    } else {
        #[cfg(feature = "openai")]
        {
            CouncilClient::openai_compatible(
                config.openrouter_api_url.clone(),
                config.openrouter_api_key.clone().unwrap_or_default(),
            )
        }
        #[cfg(not(feature = "openai"))]
        {
            CouncilClient::ollama(config.ollama_base_url.clone())
        }
    };
    client
        .with_timeout(Duration::from_millis(config.api_timeout_ms))
        .with_default_max_tokens(config.default_max_tokens)
}
