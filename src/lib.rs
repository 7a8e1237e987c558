pub mod auth;
pub mod cli;
pub mod extract;
pub mod models;
pub mod orchestrator;
pub mod providers;
pub mod registry;
pub mod server;
pub mod store;
pub mod tools;
pub mod vault;

use log::info;
use std::error::Error;
use std::sync::Arc;

use crate::auth::{ AnonymousVerifier, HmacTokenVerifier, TokenVerifier };
use crate::cli::Args;
use crate::orchestrator::Orchestrator;
use crate::registry::ModelRegistry;
use crate::server::{ AppState, Server };
use crate::store::create_store;
use crate::tools::HttpSearchTool;
use crate::vault::Vault;

pub async fn run(args: Args) -> Result<(), Box<dyn Error + Send + Sync>> {
    info!("Starting chat server with configuration:");
    info!("  Server address: {}", args.server_addr);
    info!("  Conversation store: {}", args.store_type);
    info!("  Local provider URL: {}", args.ollama_base_url);
    info!("  Search endpoint: {}", args.search_url);

    let registry = match &args.model_config_path {
        Some(path) => Arc::new(ModelRegistry::load(path, args.ollama_base_url.clone())?),
        None => {
            info!("No model config file set, every model uses the local provider");
            Arc::new(ModelRegistry::empty(args.ollama_base_url.clone()))
        }
    };

    let store = create_store(&args)?;
    let search = Arc::new(HttpSearchTool::new(args.search_url.clone()));
    let vault = Vault::new(args.vault_key.clone());

    let (verifier, require_auth): (Arc<dyn TokenVerifier>, bool) = match &args.auth_secret {
        Some(secret) => (Arc::new(HmacTokenVerifier::new(secret.clone())), true),
        None => {
            info!("AUTH_SECRET not set, running in anonymous mode");
            (Arc::new(AnonymousVerifier), false)
        }
    };

    let orchestrator = Arc::new(Orchestrator::new(registry, store.clone(), search, vault));

    let state = AppState {
        orchestrator,
        store,
        verifier,
        require_auth,
        upload_dir: args.upload_dir.clone(),
    };

    let server = Server::new(args.server_addr.clone(), state, args);
    server.run().await
}
