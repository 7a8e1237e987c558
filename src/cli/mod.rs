use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Host address and port for the HTTP server to listen on.
    #[arg(long, env = "SERVER_ADDR", default_value = "127.0.0.1:4000")]
    pub server_addr: String,

    // --- Conversation Store Args ---
    /// Conversation store type (redis, memory)
    #[arg(long, env = "STORE_TYPE", default_value = "redis")]
    pub store_type: String,

    /// Conversation store endpoint (e.g., redis://127.0.0.1:6379)
    #[arg(long, env = "STORE_URL", default_value = "redis://127.0.0.1:6379")]
    pub store_url: String,

    /// Prefix for Redis conversation keys.
    #[arg(long, env = "STORE_REDIS_PREFIX", default_value = "chat:")]
    pub store_redis_prefix: String,

    // --- Provider Args ---
    /// Path to the model endpoint configuration file (JSON array of
    /// provider configs). Models not listed fall back to the local daemon.
    #[arg(long, env = "MODEL_CONFIG_PATH")]
    pub model_config_path: Option<String>,

    /// Base URL of the local completion daemon used as the fallback
    /// provider for unconfigured models.
    #[arg(long, env = "OLLAMA_BASE_URL", default_value = "http://localhost:11434")]
    pub ollama_base_url: String,

    /// Key for decrypting provider API keys stored in the model config.
    #[arg(long, env = "VAULT_KEY", default_value = "")]
    pub vault_key: String,

    // --- Auth Args ---
    /// Secret for verifying bearer tokens. When unset the server runs in
    /// anonymous mode and sessions carry no owner.
    #[arg(long, env = "AUTH_SECRET")]
    pub auth_secret: Option<String>,

    // --- Tooling Args ---
    /// JSON search endpoint backing the web_search tool.
    #[arg(long, env = "SEARCH_URL", default_value = "http://localhost:8888/search")]
    pub search_url: String,

    /// Directory where uploaded attachment files are stored.
    #[arg(long, env = "UPLOAD_DIR", default_value = "uploads")]
    pub upload_dir: String,

    // --- TLS Args ---
    /// Optional path to the TLS certificate file (PEM format). Requires --tls-key-path.
    #[arg(long, env = "TLS_CERT_PATH")]
    pub tls_cert_path: Option<String>,

    /// Optional path to the TLS private key file (PEM format). Requires --tls-cert-path.
    #[arg(long, env = "TLS_KEY_PATH")]
    pub tls_key_path: Option<String>,

    #[arg(long, env = "ENABLE_TLS", default_value = "false")]
    pub enable_tls: bool,
}
