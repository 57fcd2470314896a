use std::net::SocketAddr;
use std::path::PathBuf;

use crate::models::GenerationOptions;

/// Runtime configuration shared by the web server and the terminal client.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the HTTP server binds to.
    pub bind_addr: SocketAddr,
    /// Base URL of the inference backend (Ollama-compatible API).
    pub backend_url: String,
    /// Directory holding one JSON record per conversation plus the index.
    pub data_dir: PathBuf,
    /// Model identifier as known to the backend.
    pub model: String,
    /// Sampling options forwarded with every completion request.
    pub options: GenerationOptions,
    /// Optional directory with the browser UI, served at `/`.
    pub web_dir: Option<PathBuf>,
}

/// Normalize a backend base URL so path joins stay predictable.
pub fn normalize_backend_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}
