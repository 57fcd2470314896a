use std::sync::Arc;

use anyhow::Result;
use colored::Colorize;
use tower_http::{
    cors::{Any, CorsLayer},
    services::ServeDir,
};

use crate::config::ServerConfig;
use crate::relay::{ChatBackend, StreamRelay};
use crate::store::ConversationStore;
use crate::web::routes::{self, AppState};

/// Web server instance.
pub struct WebServer {
    config: ServerConfig,
}

impl WebServer {
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Bind and serve until shutdown.
    pub async fn start(self) -> Result<()> {
        let store = Arc::new(ConversationStore::open(&self.config.data_dir).await?);
        let backend: Arc<dyn ChatBackend> = Arc::new(StreamRelay::new(&self.config.backend_url));

        let state = AppState {
            store,
            backend,
            config: Arc::new(self.config.clone()),
        };

        let mut app = routes::create_router(state);

        // CORS for development against a separately served UI.
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);

        // Serve the browser UI if a directory was provided; API routes win.
        if let Some(web_dir) = &self.config.web_dir {
            if web_dir.exists() {
                println!("Serving static files from: {}", web_dir.display());
                app = app.fallback_service(ServeDir::new(web_dir));
            }
        }

        println!(
            "🌐 {} http://{}",
            "Chat server listening on".bright_cyan(),
            self.config.bind_addr
        );
        println!(
            "   Relay endpoint: POST http://{}/api/chat",
            self.config.bind_addr
        );
        println!("   Inference backend: {}", self.config.backend_url);
        println!("   Conversations: {}", self.config.data_dir.display());

        let listener = tokio::net::TcpListener::bind(&self.config.bind_addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}
