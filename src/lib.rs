pub mod config;
pub mod controller;
pub mod models;
pub mod relay;
pub mod store;
pub mod web;

pub use config::ServerConfig;
pub use controller::{ChatController, ControllerEvent};
pub use relay::{ChatBackend, FragmentStream, RelayError, StreamRelay};
pub use store::{ConversationStore, StoreError};
