use serde::Deserialize;

/// One newline-delimited JSON line from the inference backend.
#[derive(Debug, Default, Deserialize)]
pub struct BackendChunk {
    #[serde(default)]
    pub message: Option<ChunkMessage>,
    #[serde(default)]
    pub done: bool,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChunkMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}
