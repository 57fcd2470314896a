use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::models::{
    GenerationOptions, Message, MessageMeta, RelayRequest, DEFAULT_CONVERSATION_NAME,
    ROLE_ASSISTANT,
};
use crate::relay::ChatBackend;
use crate::store::{ConversationStore, StoreError};

/// Most recent turns forwarded to the backend as context, the new user
/// message included.
const HISTORY_WINDOW: usize = 12;

const WARN_CREATE: &str = "⚠️ could not create the conversation.";
const WARN_CONNECT: &str = "⚠️ could not reach the model backend.";
const WARN_UNEXPECTED: &str = "⚠️ unexpected error.";

/// Mutation notifications for subscribers (sidebar, message pane, REPL).
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    ConversationCreated { id: Uuid, name: String },
    /// The listing order or contents changed; reload the sidebar.
    ListChanged,
    MessagesChanged { id: Uuid },
    /// One incremental piece of the assistant reply, in receipt order.
    Fragment { id: Uuid, text: String },
}

/// Orchestrates one send operation end to end: ensure a conversation exists,
/// persist the user turn, stream the reply into a growing draft, persist the
/// finalized exchange. Every failure path leaves a `⚠️` assistant turn behind
/// instead of an error.
pub struct ChatController {
    store: Arc<ConversationStore>,
    backend: Arc<dyn ChatBackend>,
    model: String,
    options: GenerationOptions,
    selected: Option<Uuid>,
    messages: Vec<Message>,
    subscribers: Vec<mpsc::UnboundedSender<ControllerEvent>>,
}

impl ChatController {
    pub fn new(
        store: Arc<ConversationStore>,
        backend: Arc<dyn ChatBackend>,
        model: impl Into<String>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            store,
            backend,
            model: model.into(),
            options,
            selected: None,
            messages: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    pub fn selected(&self) -> Option<Uuid> {
        self.selected
    }

    /// In-memory view of the selected conversation, including any draft
    /// assistant reply while a stream is in flight.
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Point the controller at an existing conversation (or none) and load
    /// its history. Missing records read as empty, per the lenient read path.
    pub async fn select(&mut self, id: Option<Uuid>) -> Result<(), StoreError> {
        self.selected = id;
        self.messages = match id {
            Some(id) => self.store.get_messages(id).await?,
            None => Vec::new(),
        };
        Ok(())
    }

    /// Register a subscriber for mutation events. Closed receivers are pruned
    /// on the next publish.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<ControllerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.push(tx);
        rx
    }

    fn publish(&mut self, event: ControllerEvent) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    async fn ensure_conversation(&mut self) -> Result<Uuid, StoreError> {
        if let Some(id) = self.selected {
            return Ok(id);
        }
        let conversation = self.store.create(None).await?;
        self.selected = Some(conversation.id);
        self.publish(ControllerEvent::ConversationCreated {
            id: conversation.id,
            name: conversation.name,
        });
        self.publish(ControllerEvent::ListChanged);
        Ok(conversation.id)
    }

    /// Persist the in-memory view; the listing order changes because the
    /// index timestamp moves.
    async fn persist(&mut self, id: Uuid) -> Result<(), StoreError> {
        self.store.save_messages(id, self.messages.clone()).await?;
        self.publish(ControllerEvent::MessagesChanged { id });
        self.publish(ControllerEvent::ListChanged);
        Ok(())
    }

    /// Append a warning as a normal assistant turn. Persisting the warning is
    /// best effort; it must not turn into a second failure.
    async fn append_warning(&mut self, id: Uuid, text: &str) -> Message {
        let warning = Message::assistant(text);
        self.messages.push(warning.clone());
        let _ = self.persist(id).await;
        warning
    }

    /// One full user-turn-to-persisted-exchange cycle. Returns the finalized
    /// assistant message, which is a `⚠️` warning turn on failure paths, or
    /// `None` for blank input.
    pub async fn send(&mut self, input: &str, cancel: CancellationToken) -> Option<Message> {
        let text = input.trim();
        if text.is_empty() {
            return None;
        }

        let id = match self.ensure_conversation().await {
            Ok(id) => id,
            Err(_) => {
                // No id to persist under; the warning stays in memory only.
                let warning = Message::assistant(WARN_CREATE);
                self.messages.push(warning.clone());
                return Some(warning);
            }
        };

        // The user's turn is durable before the backend is ever contacted.
        self.messages.push(Message::user(text));
        if self.persist(id).await.is_err() {
            return Some(self.append_warning(id, WARN_UNEXPECTED).await);
        }

        let start = Instant::now();
        let window = self.messages.len().saturating_sub(HISTORY_WINDOW);
        let request = RelayRequest {
            model: self.model.clone(),
            messages: self.messages[window..].to_vec(),
            options: self.options,
        };

        let mut stream = match self.backend.open(&request, cancel).await {
            Ok(stream) => stream,
            Err(_) => return Some(self.append_warning(id, WARN_CONNECT).await),
        };

        // Placeholder the fragments grow into; replaced wholesale once the
        // stream completes.
        self.messages.push(Message {
            role: ROLE_ASSISTANT.to_string(),
            content: String::new(),
            ts: None,
            meta: Some(MessageMeta::default()),
        });

        let mut accumulated = String::new();
        let mut ttfb_ms: Option<f64> = None;

        while let Some(fragment) = stream.next().await {
            if ttfb_ms.is_none() {
                ttfb_ms = Some(start.elapsed().as_secs_f64() * 1000.0);
                if let Some(draft) = self.messages.last_mut() {
                    draft.meta = Some(MessageMeta {
                        ttfb_ms,
                        total_ms: None,
                    });
                }
            }
            accumulated.push_str(&fragment);
            if let Some(draft) = self.messages.last_mut() {
                draft.content = accumulated.clone();
            }
            self.publish(ControllerEvent::Fragment { id, text: fragment });
        }

        let finalized = Message {
            role: ROLE_ASSISTANT.to_string(),
            content: accumulated,
            ts: Some(Utc::now().to_rfc3339()),
            meta: Some(MessageMeta {
                ttfb_ms,
                total_ms: Some(start.elapsed().as_secs_f64() * 1000.0),
            }),
        };
        self.messages.pop();
        self.messages.push(finalized.clone());

        if self.persist(id).await.is_err() {
            return Some(self.append_warning(id, WARN_UNEXPECTED).await);
        }
        Some(finalized)
    }

    /// Empty the conversation and restore the default title. Idempotent;
    /// titles are never auto-derived, so nothing re-names it afterwards.
    pub async fn clear(&mut self) -> Result<(), StoreError> {
        let Some(id) = self.selected else {
            return Ok(());
        };
        self.messages.clear();
        self.store.save_messages(id, Vec::new()).await?;
        self.store.rename(id, Some(DEFAULT_CONVERSATION_NAME)).await?;
        self.publish(ControllerEvent::MessagesChanged { id });
        self.publish(ControllerEvent::ListChanged);
        Ok(())
    }
}
