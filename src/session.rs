//! Session state: the conversation list, the current selection, and the
//! send loop that streams assistant replies into it.
//!
//! Every mutation persists the whole list before the state lock is released,
//! so writes reach the store in the same order as the mutations.

use crate::api::{ChatStreamProvider, StreamRequest};
use crate::models::{Conversation, Message, ModelParams, ModelParamsUpdate};
use crate::storage::ConversationStore;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, Notify};
use uuid::Uuid;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("conversation {0} does not exist")]
    UnknownConversation(Uuid),

    #[error("conversation {0} is already waiting for a reply")]
    ConversationBusy(Uuid),

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum StreamStatus {
    Completed,
    Cancelled,
    Failed(String),
}

/// Result of one `send_message` call.
#[derive(Clone, Debug, PartialEq)]
pub struct SendOutcome {
    pub conversation_id: Uuid,
    pub user_message_id: Uuid,
    pub assistant_message_id: Uuid,
    pub status: StreamStatus,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SessionEvent {
    ConversationCreated {
        conversation_id: Uuid,
    },
    MessageChunk {
        conversation_id: Uuid,
        message_id: Uuid,
        delta: String,
    },
    StreamFinished {
        conversation_id: Uuid,
        message_id: Uuid,
        status: StreamStatus,
    },
}

struct SessionState {
    conversations: Vec<Conversation>,
    current_id: Uuid,
    params: ModelParams,
}

impl SessionState {
    fn conversation_mut(&mut self, id: Uuid) -> Option<&mut Conversation> {
        self.conversations.iter_mut().find(|c| c.id == id)
    }

    fn message_mut(&mut self, conversation_id: Uuid, message_id: Uuid) -> Option<&mut Message> {
        self.conversation_mut(conversation_id)?.message_mut(message_id)
    }
}

struct SessionInner {
    state: Mutex<SessionState>,
    persistence: ConversationStore,
    provider: Arc<dyn ChatStreamProvider>,
    // Conversations with a reply in flight, mapped to their cancel signal
    in_flight: DashMap<Uuid, Arc<Notify>>,
    events: broadcast::Sender<SessionEvent>,
}

// Frees the conversation for the next send however the stream ends
struct InFlightGuard<'a> {
    in_flight: &'a DashMap<Uuid, Arc<Notify>>,
    conversation_id: Uuid,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.remove(&self.conversation_id);
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

impl SessionManager {
    /// Loads persisted conversations, or starts with one empty conversation.
    pub async fn load(
        persistence: ConversationStore,
        provider: Arc<dyn ChatStreamProvider>,
        params: ModelParams,
    ) -> Result<Self, SessionError> {
        let conversations = match persistence.load_all().await? {
            Some(list) if !list.is_empty() => list,
            _ => vec![Conversation::new()],
        };
        let current_id = conversations[0].id;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Ok(Self {
            inner: Arc::new(SessionInner {
                state: Mutex::new(SessionState {
                    conversations,
                    current_id,
                    params,
                }),
                persistence,
                provider,
                in_flight: DashMap::new(),
                events,
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    pub async fn conversations(&self) -> Vec<Conversation> {
        self.inner.state.lock().await.conversations.clone()
    }

    pub async fn conversation(&self, id: Uuid) -> Option<Conversation> {
        let state = self.inner.state.lock().await;
        state.conversations.iter().find(|c| c.id == id).cloned()
    }

    pub async fn current_id(&self) -> Uuid {
        self.inner.state.lock().await.current_id
    }

    pub async fn current(&self) -> Conversation {
        let state = self.inner.state.lock().await;
        state
            .conversations
            .iter()
            .find(|c| c.id == state.current_id)
            .cloned()
            // current_id is only ever set to an id present in the list
            .unwrap_or_else(|| state.conversations[0].clone())
    }

    pub async fn params(&self) -> ModelParams {
        self.inner.state.lock().await.params.clone()
    }

    pub fn is_busy(&self, conversation_id: Uuid) -> bool {
        self.inner.in_flight.contains_key(&conversation_id)
    }

    /// Applies `apply` under the state lock and persists when it reports a change.
    async fn update<R>(
        &self,
        apply: impl FnOnce(&mut SessionState) -> Option<R>,
    ) -> Result<Option<R>, SessionError> {
        let mut state = self.inner.state.lock().await;
        let Some(result) = apply(&mut state) else {
            return Ok(None);
        };
        log::debug!("Persisting {} conversations", state.conversations.len());
        self.inner.persistence.save_all(&state.conversations).await?;
        Ok(Some(result))
    }

    fn emit(&self, event: SessionEvent) {
        if self.inner.events.send(event).is_err() {
            log::trace!("No session event subscribers");
        }
    }

    /// Inserts an empty conversation at the head of the list and selects it.
    pub async fn create_conversation(&self) -> Result<Uuid, SessionError> {
        let id = self
            .update(|state| {
                let conversation = Conversation::new();
                let id = conversation.id;
                state.conversations.insert(0, conversation);
                state.current_id = id;
                Some(id)
            })
            .await?
            .unwrap_or_default();
        log::info!("Created conversation {}", id);
        self.emit(SessionEvent::ConversationCreated { conversation_id: id });
        Ok(id)
    }

    /// Selects a conversation. Unknown ids are rejected and the selection is kept.
    pub async fn set_current(&self, id: Uuid) -> Result<(), SessionError> {
        let mut state = self.inner.state.lock().await;
        if !state.conversations.iter().any(|c| c.id == id) {
            log::warn!("Refusing to select unknown conversation {}", id);
            return Err(SessionError::UnknownConversation(id));
        }
        state.current_id = id;
        Ok(())
    }

    /// Returns whether a conversation with `id` was found and renamed.
    pub async fn rename_conversation(&self, id: Uuid, title: &str) -> Result<bool, SessionError> {
        let title = title.to_string();
        let renamed = self
            .update(|state| {
                let conversation = state.conversation_mut(id)?;
                conversation.title = title;
                Some(())
            })
            .await?;
        if renamed.is_none() {
            log::debug!("Rename ignored, conversation {} not found", id);
        }
        Ok(renamed.is_some())
    }

    pub async fn set_params(&self, update: ModelParamsUpdate) {
        let mut state = self.inner.state.lock().await;
        state.params.merge(update);
        log::info!(
            "Model params now model={} temperature={}",
            state.params.model,
            state.params.temperature
        );
    }

    /// Asks the reply streaming into `conversation_id` to stop. Returns false if none is running.
    pub fn cancel(&self, conversation_id: Uuid) -> bool {
        match self.inner.in_flight.get(&conversation_id) {
            Some(signal) => {
                log::warn!("Cancellation requested for conversation {}", conversation_id);
                // Kept as a permit if the send loop is not waiting right now
                signal.notify_one();
                true
            }
            None => false,
        }
    }

    /// Sends `text` to the current conversation and streams the reply into it.
    ///
    /// Blank text is ignored and yields `Ok(None)`. The conversation is captured
    /// when the call starts; selecting another conversation meanwhile does not
    /// redirect or stop the reply. Provider failures end up in the assistant
    /// message as `Error: ...`; only storage failures are returned as errors.
    pub async fn send_message(&self, text: &str) -> Result<Option<SendOutcome>, SessionError> {
        if text.trim().is_empty() {
            log::debug!("Ignoring blank message");
            return Ok(None);
        }

        let cancel = Arc::new(Notify::new());
        let mut state = self.inner.state.lock().await;
        let conversation_id = state.current_id;

        let _guard = match self.inner.in_flight.entry(conversation_id) {
            Entry::Occupied(_) => return Err(SessionError::ConversationBusy(conversation_id)),
            Entry::Vacant(slot) => {
                slot.insert(cancel.clone());
                InFlightGuard {
                    in_flight: &self.inner.in_flight,
                    conversation_id,
                }
            }
        };

        let user_message = Message::user(text);
        let assistant_message = Message::assistant_placeholder();
        let user_message_id = user_message.id;
        let assistant_message_id = assistant_message.id;
        let request = StreamRequest {
            prompt: text.to_string(),
            model: state.params.model.clone(),
            temperature: state.params.temperature,
        };

        let conversation = state
            .conversation_mut(conversation_id)
            .ok_or(SessionError::UnknownConversation(conversation_id))?;
        conversation.messages.push(user_message);
        conversation.messages.push(assistant_message);
        self.inner.persistence.save_all(&state.conversations).await?;
        drop(state);

        log::info!(
            "Sending message to conversation {} with model {}",
            conversation_id,
            request.model
        );

        let status = match self
            .stream_reply(conversation_id, assistant_message_id, &request, &cancel)
            .await
        {
            Ok(status) => status,
            Err(e) => {
                self.emit(SessionEvent::StreamFinished {
                    conversation_id,
                    message_id: assistant_message_id,
                    status: StreamStatus::Failed(e.to_string()),
                });
                return Err(e);
            }
        };

        log::info!("Reply {} finished: {:?}", assistant_message_id, status);
        self.emit(SessionEvent::StreamFinished {
            conversation_id,
            message_id: assistant_message_id,
            status: status.clone(),
        });

        Ok(Some(SendOutcome {
            conversation_id,
            user_message_id,
            assistant_message_id,
            status,
        }))
    }

    async fn stream_reply(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        request: &StreamRequest,
        cancel: &Notify,
    ) -> Result<StreamStatus, SessionError> {
        let opened = tokio::select! {
            biased;
            _ = cancel.notified() => None,
            opened = self.inner.provider.stream(request) => Some(opened),
        };
        let mut deltas = match opened {
            Some(Ok(stream)) => stream,
            Some(Err(e)) => return self.fail_reply(conversation_id, message_id, e).await,
            None => {
                log::warn!("Stopping reply {} on request", message_id);
                return Ok(StreamStatus::Cancelled);
            }
        };

        loop {
            // Dropping `deltas` on cancel also tears down the provider's connection
            let delta_result = tokio::select! {
                biased;
                _ = cancel.notified() => {
                    log::warn!("Stopping reply {} on request", message_id);
                    return Ok(StreamStatus::Cancelled);
                }
                next = deltas.next() => match next {
                    Some(delta_result) => delta_result,
                    None => break,
                },
            };

            match delta_result {
                Ok(delta) => {
                    self.update(|state| {
                        state
                            .message_mut(conversation_id, message_id)?
                            .content
                            .push_str(&delta);
                        Some(())
                    })
                    .await?;
                    self.emit(SessionEvent::MessageChunk {
                        conversation_id,
                        message_id,
                        delta,
                    });
                }
                Err(e) => return self.fail_reply(conversation_id, message_id, e).await,
            }
        }

        Ok(StreamStatus::Completed)
    }

    // Replaces whatever streamed so far with the error text
    async fn fail_reply(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        error: anyhow::Error,
    ) -> Result<StreamStatus, SessionError> {
        log::error!("Reply {} failed: {:?}", message_id, error);
        let reason = error.to_string();
        let content = format!("Error: {}", reason);
        self.update(|state| {
            state.message_mut(conversation_id, message_id)?.content = content;
            Some(())
        })
        .await?;
        Ok(StreamStatus::Failed(reason))
    }
}
