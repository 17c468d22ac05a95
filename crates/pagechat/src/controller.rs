//! Drives one completion turn end to end: context assembly, streaming,
//! fallback, cancellation and persistence.
//!
//! The controller owns the current conversation and allows at most one
//! completion in flight. Progress is reported through a `ChatEvent`
//! channel so the frontend can render deltas as they arrive while the
//! conversation log stays the single source of truth.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::assembler::ContextAssembler;
use crate::context::{
    chunk_text, ActiveContexts, DocumentContext, ScrapedUrlContext, YoutubeContext, CHUNK_OVERLAP,
    CHUNK_TARGET,
};
use crate::conversation::Conversation;
use crate::extract::{PageContent, PageExtractor};
use crate::persistence::{
    generate_conversation_id, ConversationStore, ConversationSummary, ImageStore,
};
use llm::{
    ApiError, CancellationToken, ChatRequest, ChatTransport, ContentPart, DeltaStream, Message,
    MessageMeta, ProviderSettings, ProviderStore, Role, StreamFrame, Usage,
};

/// Progress of the running turn, for live rendering.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A transient status line, e.g. that a search is running.
    Notice(String),
    /// The next piece of assistant text.
    Delta(String),
    /// The turn ended normally.
    Finished { usage: Usage },
    /// The turn was stopped by the user.
    Cancelled,
    /// The turn ended with an error already recorded in the conversation.
    Failed(String),
}

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("a completion is already running, stop it first")]
    Busy,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub struct ChatController {
    transport: Arc<dyn ChatTransport>,
    providers: Arc<dyn ProviderStore>,
    store: Arc<dyn ConversationStore>,
    images: Arc<dyn ImageStore>,
    assembler: ContextAssembler,
    extractor: Option<Arc<dyn PageExtractor>>,
    conversation: Mutex<Conversation>,
    contexts: Mutex<ActiveContexts>,
    pending_images: Mutex<Vec<String>>,
    active: Mutex<Option<CancellationToken>>,
    events: mpsc::UnboundedSender<ChatEvent>,
    web_search: AtomicBool,
}

impl ChatController {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        providers: Arc<dyn ProviderStore>,
        store: Arc<dyn ConversationStore>,
        images: Arc<dyn ImageStore>,
        assembler: ContextAssembler,
        extractor: Option<Arc<dyn PageExtractor>>,
        events: mpsc::UnboundedSender<ChatEvent>,
    ) -> Self {
        Self {
            transport,
            providers,
            store,
            images,
            assembler,
            extractor,
            conversation: Mutex::new(Conversation::new(generate_conversation_id())),
            contexts: Mutex::new(ActiveContexts::default()),
            pending_images: Mutex::new(Vec::new()),
            active: Mutex::new(None),
            events,
            web_search: AtomicBool::new(false),
        }
    }

    /// Sends one user message and runs the completion to its end.
    ///
    /// Returns once the turn is finished, cancelled, or recorded as
    /// failed. Rejects with [`ControllerError::Busy`] while another
    /// turn is running. A provider configuration problem fails fast and
    /// leaves the conversation untouched.
    pub async fn send(&self, input: &str) -> Result<(), ControllerError> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(());
        }
        let cancel = self.begin_turn()?;
        let result = self.send_inner(input, cancel).await;
        self.end_turn();
        result.map_err(ControllerError::Other)
    }

    /// Resends the most recent user message, discarding everything the
    /// conversation recorded after it.
    pub async fn redo(&self) -> Result<(), ControllerError> {
        let cancel = self.begin_turn()?;
        let result = self.redo_inner(cancel).await;
        self.end_turn();
        result.map_err(ControllerError::Other)
    }

    /// Replaces the user message at `index` with new text and re-runs
    /// the turn from there. Messages after `index` are discarded.
    pub async fn edit_and_resend(&self, index: usize, new_text: &str) -> Result<(), ControllerError> {
        let new_text = new_text.trim();
        if new_text.is_empty() {
            return Ok(());
        }
        let cancel = self.begin_turn()?;
        let result = self.edit_inner(index, new_text, cancel).await;
        self.end_turn();
        result.map_err(ControllerError::Other)
    }

    /// Stops the running completion. A no-op when nothing is in flight,
    /// and safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some(cancel) = self.active.lock().unwrap().as_ref() {
            cancel.cancel();
        }
    }

    pub fn is_busy(&self) -> bool {
        self.active.lock().unwrap().is_some()
    }

    fn begin_turn(&self) -> Result<CancellationToken, ControllerError> {
        let mut active = self.active.lock().unwrap();
        if active.is_some() {
            return Err(ControllerError::Busy);
        }
        let cancel = CancellationToken::new();
        *active = Some(cancel.clone());
        Ok(cancel)
    }

    fn end_turn(&self) {
        *self.active.lock().unwrap() = None;
    }

    async fn send_inner(&self, input: &str, cancel: CancellationToken) -> Result<()> {
        let provider = self.providers.active_provider()?;
        let user_message = self.take_user_message(input);
        let (turn_id, history) = {
            let mut convo = self.conversation.lock().unwrap();
            let history = convo.messages.clone();
            convo.append_user_message(user_message.clone());
            (convo.id.clone(), history)
        };
        self.persist();
        self.complete_turn(cancel, &provider, &turn_id, history, user_message)
            .await
    }

    async fn redo_inner(&self, cancel: CancellationToken) -> Result<()> {
        let provider = self.providers.active_provider()?;
        let (turn_id, history, user_message) = {
            let mut convo = self.conversation.lock().unwrap();
            let index = convo
                .messages
                .iter()
                .rposition(|message| message.role == Role::User)
                .ok_or_else(|| anyhow!("No user message to resend"))?;
            let user_message = convo.messages[index].clone();
            let history = convo.messages[..index].to_vec();
            convo.truncate_from(index + 1);
            (convo.id.clone(), history, user_message)
        };
        self.persist();
        self.complete_turn(cancel, &provider, &turn_id, history, user_message)
            .await
    }

    async fn edit_inner(&self, index: usize, new_text: &str, cancel: CancellationToken) -> Result<()> {
        let provider = self.providers.active_provider()?;
        let user_message = Message::text(Role::User, new_text);
        let (turn_id, history) = {
            let mut convo = self.conversation.lock().unwrap();
            let target = convo
                .messages
                .get(index)
                .ok_or_else(|| anyhow!("No message at index {index}"))?;
            if target.role != Role::User {
                return Err(anyhow!("Only user messages can be edited"));
            }
            convo.truncate_from(index);
            let history = convo.messages.clone();
            convo.append_user_message(user_message.clone());
            (convo.id.clone(), history)
        };
        self.persist();
        self.complete_turn(cancel, &provider, &turn_id, history, user_message)
            .await
    }

    /// Folds staged image attachments into the outgoing user message.
    fn take_user_message(&self, input: &str) -> Message {
        let staged: Vec<String> = self.pending_images.lock().unwrap().drain(..).collect();
        if staged.is_empty() {
            return Message::text(Role::User, input);
        }
        let mut parts = vec![ContentPart::Text {
            text: input.to_string(),
        }];
        parts.extend(
            staged
                .into_iter()
                .map(|reference| ContentPart::ImageRef { reference }),
        );
        Message::parts(Role::User, parts)
    }

    async fn complete_turn(
        &self,
        cancel: CancellationToken,
        provider: &ProviderSettings,
        turn_id: &str,
        history: Vec<Message>,
        user_message: Message,
    ) -> Result<()> {
        let contexts = self.contexts.lock().unwrap().clone();
        let web_search = self.web_search.load(Ordering::Relaxed);
        let assembled = self
            .assembler
            .assemble(provider, &history, &contexts, &user_message, web_search)
            .await;

        if !assembled.notices.is_empty() {
            self.commit(turn_id, |convo| {
                for notice in &assembled.notices {
                    convo.append_notice(notice);
                }
            });
        }
        if cancel.is_cancelled() {
            debug!("Turn cancelled before the request went out");
            let _ = self.events.send(ChatEvent::Cancelled);
            return Ok(());
        }

        let request = ChatRequest::new(&provider.model, assembled.messages);
        match self
            .transport
            .stream_chat(provider, request.clone(), cancel)
            .await
        {
            Ok(stream) => {
                self.consume_stream(stream, provider, turn_id).await;
                Ok(())
            }
            Err(err) => {
                if let Some(ApiError::Configuration(_)) = err.downcast_ref::<ApiError>() {
                    return Err(err);
                }
                warn!("Falling back to non-streaming completion: {err:#}");
                self.fallback_complete(provider, request, turn_id).await;
                Ok(())
            }
        }
    }

    async fn consume_stream(
        &self,
        mut stream: DeltaStream,
        provider: &ProviderSettings,
        turn_id: &str,
    ) {
        self.commit(turn_id, |convo| convo.append_placeholder());
        loop {
            match stream.next().await {
                Some(StreamFrame::Delta(delta)) => {
                    self.mutate(turn_id, |convo| convo.append_delta(&delta));
                    let _ = self.events.send(ChatEvent::Delta(delta));
                }
                Some(StreamFrame::Done(usage)) => {
                    info!(
                        "Completion finished: {} input tokens, {} output tokens",
                        usage.input_tokens, usage.output_tokens
                    );
                    self.commit(turn_id, |convo| {
                        convo.finalize_last(Some(MessageMeta {
                            provider: provider.name.clone(),
                            model: provider.model.clone(),
                        }));
                    });
                    let _ = self.events.send(ChatEvent::Finished { usage });
                    return;
                }
                Some(StreamFrame::Failed(err)) => {
                    warn!("Stream failed: {err}");
                    self.commit(turn_id, |convo| {
                        let has_partial =
                            convo.in_flight_text().is_some_and(|text| !text.is_empty());
                        if has_partial {
                            convo.append_note_to_last("\n\n[Response interrupted]");
                        } else {
                            convo.replace_last_text(format!("[Error: {err}]"));
                        }
                        convo.finalize_last(None);
                    });
                    let _ = self.events.send(ChatEvent::Failed(err.to_string()));
                    return;
                }
                None => {
                    // The stream only dries up without a terminal frame
                    // when the user cancelled.
                    self.commit(turn_id, |convo| {
                        convo.append_note_to_last(" [Response stopped by user]");
                        convo.finalize_last(None);
                    });
                    let _ = self.events.send(ChatEvent::Cancelled);
                    return;
                }
            }
        }
    }

    /// Streaming setup failed; run the same request to completion in
    /// one shot. Either way the turn ends with exactly one assistant
    /// message, never a stray placeholder.
    async fn fallback_complete(
        &self,
        provider: &ProviderSettings,
        request: ChatRequest,
        turn_id: &str,
    ) {
        match self.transport.complete(provider, request).await {
            Ok(completion) => {
                self.commit(turn_id, |convo| {
                    convo.append_placeholder();
                    convo.replace_last_text(completion.text.clone());
                    convo.finalize_last(Some(MessageMeta {
                        provider: provider.name.clone(),
                        model: provider.model.clone(),
                    }));
                });
                let _ = self.events.send(ChatEvent::Delta(completion.text));
                let _ = self.events.send(ChatEvent::Finished {
                    usage: completion.usage,
                });
            }
            Err(err) => {
                warn!("Non-streaming fallback failed: {err:#}");
                self.commit(turn_id, |convo| {
                    convo.append_placeholder();
                    convo.replace_last_text(format!("[Error: {err:#}]"));
                    convo.finalize_last(None);
                });
                let _ = self.events.send(ChatEvent::Failed(format!("{err:#}")));
            }
        }
    }

    /// Applies a mutation if the turn's conversation is still current.
    fn mutate(&self, turn_id: &str, apply: impl FnOnce(&mut Conversation)) {
        let mut convo = self.conversation.lock().unwrap();
        if convo.id != turn_id {
            debug!("Conversation switched mid-turn, dropping update");
            return;
        }
        apply(&mut convo);
    }

    /// Like [`mutate`](Self::mutate), but also writes the result to the
    /// store. Streaming deltas use `mutate`; milestones use `commit`.
    fn commit(&self, turn_id: &str, apply: impl FnOnce(&mut Conversation)) {
        let snapshot = {
            let mut convo = self.conversation.lock().unwrap();
            if convo.id != turn_id {
                debug!("Conversation switched mid-turn, dropping update");
                return;
            }
            apply(&mut convo);
            convo.clone()
        };
        if let Err(err) = self.store.save(&snapshot) {
            warn!("Failed to persist conversation {}: {:#}", snapshot.id, err);
        }
    }

    fn persist(&self) {
        let snapshot = self.conversation.lock().unwrap().clone();
        if let Err(err) = self.store.save(&snapshot) {
            warn!("Failed to persist conversation {}: {:#}", snapshot.id, err);
        }
    }

    // Conversation management.

    /// Starts a fresh conversation and makes it current. The previous
    /// turn, if any, is cancelled. Empty conversations are not saved.
    pub fn new_conversation(&self) -> String {
        self.cancel();
        let fresh = Conversation::new(generate_conversation_id());
        let id = fresh.id.clone();
        *self.conversation.lock().unwrap() = fresh;
        self.contexts.lock().unwrap().clear();
        self.pending_images.lock().unwrap().clear();
        info!("Started conversation {id}");
        id
    }

    /// Loads a stored conversation and makes it current. Returns its
    /// title.
    pub fn open(&self, id: &str) -> Result<String> {
        let loaded = self
            .store
            .load(id)?
            .ok_or_else(|| anyhow!("Conversation '{id}' not found"))?;
        self.cancel();
        let title = loaded.title.clone();
        *self.conversation.lock().unwrap() = loaded;
        self.contexts.lock().unwrap().clear();
        self.pending_images.lock().unwrap().clear();
        Ok(title)
    }

    pub fn delete(&self, id: &str) -> Result<()> {
        self.store.delete(id)?;
        let is_current = self.conversation.lock().unwrap().id == id;
        if is_current {
            self.cancel();
            *self.conversation.lock().unwrap() = Conversation::new(generate_conversation_id());
            self.contexts.lock().unwrap().clear();
            self.pending_images.lock().unwrap().clear();
        }
        Ok(())
    }

    pub fn conversations(&self) -> Result<Vec<ConversationSummary>> {
        self.store.list()
    }

    /// A copy of the current conversation, e.g. for rendering the
    /// transcript.
    pub fn snapshot(&self) -> Conversation {
        self.conversation.lock().unwrap().clone()
    }

    // Context management.

    /// Pulls the active page from the configured extractor into the
    /// context set. Returns a label describing what was captured.
    pub async fn use_page_context(&self) -> Result<String> {
        let extractor = self
            .extractor
            .as_ref()
            .context("No page source configured")?;
        match extractor.active_page().await? {
            PageContent::Webpage {
                url,
                title,
                content,
            } => {
                let label = format!("{title} ({url})");
                let chunks = chunk_text(&content, CHUNK_TARGET, CHUNK_OVERLAP);
                self.contexts
                    .lock()
                    .unwrap()
                    .set_scraped_url(ScrapedUrlContext { url, title, chunks });
                Ok(label)
            }
            PageContent::Youtube {
                video_id,
                title,
                channel,
                description,
                transcript,
            } => {
                let label = format!("{title} [YouTube]");
                self.contexts.lock().unwrap().set_youtube(YoutubeContext {
                    video_id,
                    title,
                    channel,
                    description,
                    transcript,
                });
                Ok(label)
            }
        }
    }

    /// Attaches a text document as context for upcoming turns. Returns
    /// the number of chunks it was split into.
    pub fn attach_document(&self, name: &str, text: &str) -> usize {
        let chunks = chunk_text(text, CHUNK_TARGET, CHUNK_OVERLAP);
        let count = chunks.len();
        self.contexts.lock().unwrap().set_document(DocumentContext {
            name: name.to_string(),
            chunks,
        });
        count
    }

    /// Stores an image and stages it for the next user message.
    pub fn attach_image(&self, media_type: &str, data: &[u8]) -> Result<String> {
        let reference = self.images.save_image(media_type, data)?;
        self.pending_images.lock().unwrap().push(reference.clone());
        Ok(reference)
    }

    pub fn pending_image_count(&self) -> usize {
        self.pending_images.lock().unwrap().len()
    }

    pub fn clear_contexts(&self) {
        self.contexts.lock().unwrap().clear();
    }

    pub fn context_labels(&self) -> Vec<String> {
        self.contexts.lock().unwrap().labels()
    }

    pub fn set_web_search(&self, enabled: bool) {
        self.web_search.store(enabled, Ordering::Relaxed);
        info!(
            "Web search {}",
            if enabled { "enabled" } else { "disabled" }
        );
    }

    pub fn web_search(&self) -> bool {
        self.web_search.load(Ordering::Relaxed)
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let provider = self.providers.active_provider()?;
        Ok(self.transport.list_models(&provider).await)
    }
}
