use crate::auth::{ create_auth_provider, AuthProvider, Session, User };
use crate::cli::Args;
use crate::config::assistant::{ self, AssistantProfile };
use crate::error::{ ChatError, ChatResult };
use crate::history::{ context_window, initialize_store, ChatStore, CONTEXT_TURNS };
use crate::ingest::ocr::{ create_ocr_engine, OcrEngine };
use crate::ingest::spreadsheet::{ self, Analysis };
use crate::ingest::{ classify_upload, UploadKind };
use crate::llm::LlmConfig;
use crate::llm::chat::{ new_client as new_chat_client, ChatClient, GatewayMessage };
use crate::models::chat::{ Conversation, Message, MessagePage, NewMessage, Role };
use crate::models::content::{ ImageContent, MessageContent };
use crate::models::websocket::ImageUpload;
use crate::nlp;
use crate::storage::{ content_type_for, create_object_store, object_path, ObjectStore };

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::StreamExt;
use log::{ debug, info, warn, error };
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{ mpsc, RwLock };

pub const DEFAULT_PAGE_SIZE: usize = 20;
pub const MAX_PAGE_SIZE: usize = 100;

/// Notice attached to a reply produced by the fallback text.
pub const GATEWAY_NOTICE: &str = "Error getting AI response";

/// Notice for an image turn stored without extracted text.
pub const OCR_NOTICE: &str = "Could not extract text from the image";

#[derive(Debug, Clone)]
pub struct ImageAttachment {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

impl ImageAttachment {
    pub fn from_upload(upload: &ImageUpload) -> ChatResult<Self> {
        let bytes = BASE64.decode(upload.data.trim()).map_err(|e|
            ChatError::Validation(format!("Image data is not valid base64: {}", e))
        )?;
        Ok(Self {
            file_name: upload.file_name.clone(),
            bytes,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub text: String,
    pub image: Option<ImageAttachment>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SendOutcome {
    pub user_message: Message,
    pub assistant_message: Message,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpreadsheetReport {
    pub analysis: Analysis,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelList {
    pub models: Vec<String>,
    pub default_model: String,
}

#[derive(Debug, Clone)]
pub enum StreamEvent {
    UserMessage(Message),
    Chunk(String),
}

/// State shared between the user turn being stored and the reply being produced.
struct PreparedTurn {
    user_message: Message,
    context: Vec<GatewayMessage>,
    /// `None` sends the gateway client's configured model.
    model: Option<String>,
    notices: Vec<String>,
}

pub struct ChatAgent {
    store: Arc<dyn ChatStore>,
    auth: Arc<dyn AuthProvider>,
    objects: Arc<dyn ObjectStore>,
    ocr: Arc<dyn OcrEngine>,
    chat_client: Arc<dyn ChatClient>,
    profile: RwLock<AssistantProfile>,
    profile_path: Option<String>,
}

impl ChatAgent {
    fn initialize_chat_client(args: &Args) -> ChatResult<Arc<dyn ChatClient>> {
        let llm_type = args.chat_llm_type
            .parse()
            .map_err(|e| ChatError::Config(format!("Invalid chat LLM type: {}", e)))?;
        let chat_config = LlmConfig {
            llm_type,
            base_url: args.chat_base_url.clone(),
            api_key: Some(args.chat_api_key.clone()).filter(|k| !k.is_empty()),
            completion_model: args.chat_model.clone(),
            site_url: Some(args.public_url.clone()),
            site_name: Some(args.site_name.clone()),
        };
        let chat_client = new_chat_client(&chat_config)?;
        info!(
            "Chat client configured: Type={}, Model={}, BaseURL={}",
            args.chat_llm_type,
            chat_client.get_model(),
            chat_client.get_base_url()
        );
        Ok(chat_client)
    }

    pub async fn new(args: &Args) -> ChatResult<Self> {
        let chat_client = Self::initialize_chat_client(args)?;
        let store = initialize_store(args).await?;
        let auth = create_auth_provider(args)?;
        let objects = create_object_store(args)?;
        let ocr = create_ocr_engine(args);
        let profile = assistant::load_profile(&args.assistant_path)?;

        let mut agent = Self::with_components(store, auth, objects, ocr, chat_client, profile);
        agent.profile_path = Some(args.assistant_path.clone());
        Ok(agent)
    }

    pub fn with_components(
        store: Arc<dyn ChatStore>,
        auth: Arc<dyn AuthProvider>,
        objects: Arc<dyn ObjectStore>,
        ocr: Arc<dyn OcrEngine>,
        chat_client: Arc<dyn ChatClient>,
        profile: AssistantProfile
    ) -> Self {
        Self {
            store,
            auth,
            objects,
            ocr,
            chat_client,
            profile: RwLock::new(profile),
            profile_path: None,
        }
    }

    // --- Auth ---

    pub async fn sign_up(&self, email: &str, password: &str) -> ChatResult<User> {
        self.auth.sign_up(email, password).await
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> ChatResult<Session> {
        self.auth.sign_in(email, password).await
    }

    pub async fn sign_out(&self, access_token: &str) -> ChatResult<()> {
        self.auth.sign_out(access_token).await
    }

    pub async fn authenticate(&self, access_token: &str) -> ChatResult<User> {
        if access_token.trim().is_empty() {
            return Err(ChatError::Unauthorized("Missing access token".to_string()));
        }
        self.auth.user_for_token(access_token).await
    }

    // --- Conversations ---

    /// Returns the conversation if it exists and belongs to `user`.
    pub async fn owned_conversation(&self, user: &User, conversation_id: &str) -> ChatResult<Conversation> {
        match self.store.get_conversation(conversation_id).await? {
            Some(c) if c.user_id == user.id => Ok(c),
            _ => Err(ChatError::NotFound(format!("conversation {}", conversation_id))),
        }
    }

    pub async fn list_conversations(&self, user: &User) -> ChatResult<Vec<Conversation>> {
        self.store.list_conversations(&user.id).await
    }

    /// Creates a conversation with the default title and seeds it with the greeting.
    pub async fn start_new_chat(&self, user: &User) -> ChatResult<Conversation> {
        let (title, greeting) = {
            let profile = self.profile.read().await;
            (profile.default_title.clone(), profile.greeting.clone())
        };
        let conversation = self.store.create_conversation(&user.id, &title).await?;
        self.store.insert_message(NewMessage::new(&conversation.id, Role::Assistant, greeting)).await?;
        info!("User {} started conversation {}", user.id, conversation.id);
        Ok(self.store.get_conversation(&conversation.id).await?.unwrap_or(conversation))
    }

    pub async fn rename_conversation(
        &self,
        user: &User,
        conversation_id: &str,
        title: &str
    ) -> ChatResult<Conversation> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ChatError::Validation("Title must not be empty".to_string()));
        }
        self.owned_conversation(user, conversation_id).await?;
        self.store.rename_conversation(conversation_id, title).await
    }

    pub async fn delete_conversation(&self, user: &User, conversation_id: &str) -> ChatResult<()> {
        self.owned_conversation(user, conversation_id).await?;
        self.store.delete_conversation(conversation_id).await?;
        info!("User {} deleted conversation {}", user.id, conversation_id);
        Ok(())
    }

    // --- Messages ---

    pub async fn load_messages(
        &self,
        user: &User,
        conversation_id: &str,
        offset: usize,
        limit: Option<usize>
    ) -> ChatResult<MessagePage> {
        self.owned_conversation(user, conversation_id).await?;
        let limit = match limit {
            Some(0) | None => DEFAULT_PAGE_SIZE,
            Some(n) => n.min(MAX_PAGE_SIZE),
        };
        let messages = self.store.list_messages(conversation_id, offset, limit).await?;
        let has_more = messages.len() == limit;
        Ok(MessagePage { messages, offset, limit, has_more })
    }

    pub async fn delete_message(&self, user: &User, message_id: &str) -> ChatResult<()> {
        let message = self.store
            .get_message(message_id).await?
            .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
        self.owned_conversation(user, &message.conversation_id).await?;
        self.store.delete_message(message_id).await
    }

    /// Uploads and OCRs an attached image, returning the stored content and any notices.
    async fn image_content(
        &self,
        user: &User,
        text: &str,
        image: ImageAttachment
    ) -> ChatResult<(ImageContent, Vec<String>)> {
        if classify_upload(&image.file_name, None) != Some(UploadKind::Image) {
            return Err(
                ChatError::UnsupportedFile(
                    format!("'{}' is not a supported image", image.file_name)
                )
            );
        }
        let path = object_path(&user.id, &image.file_name);
        let content_type = content_type_for(&image.file_name);
        let ocr_result = self.ocr.recognize(&image.bytes).await;
        let url = self.objects.put(&path, image.bytes, content_type).await?;

        let mut notices = Vec::new();
        let ocr = match ocr_result {
            Ok(text) => text,
            Err(e) => {
                warn!("OCR failed for {}: {}", path, e);
                notices.push(OCR_NOTICE.to_string());
                String::new()
            }
        };
        Ok((ImageContent { text: text.to_string(), image: url, ocr }, notices))
    }

    async fn prepare_turn(
        &self,
        user: &User,
        conversation_id: &str,
        request: SendRequest
    ) -> ChatResult<PreparedTurn> {
        if request.text.trim().is_empty() && request.image.is_none() {
            return Err(ChatError::Validation("Message must not be empty".to_string()));
        }
        self.owned_conversation(user, conversation_id).await?;
        let (model, system_prompt) = {
            let profile = self.profile.read().await;
            (profile.resolve_model(request.model.as_deref())?, profile.system_prompt.clone())
        };

        let mut notices = Vec::new();
        let content = match request.image {
            Some(image) => {
                let (image_content, image_notices) = self.image_content(
                    user,
                    &request.text,
                    image
                ).await?;
                notices.extend(image_notices);
                MessageContent::Image(image_content)
            }
            None => MessageContent::Text(request.text),
        };
        let encoded = content.encode();
        debug!(
            "Sentiment score for new message in {}: {}",
            conversation_id,
            nlp::sentiment_score(content.text())
        );

        let prior = self.store.recent_messages(conversation_id, CONTEXT_TURNS).await?;
        let user_message = self.store.insert_message(
            NewMessage::new(conversation_id, Role::User, encoded)
        ).await?;

        let mut context: Vec<GatewayMessage> = Vec::new();
        if let Some(prompt) = system_prompt.filter(|p| !p.trim().is_empty()) {
            context.push(GatewayMessage::new(Role::System, prompt));
        }
        context.extend(context_window(&prior, &user_message).iter().map(GatewayMessage::from));

        Ok(PreparedTurn { user_message, context, model, notices })
    }

    async fn finish_turn(
        &self,
        turn: PreparedTurn,
        reply: Option<String>
    ) -> ChatResult<SendOutcome> {
        let mut notices = turn.notices;
        let reply = match reply {
            Some(text) => text,
            None => {
                notices.push(GATEWAY_NOTICE.to_string());
                self.profile.read().await.fallback_reply.clone()
            }
        };
        let assistant_message = self.store.insert_message(
            NewMessage::new(&turn.user_message.conversation_id, Role::Assistant, reply)
        ).await?;
        Ok(SendOutcome {
            user_message: turn.user_message,
            assistant_message,
            notices,
        })
    }

    /// Stores the user turn, forwards the context window to the gateway and stores the reply.
    /// A gateway failure is answered with the fallback reply plus a notice.
    pub async fn send_message(
        &self,
        user: &User,
        conversation_id: &str,
        request: SendRequest
    ) -> ChatResult<SendOutcome> {
        let turn = self.prepare_turn(user, conversation_id, request).await?;
        let reply = match self.chat_client.complete(&turn.context, turn.model.as_deref()).await {
            Ok(reply) if !reply.trim().is_empty() => Some(reply),
            Ok(_) => {
                warn!("Gateway returned an empty reply for conversation {}", conversation_id);
                None
            }
            Err(e) => {
                error!("Gateway error for conversation {}: {}", conversation_id, e);
                None
            }
        };
        self.finish_turn(turn, reply).await
    }

    /// Like `send_message`, but reports the stored user turn and each reply chunk on `events`
    /// as they happen.
    pub async fn send_message_stream(
        &self,
        user: &User,
        conversation_id: &str,
        request: SendRequest,
        events: mpsc::Sender<StreamEvent>
    ) -> ChatResult<SendOutcome> {
        let mut turn = self.prepare_turn(user, conversation_id, request).await?;
        // A closed receiver only means the client went away.
        let _ = events.send(StreamEvent::UserMessage(turn.user_message.clone())).await;

        let reply = match self.chat_client.complete_stream(&turn.context, turn.model.as_deref()).await {
            Ok(mut stream) => {
                let mut full = String::new();
                let mut failed = false;
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(token) => {
                            full.push_str(&token);
                            let _ = events.send(StreamEvent::Chunk(token)).await;
                        }
                        Err(e) => {
                            error!("Gateway stream error for conversation {}: {}", conversation_id, e);
                            failed = true;
                            break;
                        }
                    }
                }
                if full.trim().is_empty() {
                    warn!("Gateway stream for conversation {} produced no text", conversation_id);
                    None
                } else {
                    // Keep what arrived, but tell the user it was cut short.
                    if failed {
                        turn.notices.push(GATEWAY_NOTICE.to_string());
                    }
                    Some(full)
                }
            }
            Err(e) => {
                error!("Gateway error for conversation {}: {}", conversation_id, e);
                None
            }
        };
        self.finish_turn(turn, reply).await
    }

    // --- Ingestion ---

    pub async fn analyze_spreadsheet(&self, file_name: &str, bytes: Vec<u8>) -> ChatResult<SpreadsheetReport> {
        let name = file_name.to_string();
        let analysis = tokio::task
            ::spawn_blocking(move || spreadsheet::analyze(&name, &bytes)).await
            .map_err(|e| ChatError::Spreadsheet(format!("analysis task failed: {}", e)))??;
        info!(
            "Analysed spreadsheet {}: {} rows, {} columns",
            file_name,
            analysis.row_count,
            analysis.column_count
        );
        let prompt = analysis.to_prompt(file_name);
        Ok(SpreadsheetReport { analysis, prompt })
    }

    pub async fn extract_text(&self, image_bytes: &[u8]) -> ChatResult<String> {
        self.ocr.recognize(image_bytes).await
    }

    // --- Assistant profile ---

    pub async fn list_models(&self) -> ModelList {
        let profile = self.profile.read().await;
        let default_model = match &profile.default_model {
            Some(alias) => alias.clone(),
            None => {
                let id = self.chat_client.get_model();
                profile.alias_for(&id).map(str::to_string).unwrap_or(id)
            }
        };
        ModelList {
            models: profile.models.keys().cloned().collect(),
            default_model,
        }
    }

    /// Reloads the assistant profile from disk if it changed. Returns whether it was replaced.
    pub async fn reload_profile_if_changed(&self) -> ChatResult<bool> {
        let path = match &self.profile_path {
            Some(p) => p,
            None => {
                return Ok(false);
            }
        };
        let mut profile = self.profile.write().await;
        match assistant::reload_profile_if_changed(path, &profile)? {
            Some(fresh) => {
                *profile = fresh;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuth;
    use crate::history::MemoryStore;
    use crate::llm::chat::TokenStream;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Replies with a fixed text, or fails like an unreachable gateway when `reply` is `None`.
    struct ScriptedClient {
        reply: Option<String>,
        calls: Mutex<Vec<(Vec<GatewayMessage>, Option<String>)>>,
    }

    impl ScriptedClient {
        fn new(reply: Option<&str>) -> Arc<Self> {
            Arc::new(Self { reply: reply.map(str::to_string), calls: Mutex::new(Vec::new()) })
        }
    }

    #[async_trait]
    impl ChatClient for ScriptedClient {
        async fn complete(&self, messages: &[GatewayMessage], model: Option<&str>) -> ChatResult<String> {
            self.calls.lock().unwrap().push((messages.to_vec(), model.map(str::to_string)));
            self.reply.clone().ok_or_else(|| ChatError::Gateway("HTTP error! status: 500".to_string()))
        }

        async fn complete_stream(
            &self,
            messages: &[GatewayMessage],
            model: Option<&str>
        ) -> ChatResult<TokenStream> {
            let reply = self.complete(messages, model).await?;
            let (head, tail) = reply.split_at(reply.len() / 2);
            let chunks = vec![Ok(head.to_string()), Ok(tail.to_string())];
            Ok(Box::pin(futures::stream::iter(chunks)))
        }

        fn get_model(&self) -> String {
            "test-model".to_string()
        }

        fn get_base_url(&self) -> String {
            "http://gateway.test".to_string()
        }
    }

    struct FixedOcr(Option<&'static str>);

    #[async_trait]
    impl OcrEngine for FixedOcr {
        async fn recognize(&self, _image_bytes: &[u8]) -> ChatResult<String> {
            self.0.map(str::to_string).ok_or_else(|| ChatError::Ocr("engine unavailable".to_string()))
        }
    }

    #[derive(Default)]
    struct RecordingObjects {
        paths: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for RecordingObjects {
        async fn put(&self, path: &str, _bytes: Vec<u8>, _content_type: &str) -> ChatResult<String> {
            self.paths.lock().unwrap().push(path.to_string());
            Ok(format!("https://files.test/{}", path))
        }
    }

    async fn agent_with(client: Arc<ScriptedClient>, ocr: FixedOcr) -> (ChatAgent, User) {
        let auth = Arc::new(LocalAuth::new("test-secret"));
        let user = auth.sign_up("ada@example.com", "hunter22").await.unwrap();
        let agent = ChatAgent::with_components(
            Arc::new(MemoryStore::new()),
            auth,
            Arc::new(RecordingObjects::default()),
            Arc::new(ocr),
            client,
            AssistantProfile::default()
        );
        (agent, user)
    }

    fn text(t: &str) -> SendRequest {
        SendRequest { text: t.to_string(), ..Default::default() }
    }

    #[tokio::test]
    async fn new_chat_is_seeded_with_greeting() {
        let (agent, user) = agent_with(ScriptedClient::new(Some("hi")), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();
        assert_eq!(conversation.title, "New Chat");

        let page = agent.load_messages(&user, &conversation.id, 0, None).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert_eq!(page.messages[0].role, Role::Assistant);
        assert_eq!(page.messages[0].content, assistant::DEFAULT_GREETING);
        assert_eq!(page.limit, DEFAULT_PAGE_SIZE);
        assert!(!page.has_more);
    }

    #[tokio::test]
    async fn send_stores_both_turns_and_forwards_window() {
        let client = ScriptedClient::new(Some("Sure."));
        let (agent, user) = agent_with(client.clone(), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();
        for i in 0..3 {
            agent.send_message(&user, &conversation.id, text(&format!("q{}", i))).await.unwrap();
        }

        let outcome = agent.send_message(&user, &conversation.id, text("last")).await.unwrap();
        assert_eq!(outcome.user_message.content, "last");
        assert_eq!(outcome.assistant_message.content, "Sure.");
        assert!(outcome.notices.is_empty());

        let calls = client.calls.lock().unwrap();
        let (context, model) = calls.last().unwrap();
        assert_eq!(context.len(), CONTEXT_TURNS + 1);
        assert_eq!(context.last().unwrap().content, "last");
        assert_eq!(context.last().unwrap().role, "user");
        // No model named: the client's own configured model applies.
        assert_eq!(*model, None);

        let page = agent.load_messages(&user, &conversation.id, 0, Some(100)).await.unwrap();
        assert_eq!(page.messages.len(), 9);
    }

    #[tokio::test]
    async fn requested_alias_is_sent_as_gateway_id() {
        let client = ScriptedClient::new(Some("ok"));
        let (agent, user) = agent_with(client.clone(), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let request = SendRequest { model: Some("GPT-4".into()), ..text("hi") };
        agent.send_message(&user, &conversation.id, request).await.unwrap();
        assert_eq!(client.calls.lock().unwrap()[0].1.as_deref(), Some("openai/gpt-4"));

        let models = agent.list_models().await;
        assert_eq!(models.default_model, "test-model");
    }

    #[tokio::test]
    async fn empty_stream_falls_back_with_notice() {
        let (agent, user) = agent_with(ScriptedClient::new(Some("")), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let (tx, _rx) = mpsc::channel(8);
        let outcome = agent.send_message_stream(&user, &conversation.id, text("hello"), tx).await.unwrap();
        assert_eq!(outcome.assistant_message.content, assistant::DEFAULT_FALLBACK_REPLY);
        assert_eq!(outcome.notices, vec![GATEWAY_NOTICE.to_string()]);

        let outcome = agent.send_message(&user, &conversation.id, text("again")).await.unwrap();
        assert_eq!(outcome.assistant_message.content, assistant::DEFAULT_FALLBACK_REPLY);
        assert_eq!(outcome.notices, vec![GATEWAY_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn gateway_failure_stores_fallback_with_notice() {
        let (agent, user) = agent_with(ScriptedClient::new(None), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let outcome = agent.send_message(&user, &conversation.id, text("hello")).await.unwrap();
        assert_eq!(outcome.assistant_message.content, assistant::DEFAULT_FALLBACK_REPLY);
        assert_eq!(outcome.notices, vec![GATEWAY_NOTICE.to_string()]);
    }

    #[tokio::test]
    async fn empty_messages_and_unknown_models_are_rejected() {
        let client = ScriptedClient::new(Some("x"));
        let (agent, user) = agent_with(client.clone(), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let err = agent.send_message(&user, &conversation.id, text("   ")).await.unwrap_err();
        assert!(matches!(err, ChatError::Validation(_)));

        let request = SendRequest { model: Some("GPT-5".to_string()), ..text("hi") };
        let err = agent.send_message(&user, &conversation.id, request).await.unwrap_err();
        assert!(err.to_string().contains("Did you mean"));

        let page = agent.load_messages(&user, &conversation.id, 0, None).await.unwrap();
        assert_eq!(page.messages.len(), 1);
        assert!(client.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn image_turns_are_uploaded_and_flattened_for_the_gateway() {
        let client = ScriptedClient::new(Some("I see a receipt."));
        let (agent, user) = agent_with(client.clone(), FixedOcr(Some("TOTAL 42"))).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let request = SendRequest {
            text: "what is this?".to_string(),
            image: Some(ImageAttachment { file_name: "receipt.png".to_string(), bytes: vec![1, 2, 3] }),
            model: None,
        };
        let outcome = agent.send_message(&user, &conversation.id, request).await.unwrap();

        match MessageContent::parse(&outcome.user_message.content) {
            MessageContent::Image(image) => {
                assert_eq!(image.text, "what is this?");
                assert!(image.image.starts_with(&format!("https://files.test/{}/", user.id)));
                assert!(image.image.ends_with(".png"));
                assert_eq!(image.ocr, "TOTAL 42");
            }
            other => panic!("expected image content, got {:?}", other),
        }

        let calls = client.calls.lock().unwrap();
        let prompt = &calls[0].0.last().unwrap().content;
        assert!(prompt.starts_with("what is this?\n\n[Image: https://files.test/"));
        assert!(prompt.ends_with("[Extracted text]\nTOTAL 42"));
    }

    #[tokio::test]
    async fn ocr_failure_is_a_notice_and_non_images_are_refused() {
        let (agent, user) = agent_with(ScriptedClient::new(Some("ok")), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let request = SendRequest {
            image: Some(ImageAttachment { file_name: "photo.jpg".to_string(), bytes: vec![0] }),
            ..Default::default()
        };
        let outcome = agent.send_message(&user, &conversation.id, request).await.unwrap();
        assert_eq!(outcome.notices, vec![OCR_NOTICE.to_string()]);
        assert_eq!(outcome.assistant_message.content, "ok");
        match MessageContent::parse(&outcome.user_message.content) {
            MessageContent::Image(image) => {
                assert!(image.ocr.is_empty());
                assert!(image.image.ends_with(".jpg"));
            }
            other => panic!("expected an image turn, got {:?}", other),
        }

        let request = SendRequest {
            image: Some(ImageAttachment { file_name: "notes.txt".to_string(), bytes: vec![0] }),
            ..Default::default()
        };
        let err = agent.send_message(&user, &conversation.id, request).await.unwrap_err();
        assert!(matches!(err, ChatError::UnsupportedFile(_)));
    }

    #[tokio::test]
    async fn streaming_reports_user_turn_then_chunks() {
        let (agent, user) = agent_with(ScriptedClient::new(Some("Hello there")), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let outcome = agent
            .send_message_stream(&user, &conversation.id, text("hi"), tx).await
            .unwrap();
        assert_eq!(outcome.assistant_message.content, "Hello there");

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(&events[0], StreamEvent::UserMessage(m) if m.content == "hi"));
        let streamed: String = events[1..]
            .iter()
            .map(|e| match e {
                StreamEvent::Chunk(c) => c.as_str(),
                StreamEvent::UserMessage(_) => panic!("user turn reported twice"),
            })
            .collect();
        assert_eq!(streamed, "Hello there");
    }

    #[tokio::test]
    async fn other_users_conversations_are_invisible() {
        let (agent, owner) = agent_with(ScriptedClient::new(Some("x")), FixedOcr(None)).await;
        let intruder = agent.sign_up("eve@example.com", "password1").await.unwrap();
        let conversation = agent.start_new_chat(&owner).await.unwrap();

        let err = agent.load_messages(&intruder, &conversation.id, 0, None).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        let err = agent.delete_conversation(&intruder, &conversation.id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));

        let greeting = agent.load_messages(&owner, &conversation.id, 0, None).await.unwrap().messages;
        let err = agent.delete_message(&intruder, &greeting[0].id).await.unwrap_err();
        assert!(matches!(err, ChatError::NotFound(_)));
        assert!(agent.list_conversations(&intruder).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn rename_delete_and_paging() {
        let (agent, user) = agent_with(ScriptedClient::new(Some("x")), FixedOcr(None)).await;
        let conversation = agent.start_new_chat(&user).await.unwrap();

        let renamed = agent.rename_conversation(&user, &conversation.id, "  Budget  ").await.unwrap();
        assert_eq!(renamed.title, "Budget");
        assert!(matches!(
            agent.rename_conversation(&user, &conversation.id, " ").await,
            Err(ChatError::Validation(_))
        ));

        agent.send_message(&user, &conversation.id, text("a")).await.unwrap();
        let page = agent.load_messages(&user, &conversation.id, 0, Some(2)).await.unwrap();
        assert_eq!(page.messages.len(), 2);
        assert!(page.has_more);
        let page = agent.load_messages(&user, &conversation.id, 0, Some(500)).await.unwrap();
        assert_eq!(page.limit, MAX_PAGE_SIZE);

        agent.delete_message(&user, &page.messages[0].id).await.unwrap();
        let page = agent.load_messages(&user, &conversation.id, 0, None).await.unwrap();
        assert_eq!(page.messages.len(), 2);

        agent.delete_conversation(&user, &conversation.id).await.unwrap();
        assert!(agent.list_conversations(&user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn spreadsheets_are_analysed_off_thread() {
        let (agent, _) = agent_with(ScriptedClient::new(Some("x")), FixedOcr(None)).await;
        let csv = b"name,score\nann,3\nbob,5\n".to_vec();
        let report = agent.analyze_spreadsheet("scores.csv", csv).await.unwrap();
        assert_eq!(report.analysis.row_count, 2);
        assert!(report.prompt.contains("scores.csv"));
    }

    #[test]
    fn uploads_must_be_base64() {
        let upload = ImageUpload { file_name: "a.png".into(), data: "aGk=".into() };
        assert_eq!(ImageAttachment::from_upload(&upload).unwrap().bytes, b"hi");
        let upload = ImageUpload { file_name: "a.png".into(), data: "***".into() };
        assert!(matches!(ImageAttachment::from_upload(&upload), Err(ChatError::Validation(_))));
    }
}
