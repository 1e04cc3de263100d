//! Chat completions (`chat/*`).
//!
//! A completion streams `chat/progress-update` chunks from its own task and
//! ends with exactly one `chat/completion-result`. Providers sit behind
//! [`CompletionProvider`]; the built-in one speaks the OpenAI-compatible
//! streaming chat API over a blocking reqwest client.

use std::io::{BufRead, BufReader};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use sqlbridge_config::chat::{env_var_name, get_api_key};
use sqlbridge_config::{ChatProvider, ChatSettings};
use sqlbridge_engine::ObjectKind;
use sqlbridge_protocol::chat::{
    CompletionRequestParams, CompletionResultParams, DisposeParams, ProgressUpdateParams,
};
use sqlbridge_protocol::connection::ConnectionPurpose;
use sqlbridge_protocol::{methods, EmptyResult};

use crate::dispatcher::{Outbound, RequestContext};
use crate::error::HostError;
use crate::provider::{ProviderError, Service, ServiceProvider};
use crate::services::connection::{self, ConnectionService};
use crate::services::resolve;
use crate::session::SessionMap;
use crate::task::{spawn_task, CancellationToken};

pub const SERVICE_NAME: &str = "chat";

const COMPLETION_TASK: &str = "completion";

const SYSTEM_PROMPT: &str = "You are a database assistant inside a SQL editor. \
Answer concisely. When you write SQL, put it in a fenced code block.";

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("chat is not configured")]
    NotConfigured,

    #[error("API key not configured; set {0}")]
    MissingKey(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("failed to parse response: {0}")]
    Parse(String),

    #[error("completion cancelled")]
    Cancelled,

    #[error("{0}")]
    Unavailable(String),
}

pub trait CompletionProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Run one completion, handing each streamed chunk to `on_chunk`.
    /// Returns the full text.
    fn complete(
        &self,
        prompt: &str,
        token: &CancellationToken,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, ChatError>;
}

// =============================================================================
// OpenAI-compatible provider
// =============================================================================

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// One server-sent-events line of a streamed completion.
#[derive(Debug, PartialEq)]
pub enum SseLine {
    Delta(String),
    Done,
    Skip,
}

pub fn parse_sse_line(line: &str) -> Result<SseLine, ChatError> {
    let Some(data) = line.trim().strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }
    let chunk: StreamChunk = serde_json::from_str(data).map_err(|e| ChatError::Parse(e.to_string()))?;
    let text: String = chunk
        .choices
        .into_iter()
        .filter_map(|c| c.delta.content)
        .collect();
    Ok(if text.is_empty() {
        SseLine::Skip
    } else {
        SseLine::Delta(text)
    })
}

pub struct OpenAiProvider {
    http: reqwest::blocking::Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
}

impl OpenAiProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Result<Self, ChatError> {
        let http = reqwest::blocking::Client::builder()
            .user_agent(format!("sqlbridge/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| ChatError::Network(e.to_string()))?;
        Ok(Self {
            http,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: model.into(),
            max_tokens,
        })
    }
}

impl CompletionProvider for OpenAiProvider {
    fn name(&self) -> &str {
        ChatProvider::OpenAI.as_str()
    }

    fn complete(
        &self,
        prompt: &str,
        token: &CancellationToken,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<String, ChatError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            max_tokens: self.max_tokens,
            stream: true,
        };

        let response = self
            .http
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .map_err(|e| ChatError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            let message = serde_json::from_str::<ApiErrorBody>(&text)
                .map(|body| body.error.message)
                .unwrap_or(text);
            return Err(ChatError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let mut content = String::new();
        for line in BufReader::new(response).lines() {
            if token.is_cancelled() {
                return Err(ChatError::Cancelled);
            }
            let line = line.map_err(|e| ChatError::Network(e.to_string()))?;
            match parse_sse_line(&line)? {
                SseLine::Delta(text) => {
                    on_chunk(&text);
                    content.push_str(&text);
                }
                SseLine::Done => break,
                SseLine::Skip => {}
            }
        }
        Ok(content)
    }
}

// =============================================================================
// Service
// =============================================================================

#[derive(Default)]
pub struct Conversation {
    turns: usize,
}

pub struct ChatService {
    /// The provider, or why there is none.
    provider: Result<Arc<dyn CompletionProvider>, String>,
    conversations: SessionMap<Conversation>,
    connections: OnceLock<Arc<ConnectionService>>,
}

impl ChatService {
    pub fn new(provider: Result<Arc<dyn CompletionProvider>, String>) -> Self {
        Self {
            provider,
            conversations: SessionMap::new(SERVICE_NAME),
            connections: OnceLock::new(),
        }
    }

    pub fn with_provider(provider: Arc<dyn CompletionProvider>) -> Self {
        Self::new(Ok(provider))
    }

    /// Provider from the `[chat]` settings and the key environment variable.
    pub fn from_settings(settings: &ChatSettings) -> Self {
        Self::new(Self::provider_from_settings(settings).map_err(|e| e.to_string()))
    }

    fn provider_from_settings(settings: &ChatSettings) -> Result<Arc<dyn CompletionProvider>, ChatError> {
        match settings.provider {
            ChatProvider::None => Err(ChatError::NotConfigured),
            ChatProvider::OpenAI => {
                let name = settings.provider.as_str();
                let key = get_api_key(name)
                    .key
                    .ok_or_else(|| ChatError::MissingKey(env_var_name(name)))?;
                let provider = OpenAiProvider::new(
                    settings.effective_endpoint(),
                    key,
                    settings.effective_model(),
                    settings.max_tokens,
                )?;
                log::info!("Chat provider: {} ({})", name, settings.effective_model());
                Ok(Arc::new(provider))
            }
        }
    }

    pub fn turns(&self, conversation_uri: &str) -> usize {
        self.conversations
            .with(conversation_uri, |c| c.turns)
            .unwrap_or(0)
    }

    pub fn conversation_count(&self) -> usize {
        self.conversations.len()
    }

    /// Drop a conversation. A running completion is cancelled and still
    /// ends with its `completion-result`. Unknown conversations are ignored.
    fn dispose(&self, conversation_uri: &str) -> EmptyResult {
        if let Ok(true) = self.conversations.cancel_task(conversation_uri, COMPLETION_TASK) {
            log::debug!("Cancelled running completion of '{}'", conversation_uri);
        }
        let _ = self.conversations.remove(conversation_uri);
        EmptyResult {}
    }

    /// Table names of the owner's database, when it is connected.
    fn schema_context(&self, owner_uri: &str) -> Option<String> {
        let connections = resolve(&self.connections).ok()?;
        let driver = connections.get_connection(owner_uri, ConnectionPurpose::Chat).ok()?;
        let objects = match driver.catalog().list_objects() {
            Ok(objects) => objects,
            Err(e) => {
                log::debug!("No schema context for '{}': {}", owner_uri, e);
                return None;
            }
        };
        let tables: Vec<String> = objects
            .iter()
            .filter(|o| o.kind == ObjectKind::Table)
            .map(|o| o.object.qualified())
            .collect();
        if tables.is_empty() {
            None
        } else {
            Some(format!("Tables in the connected database: {}", tables.join(", ")))
        }
    }

    fn result(outbound: &Outbound, conversation_uri: String, content: String, error_message: Option<String>) {
        outbound.notify(
            methods::CHAT_COMPLETION_RESULT,
            &CompletionResultParams {
                conversation_uri,
                content,
                is_complete: true,
                error_message,
            },
        );
    }

    fn handle_completion(self: &Arc<Self>, ctx: RequestContext, params: CompletionRequestParams) {
        let CompletionRequestParams {
            conversation_uri,
            prompt,
            owner_uri,
        } = params;
        self.conversations.ensure(&conversation_uri, Conversation::default);
        let ticket = match self.conversations.begin_task(&conversation_uri, COMPLETION_TASK) {
            Ok(ticket) => ticket,
            Err(e) => return ctx.send_error(e),
        };
        let outbound = ctx.outbound().clone();
        ctx.send_result(EmptyResult {});

        let service = self.clone();
        let token = ticket.token.clone();
        let (fault_service, fault_ticket, fault_outbound, fault_uri) =
            (self.clone(), ticket.clone(), outbound.clone(), conversation_uri.clone());
        // A task that cannot start is reported through its fault handler.
        let _ = spawn_task(
            "chat/completion",
            token,
            move |token| {
                let outcome = match &service.provider {
                    Ok(provider) => {
                        let prompt = match owner_uri.as_deref().and_then(|o| service.schema_context(o)) {
                            Some(context) => format!("{}\n\n{}", context, prompt),
                            None => prompt,
                        };
                        let uri = conversation_uri.clone();
                        let progress = outbound.clone();
                        provider.complete(&prompt, token, &mut |chunk: &str| {
                            progress.notify(
                                methods::CHAT_PROGRESS_UPDATE,
                                &ProgressUpdateParams {
                                    conversation_uri: uri.clone(),
                                    content: chunk.to_string(),
                                },
                            )
                        })
                    }
                    Err(reason) => Err(ChatError::Unavailable(reason.clone())),
                };

                service.conversations.finish_task(&ticket, |c| c.turns += 1);
                match outcome {
                    Ok(content) => Self::result(&outbound, conversation_uri, content, None),
                    Err(e) => {
                        log::warn!("Chat completion for '{}' failed: {}", conversation_uri, e);
                        Self::result(&outbound, conversation_uri, String::new(), Some(e.to_string()))
                    }
                }
            },
            move |message| {
                fault_service.conversations.finish_task(&fault_ticket, |_| {});
                Self::result(&fault_outbound, fault_uri, String::new(), Some(format!("internal error: {}", message)));
            },
        );
    }
}

impl Service for ChatService {
    fn name(&self) -> &'static str {
        SERVICE_NAME
    }

    fn register(self: Arc<Self>, provider: &mut ServiceProvider) -> Result<(), ProviderError> {
        let connections = provider.get::<ConnectionService>(connection::SERVICE_NAME)?;
        let _ = self.connections.set(connections);

        let service = self.clone();
        provider.routes()?.on_request(
            methods::CHAT_COMPLETION_REQUEST,
            move |ctx, params: CompletionRequestParams| service.handle_completion(ctx, params),
        )?;

        let service = self.clone();
        provider.routes()?.on_request(methods::CHAT_DISPOSE, move |ctx, params: DisposeParams| {
            ctx.send_result(service.dispose(&params.conversation_uri))
        })?;
        Ok(())
    }

    fn shutdown(&self) -> Result<(), HostError> {
        self.conversations.drain();
        Ok(())
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn std::any::Any + Send + Sync> {
        self
    }
}
