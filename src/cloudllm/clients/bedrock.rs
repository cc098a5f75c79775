//! AWS Bedrock Converse/ConverseStream facade (§4.5 tool-results-as-content-blocks-on-a-user-
//! message path, §4.6 "Bedrock's Converse stream ... collapses into Shape B").
//!
//! Two things set Bedrock apart from every other facade here. First, authentication flows
//! through the standard AWS credential chain (env vars, IAM role, `~/.aws/credentials`) rather
//! than an `api_key`, so its configuration surface (`BedrockConfig`) is narrower than
//! [`super::common::ProviderConfig`] (§6). Second, its vision-attachment path is strict: an
//! oversized or unresolvable image fails the whole turn before the stream opens, rather than
//! being silently dropped like every other vendor (§7, Seed Scenario 6) — grounded in the 20 MiB
//! cap `crate::cloudllm::attachment::DEFAULT_MAX_BYTES` already names as "the concrete value used
//! for the Bedrock path".
//!
//! Message and schema conversion are grounded in the `BSteffaniak-crime-map` example's
//! `providers/bedrock.rs`, generalized from its single-shot `converse()` call to the streaming
//! `converse_stream()` API and from its fixed `ConversationRole::{User,Assistant}` match to the
//! full tagged-union role set this core supports.

use aws_sdk_bedrockruntime::primitives::Blob;
use aws_sdk_bedrockruntime::types::{
    ContentBlock, ContentBlockDelta, ContentBlockStart, ConversationRole,
    ConverseStreamOutput as BedrockEvent, ImageBlock, ImageFormat, ImageSource,
    Message as BedrockMessage, StopReason as BedrockStopReason, SystemContentBlock, Tool as BedrockTool,
    ToolConfiguration, ToolInputSchema, ToolResultBlock, ToolResultContentBlock, ToolResultStatus,
    ToolSpecification, ToolUseBlock,
};
use aws_smithy_types::Document;
use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::cloudllm::attachment::{self, DEFAULT_MAX_BYTES};
use crate::cloudllm::completion::{
    ChunkError, CompletionChunk, CompletionMessage, CompletionRequest, Role, ToolDefinition,
};
use crate::cloudllm::decode::shape_b::ShapeBDecoder;
use crate::cloudllm::error::{FailoverReason, ProviderError};
use crate::cloudllm::provider::{ChunkStream, CompletionProvider, Model};
use crate::cloudllm::retry::{self, RetryOutcome};
use crate::cloudllm::tool_schema;

use super::common::CHUNK_CHANNEL_CAPACITY;

const DEFAULT_REGION: &str = "us-east-1";

/// Bedrock's configuration surface: a region instead of a base URL, and no `api_key` since
/// credentials come from the AWS SDK's default chain (§6).
#[derive(Debug, Clone)]
pub struct BedrockConfig {
    pub region: String,
    pub default_model: Option<String>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl BedrockConfig {
    pub fn new() -> Self {
        BedrockConfig {
            region: DEFAULT_REGION.to_string(),
            default_model: None,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_default_model(mut self, model: impl Into<String>) -> Self {
        self.default_model = Some(model.into());
        self
    }

    /// Values `<= 0` coerce to the default of 3 (§6).
    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = if max_retries <= 0 { 3 } else { max_retries as u32 };
        self
    }

    /// Values `<= 0` coerce to the default of 1 second (§6).
    pub fn with_retry_delay_ms(mut self, retry_delay_ms: i64) -> Self {
        self.retry_delay = if retry_delay_ms <= 0 {
            Duration::from_secs(1)
        } else {
            Duration::from_millis(retry_delay_ms as u64)
        };
        self
    }

    fn retry_config(&self) -> crate::cloudllm::retry::RetryConfig {
        crate::cloudllm::retry::RetryConfig::new(self.max_retries, self.retry_delay)
    }
}

impl Default for BedrockConfig {
    fn default() -> Self {
        BedrockConfig::new()
    }
}

pub struct BedrockProvider {
    client: aws_sdk_bedrockruntime::Client,
    config: BedrockConfig,
}

impl BedrockProvider {
    /// Loads AWS configuration from the environment (region, credential chain) and builds the
    /// underlying SDK client once, up front.
    pub async fn new(config: BedrockConfig) -> Self {
        let aws_config = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;
        let client = aws_sdk_bedrockruntime::Client::new(&aws_config);
        BedrockProvider { client, config }
    }

    fn resolve_model(&self, request: &CompletionRequest) -> Result<String, ProviderError> {
        if !request.model.is_empty() {
            return Ok(request.model.clone());
        }
        self.config
            .default_model
            .clone()
            .ok_or_else(|| invalid_request("bedrock", "", "no model specified and no default model configured"))
    }
}

fn invalid_request(provider: &str, model: &str, message: impl Into<String>) -> ProviderError {
    ProviderError {
        provider: provider.to_string(),
        model: model.to_string(),
        status: None,
        code: None,
        message: message.into(),
        request_id: None,
        reason: FailoverReason::InvalidRequest,
        cause: None,
    }
}

#[async_trait]
impl CompletionProvider for BedrockProvider {
    fn name(&self) -> &str {
        "bedrock"
    }

    fn models(&self) -> Vec<Model> {
        vec![
            Model {
                id: "anthropic.claude-sonnet-4-5-20250929-v1:0".into(),
                name: "Claude Sonnet 4.5 (Bedrock)".into(),
                context_size: 200_000,
                supports_vision: true,
            },
            Model {
                id: "meta.llama3-1-70b-instruct-v1:0".into(),
                name: "Llama 3.1 70B Instruct (Bedrock)".into(),
                context_size: 128_000,
                supports_vision: false,
            },
        ]
    }

    fn supports_tools(&self) -> bool {
        true
    }

    async fn complete(
        &self,
        cancel: CancellationToken,
        request: CompletionRequest,
    ) -> Result<ChunkStream, ProviderError> {
        let model = self.resolve_model(&request)?;

        let resolved_images = resolve_images_strict(&request, "bedrock", &model).await?;
        let messages = convert_messages_bedrock(&request, &resolved_images)?;
        let system = system_content_blocks(&request);
        let tool_config = request
            .tools
            .as_ref()
            .filter(|t| !t.is_empty())
            .map(|tools| build_tool_config(tools));

        let mut call = self
            .client
            .converse_stream()
            .model_id(&model)
            .set_system(if system.is_empty() { None } else { Some(system) })
            .set_messages(Some(messages));
        if let Some(tool_config) = tool_config {
            call = call.tool_config(tool_config);
        }

        let retry_config = self.config.retry_config();
        let provider = self.name().to_string();

        let (tx, rx) = mpsc::channel(CHUNK_CHANNEL_CAPACITY);
        tokio::spawn(run_producer(provider, model, cancel, call, retry_config, tx));

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

/// Resolves every image attachment up front, failing the whole turn (before stream open) rather
/// than silently dropping the offending attachment like the OpenAI/Anthropic/Gemini paths do
/// (§7, Seed Scenario 6).
async fn resolve_images_strict(
    request: &CompletionRequest,
    provider: &str,
    model: &str,
) -> Result<Vec<(String, Vec<u8>, String)>, ProviderError> {
    let client = super::common::shared_http_client();
    let mut resolved = Vec::new();
    for msg in &request.messages {
        for att in &msg.attachments {
            if att.kind != "image" {
                continue;
            }
            let r = attachment::resolve(att, client, DEFAULT_MAX_BYTES).await.map_err(|e| {
                ProviderError::from_cause(provider, model, Some(Box::new(e))).with_code("attachment_rejected")
            })?;
            resolved.push((att.url.clone(), r.bytes, r.mime_type));
        }
    }
    Ok(resolved)
}

fn find_resolved<'a>(url: &str, images: &'a [(String, Vec<u8>, String)]) -> Option<&'a (String, Vec<u8>, String)> {
    images.iter().find(|(u, _, _)| u == url)
}

fn image_format(mime: &str) -> Option<ImageFormat> {
    match mime {
        "image/png" => Some(ImageFormat::Png),
        "image/jpeg" => Some(ImageFormat::Jpeg),
        "image/gif" => Some(ImageFormat::Gif),
        "image/webp" => Some(ImageFormat::Webp),
        _ => None,
    }
}

fn system_content_blocks(request: &CompletionRequest) -> Vec<SystemContentBlock> {
    super::common::system_prompt_text(request)
        .into_iter()
        .map(SystemContentBlock::Text)
        .collect()
}

fn convert_messages_bedrock(
    request: &CompletionRequest,
    images: &[(String, Vec<u8>, String)],
) -> Result<Vec<BedrockMessage>, ProviderError> {
    let mut out = Vec::new();

    for msg in &request.messages {
        match msg.role {
            Role::System => continue,
            Role::User => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(build_message(ConversationRole::User, user_content_blocks(msg, images))?);
            }
            Role::Assistant => {
                if msg.is_empty_turn() {
                    continue;
                }
                out.push(build_message(ConversationRole::Assistant, assistant_content_blocks(msg))?);
            }
            Role::Tool => {
                if msg.tool_results.is_empty() {
                    continue;
                }
                out.push(build_message(ConversationRole::User, tool_result_content_blocks(msg))?);
            }
        }
    }

    Ok(out)
}

fn build_message(role: ConversationRole, content: Vec<ContentBlock>) -> Result<BedrockMessage, ProviderError> {
    BedrockMessage::builder()
        .role(role)
        .set_content(Some(content))
        .build()
        .map_err(|e| invalid_request("bedrock", "", format!("failed to build Bedrock message: {}", e)))
}

fn user_content_blocks(msg: &CompletionMessage, images: &[(String, Vec<u8>, String)]) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if !msg.content.is_empty() {
        blocks.push(ContentBlock::Text(msg.content.clone()));
    }
    for att in &msg.attachments {
        if att.kind != "image" {
            continue;
        }
        if let Some((_, bytes, mime)) = find_resolved(&att.url, images) {
            if let Some(format) = image_format(mime) {
                if let Ok(image) = ImageBlock::builder()
                    .format(format)
                    .source(ImageSource::Bytes(Blob::new(bytes.clone())))
                    .build()
                {
                    blocks.push(ContentBlock::Image(image));
                }
            }
        }
    }
    blocks
}

fn assistant_content_blocks(msg: &CompletionMessage) -> Vec<ContentBlock> {
    let mut blocks = Vec::new();
    if !msg.content.is_empty() {
        blocks.push(ContentBlock::Text(msg.content.clone()));
    }
    for call in &msg.tool_calls {
        let doc = json_to_document(&call.input);
        if let Ok(tool_use) = ToolUseBlock::builder()
            .tool_use_id(&call.id)
            .name(&call.name)
            .input(doc)
            .build()
        {
            blocks.push(ContentBlock::ToolUse(tool_use));
        }
    }
    blocks
}

fn tool_result_content_blocks(msg: &CompletionMessage) -> Vec<ContentBlock> {
    msg.tool_results
        .iter()
        .filter_map(|result| {
            let mut content = vec![ToolResultContentBlock::Text(result.content.clone())];
            for image in &result.images {
                if let Ok(bytes) = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, &image.data_base64) {
                    if let Some(format) = image_format(&image.mime_type) {
                        if let Ok(block) = ImageBlock::builder()
                            .format(format)
                            .source(ImageSource::Bytes(Blob::new(bytes)))
                            .build()
                        {
                            content.push(ToolResultContentBlock::Image(block));
                        }
                    }
                }
            }
            let status = if result.is_error { ToolResultStatus::Error } else { ToolResultStatus::Success };
            ToolResultBlock::builder()
                .tool_use_id(&result.tool_call_id)
                .set_content(Some(content))
                .status(status)
                .build()
                .ok()
                .map(ContentBlock::ToolResult)
        })
        .collect()
}

fn build_tool_config(tools: &[ToolDefinition]) -> ToolConfiguration {
    let bedrock_tools: Vec<BedrockTool> = tools
        .iter()
        .filter_map(|tool| {
            let rendered = tool_schema::to_bedrock(tool);
            let schema_json = &rendered["toolSpec"]["inputSchema"]["json"];
            let spec = ToolSpecification::builder()
                .name(&tool.name)
                .description(&tool.description)
                .input_schema(ToolInputSchema::Json(json_to_document(schema_json)))
                .build()
                .ok()?;
            Some(BedrockTool::ToolSpec(spec))
        })
        .collect();

    ToolConfiguration::builder()
        .set_tools(Some(bedrock_tools))
        .build()
        .unwrap_or_else(|_| ToolConfiguration::builder().build().expect("empty ToolConfiguration always builds"))
}

/// Converts a `serde_json::Value` into an `aws_smithy_types::Document` so a tool's JSON-Schema
/// bytes can be passed through to Bedrock verbatim (§4.3 "schema passed through as a lazy JSON
/// document").
fn json_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(b) => Document::Bool(*b),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Document::Number(aws_smithy_types::Number::NegInt(i))
            } else if let Some(u) = n.as_u64() {
                Document::Number(aws_smithy_types::Number::PosInt(u))
            } else if let Some(f) = n.as_f64() {
                Document::Number(aws_smithy_types::Number::Float(f))
            } else {
                Document::Null
            }
        }
        Value::String(s) => Document::String(s.clone()),
        Value::Array(arr) => Document::Array(arr.iter().map(json_to_document).collect()),
        Value::Object(map) => {
            Document::Object(map.iter().map(|(k, v)| (k.clone(), json_to_document(v))).collect())
        }
    }
}


type ConverseStreamFluentBuilder = aws_sdk_bedrockruntime::operation::converse_stream::builders::ConverseStreamFluentBuilder;

async fn run_producer(
    provider: String,
    model: String,
    cancel: CancellationToken,
    call: ConverseStreamFluentBuilder,
    retry_config: crate::cloudllm::retry::RetryConfig,
    tx: mpsc::Sender<CompletionChunk>,
) {
    let open_result = retry::retry(
        &retry_config,
        &cancel,
        |err: &ProviderError| err.is_retryable(),
        |_attempt| {
            let call = call.clone();
            let provider = provider.clone();
            let model = model.clone();
            async move {
                call.send().await.map_err(|e| classify_sdk_error(&provider, &model, &e))
            }
        },
    )
    .await;

    let output = match open_result {
        Ok(output) => output,
        Err(RetryOutcome::Failed(err)) => {
            let _ = tx.send(CompletionChunk::Error { error: ChunkError::Provider(err) }).await;
            return;
        }
        Err(RetryOutcome::Cancelled) => {
            let _ = tx.send(CompletionChunk::Error { error: ChunkError::Cancelled }).await;
            return;
        }
    };

    let mut decoder = ShapeBDecoder::new();
    let mut stream = output.stream;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = tx.send(CompletionChunk::Error { error: ChunkError::Cancelled }).await;
                return;
            }
            next = stream.recv() => {
                match next {
                    Ok(None) => {
                        for chunk in decoder.finalize_on_eof() {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }
                    Ok(Some(event)) => {
                        let chunks = handle_event(&mut decoder, &event);
                        for chunk in chunks {
                            if tx.send(chunk).await.is_err() {
                                return;
                            }
                        }
                        if decoder.is_done() {
                            return;
                        }
                    }
                    Err(e) => {
                        let err = ProviderError::from_cause(&provider, &model, Some(Box::new(e)));
                        let _ = tx.send(CompletionChunk::Error { error: ChunkError::Provider(err) }).await;
                        return;
                    }
                }
            }
        }
    }
}

/// Collapses Bedrock's typed `ConverseStream` events into [`ShapeBDecoder`] calls per §4.6:
/// content-block-start(tool_use) opens a builder, content-block-delta appends text or tool-use
/// argument fragments, content-block-stop finalizes, message-stop ends the turn.
fn handle_event(decoder: &mut ShapeBDecoder, event: &BedrockEvent) -> Vec<CompletionChunk> {
    match event {
        BedrockEvent::ContentBlockStart(e) => {
            let index = e.content_block_index() as usize;
            if let Some(ContentBlockStart::ToolUse(tool_use)) = e.start() {
                decoder.handle_tool_call_delta(index, Some(tool_use.tool_use_id()), Some(tool_use.name()), None);
            }
            Vec::new()
        }
        BedrockEvent::ContentBlockDelta(e) => {
            let index = e.content_block_index() as usize;
            match e.delta() {
                Some(ContentBlockDelta::Text(text)) => decoder
                    .handle_text_delta(text)
                    .into_iter()
                    .collect(),
                Some(ContentBlockDelta::ToolUse(tool_use)) => {
                    decoder.handle_tool_call_delta(index, None, None, Some(tool_use.input()));
                    Vec::new()
                }
                _ => Vec::new(),
            }
        }
        BedrockEvent::ContentBlockStop(_) => Vec::new(),
        BedrockEvent::MessageStart(_) => Vec::new(),
        BedrockEvent::MessageStop(e) => {
            let reason = match e.stop_reason() {
                BedrockStopReason::ToolUse => "tool_calls",
                _ => "stop",
            };
            decoder.handle_finish_reason(reason)
        }
        BedrockEvent::Metadata(e) => {
            if let Some(usage) = e.usage() {
                decoder.handle_usage(Some(usage.input_tokens() as u64), Some(usage.output_tokens() as u64));
            }
            Vec::new()
        }
        _ => Vec::new(),
    }
}

fn classify_sdk_error<E, R>(provider: &str, model: &str, err: &aws_smithy_runtime_api::client::result::SdkError<E, R>) -> ProviderError
where
    E: std::error::Error,
{
    let message = err.to_string();
    let status = match err {
        aws_smithy_runtime_api::client::result::SdkError::ServiceError(se) => {
            Some(se.raw().status().as_u16())
        }
        _ => None,
    };
    match status {
        Some(status) => ProviderError::from_status(provider, model, status, message),
        None => ProviderError::from_cause(provider, model, Some(Box::new(std::io::Error::new(std::io::ErrorKind::Other, message)))),
    }
}
