//! HTTP API (skeleton -> minimal JSON + SSE)

use std::sync::{Arc, Mutex as StdMutex};

use axum::{
    extract::State,
    response::{sse::{Event, Sse}, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use axum::extract::ws::{WebSocketUpgrade, Message};
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, Histogram, TextEncoder};
use runner_backend::device::{ComputeBackend, SimulatedDevice};
use runner_backend::{mock::MockBackend, InferenceBackend};
use runner_backend_llamacpp::LlamaCppBackend;
use runner_core::chat_template::{self, ChatTemplateKind};
use runner_core::generator::{generate_sync, BackendDetokenizer};
use runner_core::manifest::{InferencePresetSpec, Manifest, OptimizationsSpec, RopeScalingType, TokenizerSpec};
use runner_core::options::GenerationOptions;
use runner_core::pipeline::Pipeline;
use runner_common::Result;
use tokio_stream::{wrappers::ReceiverStream, StreamExt as _};
use runner_obs::{init as obs_init, spawn_gpu_polling};

#[derive(Clone)]
pub struct AppState {
    backend: Arc<dyn InferenceBackend>,
    pipeline: Arc<StdMutex<Pipeline>>,
    requests_total: IntCounter,
    tokens_generated_total: IntCounter,
    ttft_seconds: Histogram,
    limiter: RateLimiter,
    budgets: TokenBudgets,
    model_path: Arc<tokio::sync::RwLock<Option<String>>>,
}

static ENCODER: Lazy<TextEncoder> = Lazy::new(|| TextEncoder::new());

fn demo_manifest() -> Manifest {
    Manifest {
        model_id: "demo".into(),
        architecture: "demo".into(),
        num_layers: 4,
        hidden_size: 64,
        num_heads: 8,
        num_kv_heads: 8,
        head_dim: 8,
        intermediate_size: 256,
        vocab_size: 256,
        max_seq_len: 4096,
        rope_theta: 10000.0,
        rope_scale: 1.0,
        rope_scaling_type: RopeScalingType::None,
        rope_local_theta: None,
        rms_norm_eps: 1e-5,
        stop_token_ids: vec![0],
        tokenizer: TokenizerSpec { kind: "byte".into(), vocab_size: Some(256) },
        quantization: None,
        shards: vec![],
        optimizations: OptimizationsSpec::default(),
        inference: InferencePresetSpec::default(),
        scale_embeddings: false,
        final_logit_softcapping: None,
        use_tied_embeddings: false,
        use_moe: false,
    }
}

pub fn app() -> Router {
    let backend: Arc<dyn InferenceBackend> = select_backend();
    obs_init();
    spawn_gpu_polling();

    let device: Arc<dyn ComputeBackend> = Arc::new(SimulatedDevice::new(64, 256, 4));
    let mut pipeline = Pipeline::new(device);
    pipeline
        .load_model(&demo_manifest(), &runner_common::config::KvCacheConfig::default())
        .expect("demo model loads");
    let pipeline = Arc::new(StdMutex::new(pipeline));

    let state = AppState {
        backend,
        pipeline,
        requests_total: prometheus::register_int_counter!(
            "runner_requests_total",
            "Total number of /generate requests"
        )
        .expect("counter"),
        tokens_generated_total: prometheus::register_int_counter!(
            "runner_tokens_generated_total",
            "Total output tokens (approx)"
        )
        .expect("counter"),
        ttft_seconds: prometheus::register_histogram!(
            "runner_ttft_seconds",
            "Time to first token (approx for mock)"
        )
        .expect("histogram"),
        limiter: RateLimiter::new(),
        budgets: TokenBudgets::new(),
        model_path: Arc::new(tokio::sync::RwLock::new(None)),
    };

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/generate", post(generate))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/sse/generate", get(generate_sse))
        .route("/ws/generate", get(ws_generate))
        .route("/admin/set_model", post(admin_set_model))
        .route("/openapi.json", get(openapi))
        .with_state(state)
}

fn select_backend() -> Arc<dyn InferenceBackend> {
    // Try llama backend first if model path is provided
    if let Ok(model_path) = std::env::var("RUNNER_MODEL") {
        let llama = LlamaCppBackend::new();
        // ignore params for now
        if llama.load_model(&model_path, runner_backend::LoadParams::default()).is_ok() {
            tracing::info!(target: "api", "using llama.cpp backend with model {}", model_path);
            return Arc::new(llama);
        } else {
            tracing::warn!(target: "api", "failed to init llama backend, falling back to mock");
        }
    }
    Arc::new(MockBackend::new())
}

async fn metrics() -> impl IntoResponse {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    ENCODER.encode(&metric_families, &mut buffer).unwrap();
    ([("content-type", ENCODER.format_type().to_string())], buffer)
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let has_model = state.model_path.read().await.is_some();
    let loaded = state.pipeline.lock().unwrap().is_loaded();
    if loaded { ([("content-type", "text/plain")], if has_model { "ready" } else { "ready-no-model" }) }
    else { ([("content-type", "text/plain")], "not-ready") }
}

/// Tokenizes `prompt`, runs it through the pipeline to completion, and joins
/// the produced pieces back into text. Shared by `/generate` and
/// `/v1/chat/completions` — the two differ only in how they arrive at
/// `prompt` and `opts`.
fn run_prompt_to_completion(state: &AppState, prompt: &str, opts: GenerationOptions) -> Result<String> {
    let tokens = state.backend.tokenize(prompt)?;
    let detok = BackendDetokenizer(&*state.backend);
    let mut pipeline = state.pipeline.lock().unwrap();
    let pieces = generate_sync(&mut pipeline, &detok, &tokens, opts)?;
    let mut text = String::new();
    for piece in pieces {
        text.push_str(&piece?.text);
    }
    Ok(text)
}

#[derive(serde::Deserialize)]
struct GenerateRequest {
    prompt: String,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct GenerateResponse { text: String }

async fn generate(State(state): State<AppState>, Json(req): Json<GenerateRequest>) -> Json<GenerateResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await { return Json(GenerateResponse { text: String::from("RATE_LIMITED") }); }
    tracing::info!(target: "api", "generate request");
    let start = std::time::Instant::now();

    let mut opts = GenerationOptions::default();
    opts.max_tokens = req.max_tokens.unwrap_or(128);
    let text = run_prompt_to_completion(&state, &req.prompt, opts).unwrap_or_default();

    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    state.tokens_generated_total.inc_by(text.len() as u64);
    state.budgets.record(&tenant_id(), text.len() as u64).await;
    Json(GenerateResponse { text })
}

async fn generate_sse(State(state): State<AppState>) -> Sse<impl axum::response::sse::Stream<Item = Result<Event>>> {
    state.requests_total.inc();
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    let start = std::time::Instant::now();
    tokio::spawn(async move {
        if let Ok(model_path) = std::env::var("RUNNER_MODEL") {
            let llama = LlamaCppBackend::new();
            if llama.load_model(&model_path, runner_backend::LoadParams::default()).is_ok() {
                #[cfg(llama_ffi)]
                {
                    let mut emit = |piece: String| {
                        let _ = tx.blocking_send(Ok(Event::default().data(piece)));
                    };
                    let _ = llama.generate_with_callback("", 0, |_| {}); // ensure symbols
                    // Generate from a default prompt for SSE test
                    let _ = llama.generate_with_callback("Hello", 64, &mut emit);
                }
                #[cfg(not(llama_ffi))]
                {
                    let _ = tx.send(Ok(Event::default().data("ffi disabled"))).await;
                }
            } else {
                let _ = tx.send(Ok(Event::default().data("model load failed"))).await;
            }
        } else {
            // fallback demo
            let tokens = ["hello", " ", "world", "!\n"];
            for t in tokens { let _ = tx.send(Ok(Event::default().data(t))).await; }
        }
    });
    let stream = ReceiverStream::new(rx).map(|e| e);
    state.ttft_seconds.observe(start.elapsed().as_secs_f64());
    Sse::new(stream)
}

async fn ws_generate(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        let _ = socket.send(Message::Text("hello".into())).await;
        let _ = socket.send(Message::Text(" ".into())).await;
        let _ = socket.send(Message::Text("world".into())).await;
        let _ = socket.send(Message::Text("!".into())).await;
        let _ = socket.close().await;
    })
}

async fn openapi() -> impl IntoResponse {
    let spec = serde_json::json!({
        "openapi": "3.0.0",
        "info": {"title": "Next Inference API", "version": "0.1.0"},
        "paths": {
            "/generate": {"post": {"summary": "Generate text"}},
            "/v1/chat/completions": {"post": {"summary": "OpenAI chat subset"}},
            "/sse/generate": {"get": {"summary": "SSE stream demo"}},
            "/ws/generate": {"get": {"summary": "WebSocket stream demo"}},
            "/metrics": {"get": {"summary": "Prometheus metrics"}},
            "/healthz": {"get": {"summary": "health"}},
            "/readyz": {"get": {"summary": "readiness"}},
            "/admin/set_model": {"post": {"summary": "Hot load model"}}
        }
    });
    Json(spec)
}

#[derive(serde::Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(serde::Deserialize)]
struct ChatRequest {
    #[allow(dead_code)]
    model: Option<String>,
    messages: Vec<ChatMessage>,
    #[allow(dead_code)]
    stream: Option<bool>,
    max_tokens: Option<usize>,
}

#[derive(serde::Serialize)]
struct ChatChoiceMessage { role: String, content: String }

#[derive(serde::Serialize)]
struct ChatChoice { index: u32, message: ChatChoiceMessage, finish_reason: String }

#[derive(serde::Serialize)]
struct ChatResponse {
    id: String,
    object: String,
    choices: Vec<ChatChoice>,
}

/// Renders the conversation through the chat template before tokenizing it —
/// the prior manual `system`/`user` concatenation dropped every bit of turn
/// structure the template encodes.
async fn chat_completions(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Json<ChatResponse> {
    state.requests_total.inc();
    if !state.limiter.check_allow(&tenant_id()).await {
        return Json(ChatResponse {
            id: "rate-limited".into(),
            object: "chat.completion".into(),
            choices: vec![ChatChoice { index: 0, message: ChatChoiceMessage { role: "assistant".into(), content: String::from("RATE_LIMITED") }, finish_reason: "stop".into() }],
        });
    }
    tracing::info!(target: "api", "chat request: {} messages", req.messages.len());

    let messages: Vec<chat_template::ChatMessage> = req
        .messages
        .iter()
        .map(|m| chat_template::ChatMessage { role: m.role.clone(), content: m.content.clone() })
        .collect();
    let prompt = chat_template::render(&messages, ChatTemplateKind::ChatMl);

    let mut opts = GenerationOptions::default();
    opts.max_tokens = req.max_tokens.unwrap_or(128);
    opts.use_chat_template = true;
    opts.stop_sequences = vec!["<|user|>".into()];
    let text = run_prompt_to_completion(&state, &prompt, opts).unwrap_or_default();

    state.tokens_generated_total.inc_by(text.len() as u64);
    state.budgets.record(&tenant_id(), text.len() as u64).await;
    let resp = ChatResponse {
        id: "chatcmpl-1".into(),
        object: "chat.completion".into(),
        choices: vec![ChatChoice { index: 0, message: ChatChoiceMessage { role: "assistant".into(), content: text }, finish_reason: "stop".into() }],
    };
    Json(resp)
}

#[derive(serde::Deserialize)]
struct SetModel { path: String }

async fn admin_set_model(State(state): State<AppState>, Json(req): Json<SetModel>) -> impl IntoResponse {
    state.model_path.write().await.replace(req.path);
    ([("content-type", "text/plain")], "ok")
}

fn tenant_id() -> String {
    // For now, a single-tenant placeholder. Extend with headers/ip as needed.
    "default".into()
}

use std::collections::HashMap;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Clone)]
struct RateLimiter { inner: Arc<AsyncMutex<HashMap<String, (u64, std::time::Instant)>>> }
impl RateLimiter {
    fn new() -> Self { Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) } }
    async fn check_allow(&self, key: &str) -> bool {
        let mut g = self.inner.lock().await;
        let entry = g.entry(key.to_string()).or_insert((0, std::time::Instant::now()));
        if entry.1.elapsed() > std::time::Duration::from_secs(60) { *entry = (0, std::time::Instant::now()); }
        let limit: u64 = std::env::var("RUNNER_RATE_LIMIT_PER_MIN").ok().and_then(|v| v.parse().ok()).unwrap_or(600);
        if entry.0 >= limit { return false; }
        entry.0 += 1; true
    }
}

#[derive(Clone)]
struct TokenBudgets { inner: Arc<AsyncMutex<HashMap<String, u64>>> }
impl TokenBudgets {
    fn new() -> Self { Self { inner: Arc::new(AsyncMutex::new(HashMap::new())) } }
    async fn record(&self, key: &str, tokens: u64) {
        let mut g = self.inner.lock().await;
        let v = g.entry(key.to_string()).or_insert(0);
        *v += tokens;
    }
    #[allow(dead_code)]
    async fn allowed(&self, key: &str, new_tokens: u64) -> bool {
        let budget: u64 = std::env::var("RUNNER_TOKEN_BUDGET").ok().and_then(|v| v.parse().ok()).unwrap_or(u64::MAX);
        let g = self.inner.lock().await;
        let used = *g.get(key).unwrap_or(&0);
        used + new_tokens <= budget
    }
}
