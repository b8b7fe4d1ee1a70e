use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::middleware::from_fn;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use clap::Parser;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnFailure, DefaultOnResponse, TraceLayer};
use tracing::{Level, error, info, warn};
use uuid::Uuid;

mod metrics;

use scriptclone::backends::gemini::{DEFAULT_BASE_URL, DEFAULT_MODEL};
use scriptclone::{
    Command, CredentialProvider, Error, Event, GeminiConfig, GeminiService, GenerationService,
    Intent, MemoryCredential, Opts, Phase, PipelineState, StageRunner,
};

type Runner = StageRunner<Box<dyn GenerationService>>;

/// Upper bound on how often idle sessions are swept.
const SWEEP_EVERY: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "scriptclone-server")]
#[command(about = "HTTP server for transcript analysis and script cloning")]
struct Params {
    /// Host interface to bind to.
    #[arg(long = "host", default_value = "127.0.0.1")]
    host: String,

    /// TCP port to listen on.
    #[arg(long = "port", default_value_t = 8080)]
    port: u16,

    /// API key new sessions start with. Sessions can replace it via
    /// `PUT /v1/sessions/{id}/credential`.
    #[arg(long = "api-key", env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    #[arg(long = "model", env = "SCRIPTCLONE_MODEL", default_value = DEFAULT_MODEL)]
    model: String,

    #[arg(long = "base-url", env = "SCRIPTCLONE_BASE_URL", default_value = DEFAULT_BASE_URL)]
    base_url: String,

    /// Per-request timeout for generation calls, in seconds.
    #[arg(long = "timeout", default_value_t = 60)]
    timeout_secs: u64,

    /// Language generated scripts are written in. Defaults to the transcript's language.
    #[arg(long = "language")]
    language: Option<String>,

    /// Drop sessions untouched for this many seconds. 0 keeps them until deleted.
    #[arg(long = "session-ttl", default_value_t = 3600)]
    session_ttl_secs: u64,
}

struct Session {
    state: Mutex<PipelineState>,
    credential: MemoryCredential,
    last_seen: Mutex<Instant>,
}

impl Session {
    fn new(api_key: &str) -> Self {
        Self {
            state: Mutex::new(PipelineState::new()),
            credential: MemoryCredential::new(api_key),
            last_seen: Mutex::new(Instant::now()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, PipelineState>, AppError> {
        self.state
            .lock()
            .map_err(|_| AppError::internal("session state poisoned"))
    }

    fn touch(&self) {
        if let Ok(mut seen) = self.last_seen.lock() {
            *seen = Instant::now();
        }
    }

    fn idle_for(&self) -> Duration {
        self.last_seen
            .lock()
            .map(|seen| seen.elapsed())
            .unwrap_or_default()
    }

    /// A stage call is outstanding; its completion still has to land here.
    fn in_flight(&self) -> bool {
        self.state
            .lock()
            .map(|s| matches!(s.phase(), Phase::Analyzing | Phase::Generating))
            .unwrap_or(false)
    }
}

#[derive(Clone)]
struct AppState {
    runner: Arc<Runner>,
    sessions: Arc<Mutex<HashMap<Uuid, Arc<Session>>>>,
    default_api_key: Arc<str>,
}

impl AppState {
    fn sessions(&self) -> Result<MutexGuard<'_, HashMap<Uuid, Arc<Session>>>, AppError> {
        self.sessions
            .lock()
            .map_err(|_| AppError::internal("session table poisoned"))
    }

    fn session(&self, id: Uuid) -> Result<Arc<Session>, AppError> {
        let session = self
            .sessions()?
            .get(&id)
            .cloned()
            .ok_or_else(|| AppError::not_found(format!("no session {id}")))?;
        session.touch();
        Ok(session)
    }

    /// Remove sessions idle for at least `ttl`. Sessions with a stage call in flight stay.
    fn sweep_idle(&self, ttl: Duration) -> Result<usize, AppError> {
        let mut sessions = self.sessions()?;
        let before = sessions.len();
        sessions.retain(|_, s| s.in_flight() || s.idle_for() < ttl);
        metrics::set_sessions(sessions.len());
        Ok(before - sessions.len())
    }
}

#[derive(Debug, Serialize)]
struct SessionView {
    id: Uuid,
    #[serde(flatten)]
    state: PipelineState,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    transcript: String,
}

#[derive(Debug, Deserialize)]
struct TopicBody {
    topic: String,
}

#[derive(Debug, Deserialize)]
struct CredentialBody {
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let status = match &err {
            Error::Rejected { .. } => StatusCode::CONFLICT,
            Error::EmptyInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            _ if err.is_stage_failure() => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            error: self.message,
        });
        (self.status, body).into_response()
    }
}

fn main() {
    scriptclone::logging::init();

    if let Err(err) = run() {
        error!(error = ?err, "scriptclone-server failed");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let params = Params::parse();

    if let Err(err) = metrics::init() {
        warn!(error = ?err, "metrics disabled (init failed)");
    }

    let addr: SocketAddr = format!("{}:{}", params.host, params.port)
        .parse()
        .context("invalid host/port bind address")?;

    // The blocking HTTP client must be created and dropped outside the async runtime, so the
    // last `runner` handle lives here rather than in the router.
    let timeout = Duration::from_secs(params.timeout_secs);
    let service = GeminiService::new(GeminiConfig {
        model: params.model,
        base_url: params.base_url,
        timeout,
    })
    .context("failed to initialize generation client")?;

    let mut opts = Opts::default();
    if let Some(language) = params.language {
        opts = opts.with_output_language(language);
    }
    let service: Box<dyn GenerationService> = Box::new(service);
    let runner = Arc::new(StageRunner::new(service, opts));
    let ttl = Duration::from_secs(params.session_ttl_secs);

    let state = AppState {
        runner: runner.clone(),
        sessions: Arc::new(Mutex::new(HashMap::new())),
        default_api_key: params.api_key.unwrap_or_default().into(),
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let res = rt.block_on(serve(addr, state, timeout, ttl));
    drop(rt);
    drop(runner);
    res
}

async fn serve(addr: SocketAddr, state: AppState, timeout: Duration, ttl: Duration) -> Result<()> {
    if !ttl.is_zero() {
        tokio::spawn(sweep_sessions(state.clone(), ttl));
    }

    let app = Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics::prometheus_metrics))
        .route("/v1/sessions", post(create_session))
        .route("/v1/sessions/{id}", get(get_session).delete(delete_session))
        .route("/v1/sessions/{id}/credential", put(set_credential))
        .route("/v1/sessions/{id}/submit", post(submit))
        .route("/v1/sessions/{id}/topic", post(choose_topic))
        .route("/v1/sessions/{id}/back", post(back_to_topics))
        .route("/v1/sessions/{id}/reset", post(reset))
        .route("/v1/sessions/{id}/retry", post(retry))
        .route_layer(from_fn(metrics::track_http_metrics))
        .with_state(state)
        .layer(TimeoutLayer::new(timeout + Duration::from_secs(5)))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(
                    DefaultMakeSpan::new()
                        .level(Level::INFO)
                        .include_headers(false),
                )
                .on_response(DefaultOnResponse::new().level(Level::INFO))
                .on_failure(DefaultOnFailure::new().level(Level::ERROR)),
        );

    let listener = TcpListener::bind(addr).await.context("bind failed")?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = ?err, "failed to listen for ctrl-c");
    }
}

async fn sweep_sessions(state: AppState, ttl: Duration) {
    let mut ticker = tokio::time::interval(SWEEP_EVERY.min(ttl).max(Duration::from_secs(1)));
    loop {
        ticker.tick().await;
        match state.sweep_idle(ttl) {
            Ok(0) => {}
            Ok(removed) => info!(removed, "expired idle sessions"),
            Err(err) => warn!(error = %err.message, "session sweep failed"),
        }
    }
}

async fn root() -> &'static str {
    "scriptclone-server: POST /v1/sessions, then /v1/sessions/{id}/submit"
}

async fn healthz() -> &'static str {
    "ok"
}

async fn create_session(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<SessionView>), AppError> {
    let id = Uuid::new_v4();
    let session = Arc::new(Session::new(&state.default_api_key));
    let view = view(id, &session)?;

    let mut sessions = state.sessions()?;
    sessions.insert(id, session);
    metrics::set_sessions(sessions.len());
    info!(%id, "session created");

    Ok((StatusCode::CREATED, Json(view)))
}

async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    let session = state.session(id)?;
    Ok(Json(view(id, &session)?))
}

async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    let mut sessions = state.sessions()?;
    if sessions.remove(&id).is_none() {
        return Err(AppError::not_found(format!("no session {id}")));
    }
    metrics::set_sessions(sessions.len());
    Ok(StatusCode::NO_CONTENT)
}

async fn set_credential(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<CredentialBody>,
) -> Result<StatusCode, AppError> {
    let session = state.session(id)?;
    session.credential.set_credential(&body.api_key)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn submit(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<SubmitBody>,
) -> Result<Json<SessionView>, AppError> {
    apply_intent(&state, id, Intent::Submit(body.transcript)).await
}

async fn choose_topic(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TopicBody>,
) -> Result<Json<SessionView>, AppError> {
    apply_intent(&state, id, Intent::ChooseTopic(body.topic)).await
}

async fn back_to_topics(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    apply_intent(&state, id, Intent::BackToTopics).await
}

async fn reset(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    apply_intent(&state, id, Intent::Reset).await
}

async fn retry(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<SessionView>, AppError> {
    apply_intent(&state, id, Intent::Retry).await
}

/// Apply `intent`, and if it starts a stage call, run that call without holding the session
/// lock. Concurrent intents see `analyzing`/`generating` meanwhile and get 409.
///
/// The call and its completion run on a detached task, so the session still leaves
/// `analyzing`/`generating` when this request is dropped (client gone, timeout).
async fn apply_intent(
    state: &AppState,
    id: Uuid,
    intent: Intent,
) -> Result<Json<SessionView>, AppError> {
    let session = state.session(id)?;
    let command = session.lock()?.apply(intent)?;

    if let Some(command) = command {
        tokio::spawn(complete(state.runner.clone(), session.clone(), command))
            .await
            .map_err(|err| AppError::internal(format!("stage task failed: {err}")))??;
    }

    Ok(Json(view(id, &session)?))
}

/// Run `command` on the blocking pool and apply its completion to `session`.
async fn complete(
    runner: Arc<Runner>,
    session: Arc<Session>,
    command: Command,
) -> Result<(), AppError> {
    let stage = command.stage();
    let worker = session.clone();
    let call = command.clone();
    let event =
        match tokio::task::spawn_blocking(move || runner.run(&worker.credential, &call)).await {
            Ok(event) => event,
            Err(err) => {
                error!(%stage, error = %err, "stage worker failed");
                command.failed(Error::Aborted(err.to_string()))
            }
        };

    metrics::record_stage(stage, succeeded(&event));
    session.lock()?.apply(event)?;
    session.touch();
    Ok(())
}

fn view(id: Uuid, session: &Session) -> Result<SessionView, AppError> {
    Ok(SessionView {
        id,
        state: session.lock()?.clone(),
    })
}

fn succeeded(event: &Event) -> bool {
    matches!(
        event,
        Event::Analyzed { outcome: Ok(_), .. } | Event::Synthesized { outcome: Ok(_), .. }
    )
}
