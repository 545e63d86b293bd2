#![forbid(unsafe_code)]

use std::{
    env,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use curtain_adapter::debounce::DebouncedRunScheduler;
use curtain_adapter::{
    AdapterHealthResponse, AdapterRunCounters, AdapterRuntime, ChatOpenRequest, EnabledRequest,
    EntryInput, EntryRemoveRequest, LogReplaceRequest, OwnerRegisterRequest,
    PresentationDrainResponse, SavePolicyRequest, SignalDispatch, TranscriptViewResponse,
    VisAdapterResponse,
};
use curtain_kernel_contracts::ph1vis::PH1VIS_CONTRACT_VERSION;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type Shared = Arc<DebouncedRunScheduler>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let bind = env::var("CURTAIN_HTTP_BIND").unwrap_or_else(|_| "127.0.0.1:8090".to_string());
    let addr: SocketAddr = bind.parse()?;

    let runtime = AdapterRuntime::default_from_env();
    let events = runtime.event_config();
    let scheduler = DebouncedRunScheduler::new(Arc::new(Mutex::new(runtime)));

    let for_startup = Arc::clone(&scheduler);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(events.startup_delay_ms)).await;
        match with_runtime(&for_startup, |rt| Ok(rt.host_ready(None))).await {
            Ok(dispatch) => info!(
                outcome = %VisAdapterResponse::from(&dispatch).outcome,
                "startup visibility pass"
            ),
            Err(err) => warn!(error = %err, "startup visibility pass failed"),
        }
    });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/v1/owners", post(register_owner))
        .route("/v1/chat/open", post(open_chat))
        .route("/v1/chat/entries", post(append_entry))
        .route("/v1/chat/entries/remove", post(remove_entry))
        .route("/v1/chat/replace", post(replace_log))
        .route("/v1/chat/generation_end", post(generation_ended))
        .route("/v1/commands/save_policy", post(save_policy))
        .route("/v1/commands/unhide_all", post(unhide_all))
        .route("/v1/commands/enabled", post(set_enabled))
        .route("/v1/state", get(transcript_state))
        .route("/v1/presentation/drain", post(drain_presentation))
        .with_state(scheduler);

    info!(
        %addr,
        debounce_ms = events.debounce_ms,
        startup_delay_ms = events.startup_delay_ms,
        "curtain_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "ctrl-c handler failed");
    }
    info!("curtain_adapter_http shutting down");
}

/// Runs `f` against the locked runtime on the blocking pool; policy writes
/// may block on the host store.
async fn with_runtime<T, F>(scheduler: &Shared, f: F) -> Result<T, String>
where
    F: FnOnce(&mut AdapterRuntime) -> Result<T, String> + Send + 'static,
    T: Send + 'static,
{
    let runtime = Arc::clone(scheduler.runtime());
    tokio::task::spawn_blocking(move || {
        let mut rt = runtime
            .lock()
            .map_err(|_| "adapter runtime lock poisoned".to_string())?;
        f(&mut rt)
    })
    .await
    .map_err(|err| format!("adapter task failed: {err}"))?
}

fn reply(result: Result<VisAdapterResponse, String>) -> (StatusCode, Json<VisAdapterResponse>) {
    match result {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(reason) => (
            StatusCode::BAD_REQUEST,
            Json(VisAdapterResponse::error("REJECTED", reason)),
        ),
    }
}

fn reply_dispatch(
    scheduler: &Shared,
    result: Result<SignalDispatch, String>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    if let Ok(dispatch) = &result {
        scheduler.arm_if_scheduled(dispatch);
    }
    reply(result.map(|dispatch| VisAdapterResponse::from(&dispatch)))
}

async fn healthz(State(scheduler): State<Shared>) -> (StatusCode, Json<AdapterHealthResponse>) {
    match with_runtime(&scheduler, |rt| Ok(rt.health_report())).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(reason) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(AdapterHealthResponse {
                status: "error".to_string(),
                outcome: "UNHEALTHY".to_string(),
                reason: Some(reason),
                contract_version: PH1VIS_CONTRACT_VERSION.0,
                enabled: false,
                owner_count: 0,
                runs: AdapterRunCounters::default(),
            }),
        ),
    }
}

async fn register_owner(
    State(scheduler): State<Shared>,
    Json(request): Json<OwnerRegisterRequest>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, move |rt| {
        rt.register_owner(request)
            .map(|()| VisAdapterResponse::ok("REGISTERED"))
    })
    .await;
    reply(result)
}

async fn open_chat(
    State(scheduler): State<Shared>,
    Json(request): Json<ChatOpenRequest>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, move |rt| rt.open_chat(request, None)).await;
    reply_dispatch(&scheduler, result)
}

async fn append_entry(
    State(scheduler): State<Shared>,
    Json(entry): Json<EntryInput>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    match with_runtime(&scheduler, move |rt| rt.append_entry(entry, None)).await {
        Ok((index, dispatch)) => {
            scheduler.arm_if_scheduled(&dispatch);
            let mut response = VisAdapterResponse::from(&dispatch);
            response.index = Some(index);
            reply(Ok(response))
        }
        Err(reason) => reply(Err(reason)),
    }
}

async fn remove_entry(
    State(scheduler): State<Shared>,
    Json(request): Json<EntryRemoveRequest>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, move |rt| rt.remove_entry(request, None)).await;
    reply_dispatch(&scheduler, result)
}

async fn replace_log(
    State(scheduler): State<Shared>,
    Json(request): Json<LogReplaceRequest>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, move |rt| rt.replace_log(request, None)).await;
    reply_dispatch(&scheduler, result)
}

async fn generation_ended(State(scheduler): State<Shared>) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, |rt| Ok(rt.generation_ended(None))).await;
    reply_dispatch(&scheduler, result)
}

async fn save_policy(
    State(scheduler): State<Shared>,
    Json(request): Json<SavePolicyRequest>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, move |rt| {
        Ok(VisAdapterResponse::from(&rt.save_policy(request, None)))
    })
    .await;
    reply(result)
}

async fn unhide_all(State(scheduler): State<Shared>) -> (StatusCode, Json<VisAdapterResponse>) {
    let result = with_runtime(&scheduler, |rt| {
        Ok(VisAdapterResponse::from(&rt.unhide_all(None)))
    })
    .await;
    reply(result)
}

async fn set_enabled(
    State(scheduler): State<Shared>,
    Json(request): Json<EnabledRequest>,
) -> (StatusCode, Json<VisAdapterResponse>) {
    if !request.enabled {
        scheduler.cancel();
    }
    let result = with_runtime(&scheduler, move |rt| Ok(rt.set_enabled(request.enabled, None))).await;
    reply_dispatch(&scheduler, result)
}

async fn transcript_state(
    State(scheduler): State<Shared>,
) -> (StatusCode, Json<TranscriptViewResponse>) {
    match with_runtime(&scheduler, |rt| Ok(rt.transcript_view())).await {
        Ok(view) => (StatusCode::OK, Json(view)),
        Err(reason) => {
            warn!(error = %reason, "transcript state unavailable");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TranscriptViewResponse {
                    status: "error".to_string(),
                    enabled: false,
                    owner: None,
                    chat_id: None,
                    policy_label: "none".to_string(),
                    policy_input: String::new(),
                    entries: Vec::new(),
                }),
            )
        }
    }
}

async fn drain_presentation(
    State(scheduler): State<Shared>,
) -> (StatusCode, Json<PresentationDrainResponse>) {
    match with_runtime(&scheduler, |rt| Ok(rt.drain_presentation())).await {
        Ok(drained) => (StatusCode::OK, Json(drained)),
        Err(reason) => {
            warn!(error = %reason, "presentation drain failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(PresentationDrainResponse {
                    status: "error".to_string(),
                    flag_updates: Vec::new(),
                    notices: Vec::new(),
                }),
            )
        }
    }
}
