use axum::body::Body;
use axum::debug_handler;
use axum::extract::State;
use axum::http::header::CONTENT_TYPE;
use axum::response::Response;
use futures::stream::Stream;
use metrics::counter;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_stream::StreamExt;
use tracing::instrument;
use uuid::Uuid;

use crate::error::Error;
use crate::gateway_util::{AppState, AppStateData, StructuredJson};
use crate::idempotency::{guarded_release, guarded_try_acquire, IdempotencyStore};
use crate::instance::InstanceHandle;
use crate::pipeline::{
    open_stream, render_payload, transform_stream, ChatParams, ChunkTransformer, StreamLine,
};
use crate::router::{Admission, Router};
use crate::tokens::estimate_tokens;

/// A handler for the streaming chat endpoint
#[debug_handler(state = AppStateData)]
pub async fn chat_completions_handler(
    State(AppStateData {
        config: _,
        router,
        idempotency,
    }): AppState,
    StructuredJson(params): StructuredJson<ChatParams>,
) -> Result<Response<Body>, Error> {
    counter!("request_count", "endpoint" => "chat_completions").increment(1);
    match chat_completions(router, idempotency, params).await {
        Ok(response) => Ok(response),
        Err(e) => {
            counter!("admission_reject_count", "reason" => e.reason()).increment(1);
            Err(e)
        }
    }
}

#[instrument(name = "chat_completions", skip(router, idempotency, params))]
pub async fn chat_completions(
    router: Arc<Router>,
    idempotency: Arc<IdempotencyStore>,
    params: ChatParams,
) -> Result<Response<Body>, Error> {
    if params.message.trim().is_empty() {
        return Err(Error::BadRequest {
            message: "`message` must not be empty".to_string(),
        });
    }

    let idempotency_key = params
        .idempotency_key
        .clone()
        .unwrap_or_else(|| Uuid::now_v7().to_string());
    idempotency.sweep();
    if !guarded_try_acquire(&idempotency, &idempotency_key).await {
        return Err(Error::DuplicateRequest {
            key: idempotency_key,
        });
    }

    // Past this point every exit must release the idempotency claim
    let estimated_tokens = estimate_tokens(&params.message);
    let Some(admission) = router.acquire(estimated_tokens) else {
        guarded_release(&idempotency, &idempotency_key).await;
        return Err(Error::NoInstanceAvailable);
    };
    let instance = admission.instance().clone();

    let client = match router.clients().get(&instance).await {
        Ok(client) => client,
        Err(e) => {
            guarded_release(&idempotency, &idempotency_key).await;
            return Err(e);
        }
    };

    let payload = render_payload(&instance.config, &params, &idempotency_key);
    let start = Instant::now();
    let response = match open_stream(&client, &instance.config, &payload, &idempotency_key).await {
        Ok(response) => response,
        Err(e) => {
            instance.record_failure();
            counter!("stream_outcome_count", "outcome" => "error").increment(1);
            guarded_release(&idempotency, &idempotency_key).await;
            return Err(e);
        }
    };

    let transformer = ChunkTransformer::new(&instance.config, idempotency_key.clone());
    let guard = StreamGuard::new(admission, instance, idempotency, idempotency_key, start);
    let body = Body::from_stream(emit_stream(transform_stream(response, transformer), guard));

    Response::builder()
        .status(200)
        .header(CONTENT_TYPE, "text/event-stream")
        .body(body)
        .map_err(|e| Error::AppState {
            message: format!("Failed to build streaming response: {e}"),
        })
}

/// Settles the per-request resources exactly once, whatever way the stream
/// ends: completion and failure are explicit, and dropping the guard without
/// either (client disconnect) counts as a cancellation.
struct StreamGuard {
    admission: Option<Admission>,
    instance: Arc<InstanceHandle>,
    idempotency: Arc<IdempotencyStore>,
    idempotency_key: String,
    start: Instant,
    settled: bool,
}

impl StreamGuard {
    fn new(
        admission: Admission,
        instance: Arc<InstanceHandle>,
        idempotency: Arc<IdempotencyStore>,
        idempotency_key: String,
        start: Instant,
    ) -> Self {
        StreamGuard {
            admission: Some(admission),
            instance,
            idempotency,
            idempotency_key,
            start,
            settled: false,
        }
    }

    fn complete(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.instance
            .record_success(self.start.elapsed().as_millis() as u64);
        counter!("stream_outcome_count", "outcome" => "completed").increment(1);
        self.release();
    }

    fn fail(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;
        self.instance.record_failure();
        counter!("stream_outcome_count", "outcome" => "error").increment(1);
        self.release();
    }

    fn release(&mut self) {
        if let Some(admission) = self.admission.take() {
            admission.release();
        }
        let store = self.idempotency.clone();
        let key = self.idempotency_key.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                guarded_release(&store, &key).await;
            });
        }
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        if !self.settled {
            self.settled = true;
            // Attributed as a failure for monitoring; the slots are still
            // released unconditionally
            self.instance.record_failure();
            counter!("stream_outcome_count", "outcome" => "cancelled").increment(1);
            self.release();
        }
    }
}

/// Render normalized lines to the client body. Output order equals upstream
/// arrival order; the stream closes after the first `[DONE]`.
fn emit_stream(
    upstream: impl Stream<Item = Result<StreamLine, Error>>,
    mut guard: StreamGuard,
) -> impl Stream<Item = Result<String, Error>> {
    async_stream::stream! {
        futures::pin_mut!(upstream);
        while let Some(item) = upstream.next().await {
            match item {
                Ok(StreamLine::Done) => {
                    yield Ok("[DONE]\n".to_string());
                    guard.complete();
                    return;
                }
                Ok(StreamLine::Object(value)) => {
                    yield Ok(format!("{value}\n"));
                }
                Err(e) => {
                    e.log();
                    guard.fail();
                    yield Err(e);
                    return;
                }
            }
        }
        // Upstream closed without a terminal [DONE]; the stream is complete
        // from the client's point of view
        yield Ok("[DONE]\n".to_string());
        guard.complete();
    }
}
