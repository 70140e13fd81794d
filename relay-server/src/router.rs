use metrics::counter;
use relay_core::protocol::{parse_client_event, ClientEvent, RateLimitView, ServerEvent};
use relay_core::RelayError;

use crate::connection::ConnectionPhase;
use crate::pipeline::Pipeline;
use crate::subsystems::interceptors::{limit_subject, GuardContext};

/// What the connection loop should do after a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Parse, guard and dispatch one client frame.
///
/// Failures never end the connection; they are reported as `error` events
/// carrying the client's `event_id` when one could be read.
pub async fn handle_frame(pipeline: &mut Pipeline, phase: ConnectionPhase, raw: &str) -> Flow {
    let gateway = pipeline.gateway().clone();
    let ctx = pipeline.ctx().child();

    let event = match parse_client_event(raw, gateway.config.protocol.max_event_bytes) {
        Ok(event) => event,
        Err(rejected) => {
            counter!("relay_client_events_total", "type" => "invalid", "outcome" => "rejected")
                .increment(1);
            pipeline
                .out()
                .emit_error(&rejected.error, rejected.event_id, &ctx.correlation_id)
                .await;
            return Flow::Continue;
        }
    };
    let kind = event.kind();
    let event_id = event.event_id().map(str::to_string);

    let (guarded, rate_limit) = {
        let mut cx = GuardContext {
            ctx: &ctx,
            principal: pipeline.principal(),
            client_ip: pipeline.client_ip(),
            phase,
            event: &event,
            buffered_audio: pipeline.buffered_audio(),
            rate_limit: None,
        };
        let outcome = gateway.chain.run(&mut cx).await;
        (outcome, cx.rate_limit)
    };

    if let Some(result) = rate_limit {
        let spec = gateway
            .limiter
            .resolve(&limit_subject(pipeline.principal(), pipeline.client_ip()));
        pipeline
            .out()
            .emit(ServerEvent::RateLimitsUpdated {
                rate_limits: RateLimitView::from_result(&result, spec.max_requests, spec.max_units),
            })
            .await;
    }
    if let Err(e) = guarded {
        counter!("relay_client_events_total", "type" => kind, "outcome" => "rejected").increment(1);
        pipeline.out().emit_error(&e, event_id, &ctx.correlation_id).await;
        return Flow::Continue;
    }

    tracing::debug!(
        session_id = %ctx.session_id,
        correlation_id = %ctx.correlation_id,
        event = kind,
        "Client event"
    );
    pipeline.set_request_context(ctx.clone());
    match handle_event(pipeline, event).await {
        Ok(flow) => {
            counter!("relay_client_events_total", "type" => kind, "outcome" => "accepted").increment(1);
            flow
        }
        Err(e) => {
            counter!("relay_client_events_total", "type" => kind, "outcome" => "failed").increment(1);
            tracing::debug!(correlation_id = %ctx.correlation_id, "{} failed: {}", kind, e);
            pipeline.out().emit_error(&e, event_id, &ctx.correlation_id).await;
            Flow::Continue
        }
    }
}

async fn handle_event(pipeline: &mut Pipeline, event: ClientEvent) -> Result<Flow, RelayError> {
    match event {
        ClientEvent::SessionUpdate { session, .. } => {
            pipeline.update_session(&session).await?;
        }
        ClientEvent::InputAppend { audio, .. } => {
            pipeline.append_audio(&audio)?;
        }
        ClientEvent::InputCommit { .. } => {
            pipeline.commit_audio().await?;
        }
        ClientEvent::InputClear { .. } => {
            pipeline.clear_audio().await;
        }
        ClientEvent::ResponseCreate { response, .. } => {
            pipeline.create_response(response).await?;
        }
        ClientEvent::ResponseCancel { response_id, .. } => {
            pipeline.cancel(response_id).await?;
        }
        ClientEvent::SessionClose { .. } => return Ok(Flow::Close),
    }
    Ok(Flow::Continue)
}
