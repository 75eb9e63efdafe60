//! Streams a backend body to the caller.
//!
//! [`Relay`] owns the backend stream, the request context and the pool
//! permit for as long as the caller is reading. The end of the backend
//! stream completes the request; a backend error mid-body aborts it.
//! If hyper drops the relay early (client disconnect) the backend stream
//! is dropped first, which cancels it, then the context records the
//! disconnect and the permit goes back to the pool.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::{Stream, StreamExt};
use tokio::sync::OwnedSemaphorePermit;

use super::pipeline::{AbortCause, Outcome, RequestContext, Stage};
use crate::backend::{BackendError, BodyStream};

pub struct Relay {
    // Field order matters: the backend stream must drop before the context.
    body: Option<BodyStream>,
    ctx: RequestContext,
    permit: Option<OwnedSemaphorePermit>,
}

impl Relay {
    #[must_use]
    pub fn new(body: BodyStream, ctx: RequestContext, permit: OwnedSemaphorePermit) -> Self {
        Self {
            body: Some(body),
            ctx,
            permit: Some(permit),
        }
    }

    fn end(&mut self, outcome: Outcome) {
        self.body = None;
        self.permit = None;
        self.ctx.finish(outcome);
    }
}

impl Stream for Relay {
    type Item = Result<Bytes, BackendError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(body) = this.body.as_mut() else {
            return Poll::Ready(None);
        };

        match body.poll_next_unpin(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                this.ctx.bytes += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(
                    correlation_id = %this.ctx.correlation_id(),
                    error = %e,
                    "backend stream failed mid-response"
                );
                this.end(Outcome::Aborted {
                    stage: Stage::Streaming,
                    cause: AbortCause::BackendError(e.clone()),
                });
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                this.end(Outcome::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
