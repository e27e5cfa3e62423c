//! Response bodies that report when they are done.
//!
//! A request is not over when the response head is ready: the body still has to stream
//! out, and for grpc the status arrives in the trailers. [`CompletionBody`] watches the
//! body go by and reports exactly once, however the body ends.

use std::{
    pin::Pin,
    task::{ready, Context, Poll},
};

use bytes::Buf;
use http::HeaderMap;
use http_body::{Body, Frame, SizeHint};

/// How a body stopped producing frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndState {
    /// The body produced its last frame.
    Complete,
    /// The body returned an error.
    Errored,
    /// The body was dropped before it finished.
    Dropped,
}

/// What a body looked like when it ended.
#[derive(Debug, Clone)]
pub struct BodyEnd {
    /// Data bytes that passed through the body.
    pub bytes: u64,
    /// Trailers, if the body sent any.
    pub trailers: Option<HeaderMap>,
    pub state: EndState,
}

/// Receives the [`BodyEnd`] of a [`CompletionBody`].
pub trait BodyCompletion {
    fn complete(self, end: BodyEnd);
}

/// Wraps a body, counting its bytes and keeping its trailers until it ends.
pub struct CompletionBody<B, C>
where
    C: BodyCompletion,
{
    inner: Pin<Box<B>>,
    bytes: u64,
    trailers: Option<HeaderMap>,
    exhausted: bool,
    completion: Option<C>,
}

impl<B, C> std::fmt::Debug for CompletionBody<B, C>
where
    C: BodyCompletion,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionBody")
            .field("bytes", &self.bytes)
            .field("exhausted", &self.exhausted)
            .field("reported", &self.completion.is_none())
            .finish_non_exhaustive()
    }
}

impl<B, C> CompletionBody<B, C>
where
    B: Body,
    C: BodyCompletion,
{
    pub fn new(inner: B, completion: C) -> Self {
        Self {
            exhausted: inner.is_end_stream(),
            inner: Box::pin(inner),
            bytes: 0,
            trailers: None,
            completion: Some(completion),
        }
    }
}

impl<B, C> CompletionBody<B, C>
where
    C: BodyCompletion,
{
    fn finish(&mut self, state: EndState) {
        if let Some(completion) = self.completion.take() {
            completion.complete(BodyEnd {
                bytes: self.bytes,
                trailers: self.trailers.take(),
                state,
            });
        }
    }
}

impl<B, C> Body for CompletionBody<B, C>
where
    B: Body,
    C: BodyCompletion + Unpin,
{
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        context: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(this.inner.as_mut().poll_frame(context));
        match &frame {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    this.bytes += data.remaining() as u64;
                } else if let Some(trailers) = frame.trailers_ref() {
                    this.trailers = Some(trailers.clone());
                }
                // the last frame is often the last poll, too
                if this.trailers.is_some() || this.inner.is_end_stream() {
                    this.exhausted = true;
                    this.finish(EndState::Complete);
                }
            }
            Some(Err(_)) => this.finish(EndState::Errored),
            None => {
                this.exhausted = true;
                this.finish(EndState::Complete);
            }
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B, C> Drop for CompletionBody<B, C>
where
    C: BodyCompletion,
{
    fn drop(&mut self) {
        let state = if self.exhausted {
            EndState::Complete
        } else {
            EndState::Dropped
        };
        self.finish(state);
    }
}
