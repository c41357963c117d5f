// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::Context;

/// The innermost operation of a pipeline, invoked on the context instance.
pub(crate) type Handler<S, In, Out> = Arc<dyn Fn(Arc<S>, In) -> BoxFuture<'static, Out> + Send + Sync>;

/// A layer of cross-cutting behavior around an asynchronous operation.
///
/// A middleware receives the call input, a [`Next`] continuation for the rest of the chain,
/// and the call [`Context`]. It may:
///
/// - short-circuit by returning without running `next`
/// - run `next` (once, several times, or not at all) and transform the result
/// - translate errors produced further down the chain
///
/// # Examples
///
/// ```
/// use futures::future::BoxFuture;
/// use warden_pipeline::{Context, Middleware, Next};
///
/// struct Double;
///
/// impl<S: Send + Sync> Middleware<S, u32, u32> for Double {
///     fn handle<'a>(&'a self, input: u32, next: Next<'a, S, u32, u32>, _context: &'a Context<S>) -> BoxFuture<'a, u32> {
///         Box::pin(async move { next.run(input).await * 2 })
///     }
/// }
/// ```
pub trait Middleware<S, In, Out>: Send + Sync {
    /// Handles one invocation.
    fn handle<'a>(&'a self, input: In, next: Next<'a, S, In, Out>, context: &'a Context<S>) -> BoxFuture<'a, Out>;
}

impl<S, In, Out, M> Middleware<S, In, Out> for Arc<M>
where
    M: Middleware<S, In, Out> + ?Sized,
{
    fn handle<'a>(&'a self, input: In, next: Next<'a, S, In, Out>, context: &'a Context<S>) -> BoxFuture<'a, Out> {
        (**self).handle(input, next, context)
    }
}

/// Continuation running the remainder of a pipeline.
///
/// `Next` is [`Copy`], so a middleware can run the rest of the chain more than once (as
/// [`Retry`](crate::Retry) does).
pub struct Next<'a, S, In, Out> {
    layers: &'a [Arc<dyn Middleware<S, In, Out>>],
    handler: &'a Handler<S, In, Out>,
    context: &'a Context<S>,
}

impl<'a, S, In, Out> Next<'a, S, In, Out> {
    pub(crate) fn new(layers: &'a [Arc<dyn Middleware<S, In, Out>>], handler: &'a Handler<S, In, Out>, context: &'a Context<S>) -> Self {
        Self { layers, handler, context }
    }

    /// Runs the rest of the chain with the given input.
    ///
    /// Layers run last-applied first; the wrapped operation runs once every layer has passed
    /// the call on.
    pub fn run(self, input: In) -> BoxFuture<'a, Out> {
        match self.layers.split_last() {
            Some((outer, inner)) => outer.handle(
                input,
                Next {
                    layers: inner,
                    ..self
                },
                self.context,
            ),
            None => (self.handler)(Arc::clone(self.context.instance()), input),
        }
    }

    /// The call context.
    #[must_use]
    pub fn context(&self) -> &'a Context<S> {
        self.context
    }

    /// Number of layers still to run before the wrapped operation.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.layers.len()
    }
}

impl<S, In, Out> Clone for Next<'_, S, In, Out> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, In, Out> Copy for Next<'_, S, In, Out> {}

impl<S, In, Out> Debug for Next<'_, S, In, Out> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Next")
            .field("remaining", &self.layers.len())
            .field("context", &self.context)
            .finish_non_exhaustive()
    }
}
