// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::middleware::Handler;
use crate::{Context, Middleware, Next, Target};

/// An operation wrapped in an ordered chain of [`Middleware`].
///
/// Layers are added in decoration order with [`layer`](Self::layer) and nest LIFO: the last
/// layer added runs outermost, wrapping every layer added before it. The wrapped operation
/// receives the original instance and input once every layer has passed the call on.
///
/// A pipeline is built once and then invoked any number of times, concurrently if needed.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use futures::future::BoxFuture;
/// use warden_pipeline::{Context, Middleware, Next, Pipeline, Target};
///
/// struct Greeter {
///     greeting: String,
/// }
///
/// struct Shout;
///
/// impl<S: Send + Sync> Middleware<S, String, String> for Shout {
///     fn handle<'a>(&'a self, input: String, next: Next<'a, S, String, String>, _: &'a Context<S>) -> BoxFuture<'a, String> {
///         Box::pin(async move { next.run(input).await.to_uppercase() })
///     }
/// }
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let pipeline = Pipeline::new(Target::of::<Greeter>("greet"), |greeter: Arc<Greeter>, name: String| async move {
///     format!("{}, {name}!", greeter.greeting)
/// })
/// .layer(Shout);
///
/// let greeter = Arc::new(Greeter { greeting: "Hello".to_string() });
///
/// assert_eq!(pipeline.call(greeter, "world".to_string()).await, "HELLO, WORLD!");
/// # }
/// ```
pub struct Pipeline<S, In, Out> {
    target: Target,
    layers: Vec<Arc<dyn Middleware<S, In, Out>>>,
    handler: Handler<S, In, Out>,
}

impl<S, In, Out> Pipeline<S, In, Out> {
    /// Creates a pipeline around `handler` with no layers.
    #[must_use]
    pub fn new<F, Fut>(target: Target, handler: F) -> Self
    where
        S: 'static,
        In: 'static,
        Out: 'static,
        F: Fn(Arc<S>, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Out> + Send + 'static,
    {
        Self {
            target,
            layers: Vec::new(),
            handler: Arc::new(move |instance: Arc<S>, input: In| -> BoxFuture<'static, Out> { Box::pin(handler(instance, input)) }),
        }
    }

    /// Adds a layer; it runs outside every layer added before it.
    #[must_use]
    pub fn layer<M>(mut self, middleware: M) -> Self
    where
        M: Middleware<S, In, Out> + 'static,
    {
        self.layers.push(Arc::new(middleware));
        self
    }

    /// Identity of the wrapped operation.
    #[must_use]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Number of layers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.layers.len()
    }

    /// Returns `true` when the pipeline has no layers.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Invokes the pipeline on `instance` with `input`.
    pub async fn call(&self, instance: Arc<S>, input: In) -> Out {
        let context = Context::new(self.target.clone(), instance);
        Next::new(&self.layers, &self.handler, &context).run(input).await
    }
}

impl<S, In, Out> Clone for Pipeline<S, In, Out> {
    fn clone(&self) -> Self {
        Self {
            target: self.target.clone(),
            layers: self.layers.clone(),
            handler: Arc::clone(&self.handler),
        }
    }
}

impl<S, In, Out> Debug for Pipeline<S, In, Out> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("target", &self.target)
            .field("layers", &self.layers.len())
            .finish_non_exhaustive()
    }
}
