//! Single-fire, chainable asynchronous results.
//!
//! An [`AsyncRequest`] is resolved or failed exactly once by its producer.
//! Before the value reaches the terminal success handler it passes through
//! an ordered queue of stages; each stage receives the value plus the
//! request and must itself call [`AsyncRequest::resolve`] or
//! [`AsyncRequest::fail`] to continue the chain.
//!
//! Handlers may be attached before or after the outcome is known. An
//! outcome that arrives with no matching handler is buffered until one is
//! registered.

mod association;

pub use association::Associable;

use std::collections::VecDeque;
use std::future::{Future, IntoFuture};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{Error, Result, ValidationErrors};
use crate::model::EntityDefinition;

type Stage<T> = Box<dyn FnOnce(T, AsyncRequest<T>) + Send>;
type SuccessHandler<T> = Box<dyn FnOnce(T) + Send>;
type ErrorHandler = Box<dyn FnOnce(Error) + Send>;
type ValidationHandler = Box<dyn FnOnce(ValidationErrors) + Send>;

enum State<T> {
  Pending,
  Buffered(std::result::Result<T, Error>),
  Finished,
}

struct Inner<T> {
  stages: VecDeque<Stage<T>>,
  on_success: Option<SuccessHandler<T>>,
  on_error: Option<ErrorHandler>,
  on_validation_error: Option<ValidationHandler>,
  state: State<T>,
  definition: Option<Arc<EntityDefinition>>,
}

impl<T> Drop for Inner<T> {
  fn drop(&mut self) {
    if let State::Buffered(outcome) = &self.state {
      let kind = if outcome.is_ok() { "value" } else { "error" };
      tracing::warn!(kind, "request outcome was never consumed by a handler");
    }
  }
}

/// The eventual outcome of one logical operation.
pub struct AsyncRequest<T> {
  inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for AsyncRequest<T> {
  fn clone(&self) -> Self {
    Self {
      inner: self.inner.clone(),
    }
  }
}

impl<T> std::fmt::Debug for AsyncRequest<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let inner = self.inner.lock();
    let state = match inner.state {
      State::Pending => "pending",
      State::Buffered(_) => "buffered",
      State::Finished => "finished",
    };
    f.debug_struct("AsyncRequest")
      .field("state", &state)
      .field("stages", &inner.stages.len())
      .finish()
  }
}

impl<T: Send + 'static> Default for AsyncRequest<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T: Send + 'static> AsyncRequest<T> {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Mutex::new(Inner {
        stages: VecDeque::new(),
        on_success: None,
        on_error: None,
        on_validation_error: None,
        state: State::Pending,
        definition: None,
      })),
    }
  }

  /// A request bound to an entity, so association stages can be attached.
  pub fn for_entity(definition: Arc<EntityDefinition>) -> Self {
    let request = Self::new();
    request.inner.lock().definition = Some(definition);
    request
  }

  /// Drive a new request from a future on the tokio runtime.
  pub fn spawn<F>(future: F) -> Self
  where
    F: Future<Output = Result<T>> + Send + 'static,
  {
    let request = Self::new();
    request.complete_with(future);
    request
  }

  /// A request that has already failed. Used for errors detected before
  /// any I/O starts.
  pub fn failed(err: Error) -> Self {
    let request = Self::new();
    request.fail(err);
    request
  }

  pub fn with_definition(self, definition: Arc<EntityDefinition>) -> Self {
    self.inner.lock().definition = Some(definition);
    self
  }

  pub fn definition(&self) -> Option<Arc<EntityDefinition>> {
    self.inner.lock().definition.clone()
  }

  /// Spawn `future` and feed its outcome into this request.
  pub fn complete_with<F>(&self, future: F)
  where
    F: Future<Output = Result<T>> + Send + 'static,
  {
    let request = self.clone();
    tokio::spawn(async move {
      match future.await {
        Ok(value) => request.resolve(value),
        Err(err) => request.fail(err),
      }
    });
  }

  /// Register the terminal success handler. Last registration wins.
  pub fn on_success<F>(self, handler: F) -> Self
  where
    F: FnOnce(T) + Send + 'static,
  {
    let mut inner = self.inner.lock();
    match std::mem::replace(&mut inner.state, State::Finished) {
      State::Buffered(Ok(value)) => {
        drop(inner);
        handler(value);
        return self;
      }
      other => inner.state = other,
    }
    inner.on_success = Some(Box::new(handler));
    drop(inner);
    self
  }

  /// Register the terminal error handler. Last registration wins.
  pub fn on_error<F>(self, handler: F) -> Self
  where
    F: FnOnce(Error) + Send + 'static,
  {
    let mut inner = self.inner.lock();
    match std::mem::replace(&mut inner.state, State::Finished) {
      State::Buffered(Err(err)) => {
        drop(inner);
        handler(err);
        return self;
      }
      other => inner.state = other,
    }
    inner.on_error = Some(Box::new(handler));
    drop(inner);
    self
  }

  /// Register a dedicated handler for field validation failures. Without
  /// one, validation failures reach the error handler.
  pub fn on_validation_error<F>(self, handler: F) -> Self
  where
    F: FnOnce(ValidationErrors) + Send + 'static,
  {
    let mut inner = self.inner.lock();
    match std::mem::replace(&mut inner.state, State::Finished) {
      State::Buffered(Err(Error::Validation(errors))) => {
        drop(inner);
        handler(errors);
        return self;
      }
      other => inner.state = other,
    }
    inner.on_validation_error = Some(Box::new(handler));
    drop(inner);
    self
  }

  /// Append a post-processing stage. Stages run in registration order and
  /// each one must resolve or fail the request it is handed. A stage added
  /// after the value arrived (but before any success handler took it) runs
  /// immediately.
  pub fn add_stage<F>(self, stage: F) -> Self
  where
    F: FnOnce(T, AsyncRequest<T>) + Send + 'static,
  {
    let mut inner = self.inner.lock();
    match std::mem::replace(&mut inner.state, State::Pending) {
      State::Buffered(Ok(value)) => {
        drop(inner);
        stage(value, self.clone());
      }
      other => {
        inner.state = other;
        inner.stages.push_back(Box::new(stage));
        drop(inner);
      }
    }
    self
  }

  /// Append a stage backed by a future. Its output continues the chain.
  pub fn add_async_stage<F, Fut>(self, stage: F) -> Self
  where
    F: FnOnce(T) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    self.add_stage(move |value, request| request.complete_with(stage(value)))
  }

  /// Make this request's outcome the outcome of `other`.
  pub fn forward_to(self, other: AsyncRequest<T>) -> Self {
    let on_err = other.clone();
    self
      .on_success(move |value| other.resolve(value))
      .on_error(move |err| on_err.fail(err))
  }

  /// Like [`AsyncRequest::forward_to`], converting the value on the way.
  pub fn forward_map<U, F>(self, other: AsyncRequest<U>, map: F) -> Self
  where
    U: Send + 'static,
    F: FnOnce(T) -> U + Send + 'static,
  {
    let on_err = other.clone();
    self
      .on_success(move |value| other.resolve(map(value)))
      .on_error(move |err| on_err.fail(err))
  }

  /// Hand `value` to the next stage, or to the success handler once no
  /// stages remain.
  pub fn resolve(&self, value: T) {
    let mut inner = self.inner.lock();
    if !matches!(inner.state, State::Pending) {
      drop(inner);
      protocol_violation("resolve");
      return;
    }

    if let Some(stage) = inner.stages.pop_front() {
      drop(inner);
      stage(value, self.clone());
      return;
    }

    match inner.on_success.take() {
      Some(handler) => {
        inner.state = State::Finished;
        drop(inner);
        handler(value);
      }
      None => {
        tracing::debug!("request resolved before a success handler was registered");
        inner.state = State::Buffered(Ok(value));
      }
    }
  }

  /// Switch permanently to the error path. Remaining stages are discarded.
  pub fn fail(&self, err: Error) {
    let mut inner = self.inner.lock();
    if !matches!(inner.state, State::Pending) {
      drop(inner);
      protocol_violation("fail");
      return;
    }
    inner.stages.clear();

    let err = match err {
      Error::Validation(errors) => match inner.on_validation_error.take() {
        Some(handler) => {
          inner.state = State::Finished;
          drop(inner);
          handler(errors);
          return;
        }
        None => Error::Validation(errors),
      },
      other => other,
    };

    match inner.on_error.take() {
      Some(handler) => {
        inner.state = State::Finished;
        drop(inner);
        handler(err);
      }
      None => {
        tracing::debug!(error = %err, "request failed before an error handler was registered");
        inner.state = State::Buffered(Err(err));
      }
    }
  }
}

fn protocol_violation(call: &str) {
  tracing::error!(call, "request already completed; second completion ignored");
  debug_assert!(false, "AsyncRequest completed twice (second call: {})", call);
}

impl<T: Send + 'static> IntoFuture for AsyncRequest<T> {
  type Output = Result<T>;
  type IntoFuture = BoxFuture<'static, Result<T>>;

  fn into_future(self) -> Self::IntoFuture {
    let (tx, rx) = oneshot::channel();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let tx_err = tx.clone();

    self
      .on_success(move |value| {
        if let Some(tx) = tx.lock().take() {
          let _ = tx.send(Ok(value));
        }
      })
      .on_error(move |err| {
        if let Some(tx) = tx_err.lock().take() {
          let _ = tx.send(Err(err));
        }
      });

    Box::pin(async move {
      rx.await
        .unwrap_or_else(|_| Err(Error::Request("request dropped before it completed".into())))
    })
  }
}
