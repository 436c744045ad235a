// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! The opaque error value carried by failed futures and streams.

use std::error::Error as StdError;
use std::fmt::{self, Debug, Display};
use std::sync::Arc;

/// An opaque, cheaply clonable error produced by an asynchronous
/// computation.
///
/// A `TaskError` travels through combinator chains until a catch combinator
/// handles it or a consumer unwraps it from `get()`. The concrete payload
/// can be recovered with [`TaskError::downcast_ref`], which is what the
/// typed catch combinators are built on.
///
/// Cloning is cheap (the payload is shared), so the same failure can be
/// observed by every future downstream of the producer that raised it.
#[derive(Clone)]
pub struct TaskError(Arc<anyhow::Error>);

impl TaskError {
    /// Wraps a concrete error value.
    pub fn new<E>(error: E) -> TaskError
    where
        E: StdError + Send + Sync + 'static,
    {
        TaskError(Arc::new(anyhow::Error::new(error)))
    }

    /// Creates an error from a printable message.
    pub fn msg<M>(message: M) -> TaskError
    where
        M: Display + Debug + Send + Sync + 'static,
    {
        TaskError(Arc::new(anyhow::Error::msg(message)))
    }

    /// Returns true if the payload is of type `E`.
    pub fn is<E>(&self) -> bool
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.is::<E>()
    }

    /// Returns a reference to the payload if it is of type `E`.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: Display + Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Display::fmt(&*self.0, f)
    }
}

impl Debug for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}

impl StdError for TaskError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.0.source()
    }
}

impl From<anyhow::Error> for TaskError {
    fn from(error: anyhow::Error) -> TaskError {
        TaskError(Arc::new(error))
    }
}

/// Result alias used throughout the crate: the error side is always the
/// opaque [`TaskError`].
pub type Result<T> = std::result::Result<T, TaskError>;
