// Copyright 2019 TiKV Project Authors. Licensed under Apache-2.0.

//! Single-assignment results handed back to callers of a group.
//!
//! A [`Promise`] is completed exactly once by the group, the matching
//! [`Future`] resolves to that value. Dropping an uncompleted promise
//! resolves the future with [`Error::Stopped`].

use std::future::Future as StdFuture;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::errors::{Error, Result};

/// Creates a connected promise and future.
pub fn pair<T>() -> (Promise<T>, Future<T>) {
    let (tx, rx) = oneshot::channel();
    (Promise { tx: Some(tx) }, Future { rx })
}

/// The completing side.
#[derive(Debug)]
pub struct Promise<T> {
    tx: Option<oneshot::Sender<Result<T>>>,
}

impl<T> Promise<T> {
    /// Resolves the future with a value.
    pub fn respond(&mut self, value: T) {
        self.complete(Ok(value))
    }

    /// Resolves the future with an error.
    pub fn fail(&mut self, err: Error) {
        self.complete(Err(err))
    }

    /// Resolves the future with `res`.
    pub fn complete(&mut self, res: Result<T>) {
        match self.tx.take() {
            // The caller may have given up waiting.
            Some(tx) => {
                let _ = tx.send(res);
            }
            None => debug_assert!(false, "promise completed twice"),
        }
    }

    /// Whether the promise has been completed.
    pub fn is_completed(&self) -> bool {
        self.tx.is_none()
    }
}

impl<T> Drop for Promise<T> {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Err(Error::Stopped));
        }
    }
}

/// The waiting side, resolving to the result of a proposal or read.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct Future<T> {
    rx: oneshot::Receiver<Result<T>>,
}

impl<T> Future<T> {
    /// A future that is already resolved.
    pub fn ready(res: Result<T>) -> Future<T> {
        let (mut p, f) = pair();
        p.complete(res);
        f
    }

    /// Returns the result if it is available, without waiting.
    pub fn try_response(&mut self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(res) => Some(res),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(Error::Stopped)),
        }
    }
}

impl<T> StdFuture for Future<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or(Err(Error::Stopped)))
    }
}
