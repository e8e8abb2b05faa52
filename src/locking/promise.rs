// Copyright 2025 dentsusoken
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Settle-once promises used to report lock acquisition.
//!
//! A [`PromiseHolder`] lives inside the lock on the owning thread and owns the
//! sending half of a oneshot channel. Every [`Promise`] clone shares the
//! receiving half, so the outcome can be read with [`Promise::outcome`] or
//! awaited from another task. An already-settled promise is ready on its
//! first poll. A promise whose holder is dropped unsettled never resolves.

use futures::channel::oneshot::{self, Receiver, Sender};
use futures::future::{FutureExt, Shared};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

/// Observer side of a settle-once value.
pub struct Promise<T> {
    shared: Shared<Receiver<T>>,
    // Clone driven by `poll`, so `shared` can still be peeked after the
    // awaiting side has consumed its output.
    waiter: Option<Shared<Receiver<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            waiter: None,
        }
    }
}

impl<T: Clone> std::fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Promise")
            .field("settled", &self.is_settled())
            .finish()
    }
}

impl<T: Clone> Promise<T> {
    fn from_receiver(receiver: Receiver<T>) -> Self {
        Self {
            shared: receiver.shared(),
            waiter: None,
        }
    }

    /// Creates a promise that is settled from the start.
    pub fn settled(value: T) -> Self {
        let (sender, receiver) = oneshot::channel();
        // The receiver is alive, so the send cannot fail.
        let _ = sender.send(value);
        Self::from_receiver(receiver)
    }

    /// Returns the outcome if the promise has been settled.
    pub fn outcome(&self) -> Option<T> {
        if let Some(result) = self.shared.peek() {
            return result.as_ref().ok().cloned();
        }
        self.shared.clone().now_or_never().and_then(Result::ok)
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }
}

impl<T: Clone> Future for Promise<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if let Some(Ok(value)) = this.shared.peek() {
            this.waiter = None;
            return Poll::Ready(value.clone());
        }

        let waiter = this.waiter.get_or_insert_with(|| this.shared.clone());
        match Pin::new(waiter).poll(cx) {
            Poll::Ready(Ok(value)) => {
                this.waiter = None;
                Poll::Ready(value)
            }
            // The holder went away without settling.
            Poll::Ready(Err(oneshot::Canceled)) => {
                this.waiter = None;
                Poll::Pending
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Settling side of a promise, created lazily on the first `ensure`.
pub struct PromiseHolder<T> {
    sender: Option<Sender<T>>,
    promise: Option<Promise<T>>,
}

impl<T> Default for PromiseHolder<T> {
    fn default() -> Self {
        Self {
            sender: None,
            promise: None,
        }
    }
}

impl<T: Clone> PromiseHolder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the held promise, creating it if necessary.
    pub fn ensure(&mut self) -> Promise<T> {
        if let Some(promise) = &self.promise {
            return promise.clone();
        }
        let (sender, receiver) = oneshot::channel();
        let promise = Promise::from_receiver(receiver);
        self.sender = Some(sender);
        self.promise = Some(promise.clone());
        promise
    }

    pub fn is_empty(&self) -> bool {
        self.sender.is_none()
    }

    /// Settles the held promise and empties the holder. Returns `false` when
    /// nothing was held.
    pub fn settle(&mut self, value: T) -> bool {
        self.promise = None;
        let Some(sender) = self.sender.take() else {
            return false;
        };
        // Every observer may already be gone; the holder is settled either way.
        let _ = sender.send(value);
        true
    }
}
