//! Typed live-query handle

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;

use crate::backend::{Listener, Snapshot};
use crate::error::{ChatError, ChatResult};

type Decode<T> = fn(&[Snapshot]) -> ChatResult<Vec<T>>;

/// Stream of full, ordered result sets for one live query.
///
/// Every item is the complete current list, never a delta. The stream ends
/// only when the backend stops; dropping the handle or calling
/// [`Subscription::unsubscribe`] releases the underlying query.
pub struct Subscription<T> {
    listener: Listener,
    decode: Decode<T>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(listener: Listener, decode: Decode<T>) -> Self {
        Self { listener, decode }
    }

    /// Wait for the next full snapshot.
    pub async fn recv(&mut self) -> Option<ChatResult<Vec<T>>> {
        let item = self.listener.recv().await?;
        Some(self.convert(item))
    }

    /// Release the live query. Consumes the handle, so it can only happen once.
    pub fn unsubscribe(self) {
        tracing::debug!("Releasing live query");
    }

    fn convert(&self, item: anyhow::Result<Vec<Snapshot>>) -> ChatResult<Vec<T>> {
        let snapshots = item.map_err(ChatError::Backend)?;
        (self.decode)(&snapshots)
    }
}

impl<T> Stream for Subscription<T> {
    type Item = ChatResult<Vec<T>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        this.listener
            .poll_recv(cx)
            .map(|item| item.map(|i| this.convert(i)))
    }
}
