/*
 * smtpd - embeddable SMTP receiving server
 *
 * This program is free software: you can redistribute it and/or modify it under
 * the terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or any later version.
 *
 * This program is distributed in the hope that it will be useful, but WITHOUT
 * ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
 * FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * this program. If not, see https://www.gnu.org/licenses/.
 *
*/

use crate::message::Message;
use once_cell::sync::Lazy;
use std::sync::Arc;

/// Application callback invoked for each received [`Message`].
///
/// Handlers must not register new handlers on the chain they are being
/// dispatched from: dispatch holds the chain's shared lock.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    /// Handle one received message. The first error stops the chain and is
    /// reported by the dispatcher.
    async fn serve(&self, message: &Message) -> anyhow::Result<()>;
}

struct HandlerFn<F>(F);

#[async_trait::async_trait]
impl<F> Handler for HandlerFn<F>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync,
{
    async fn serve(&self, message: &Message) -> anyhow::Result<()> {
        (self.0)(message)
    }
}

/// An ordered chain of message handlers. Registration takes the exclusive
/// lock; dispatch takes the shared lock, so concurrent connections dispatch
/// in parallel.
#[derive(Default)]
pub struct ServeMux {
    chain: tokio::sync::RwLock<Vec<Box<dyn Handler>>>,
}

impl ServeMux {
    /// An empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a handler; dispatch order is registration order.
    pub async fn handle(&self, handler: Box<dyn Handler>) {
        self.chain.write().await.push(handler);
    }

    /// Append a plain function handler.
    pub async fn handle_fn<F>(&self, handler: F)
    where
        F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handle(Box::new(HandlerFn(handler))).await;
    }

    /// Invoke every handler in registration order, stopping at the first
    /// error and returning it.
    pub async fn serve(&self, message: &Message) -> anyhow::Result<()> {
        for handler in self.chain.read().await.iter() {
            handler.serve(message).await?;
        }
        Ok(())
    }
}

static DEFAULT_MUX: Lazy<Arc<ServeMux>> = Lazy::new(Arc::default);

/// The process-default handler chain, used by every listener that has no
/// dedicated chain of its own.
#[must_use]
pub fn default_mux() -> Arc<ServeMux> {
    Arc::clone(&DEFAULT_MUX)
}

/// Register a function handler on the process-default chain and return the
/// chain, creating it on first use.
pub async fn handle_fn<F>(handler: F) -> Arc<ServeMux>
where
    F: Fn(&Message) -> anyhow::Result<()> + Send + Sync + 'static,
{
    let mux = default_mux();
    mux.handle_fn(handler).await;
    mux
}
