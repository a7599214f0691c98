// Copyright 2025 The GridCQ Authors.
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

//! Point-to-point change channels between the transport and the core.
//!
//! Every server stream hands the core a `Box<dyn ChangeReceiver<CqEvent>>`.
//! The receiver returning `Err` means the stream is gone: the sending side
//! was dropped because the connection was torn down. Channels are strictly
//! 1-to-1 so a stream's events can never be observed by two consumers.
//!
//! ```text
//! Server A stream → [Channel] → forwarder (primary)   ┐
//! Server B stream → [Channel] → forwarder (standby)   ├→ SequenceQueue → EventDispatcher
//! Server C stream → [Channel] → forwarder (standby)   ┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Trait for dispatching changes to the single subscriber of a channel
#[async_trait]
pub trait ChangeDispatcher<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Dispatch a single change, waiting for capacity
    async fn dispatch_change(&self, change: Arc<T>) -> Result<()>;

    /// Dispatch without waiting; fails when the channel is full or closed
    fn try_dispatch_change(&self, change: Arc<T>) -> Result<()>;

    /// Create the receiver for this dispatcher
    async fn create_receiver(&self) -> Result<Box<dyn ChangeReceiver<T>>>;
}

/// Trait for receiving changes from a dispatcher
#[async_trait]
pub trait ChangeReceiver<T>: Send + Sync
where
    T: Clone + Send + Sync + 'static,
{
    /// Receive the next change; `Err` once the sending side is gone
    async fn recv(&mut self) -> Result<Arc<T>>;
}

/// Channel-based (MPSC) implementation of ChangeDispatcher
pub struct ChannelChangeDispatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    tx: mpsc::Sender<Arc<T>>,
    rx: Arc<tokio::sync::Mutex<Option<mpsc::Receiver<Arc<T>>>>>,
}

impl<T> ChannelChangeDispatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new channel dispatcher with specified capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self {
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(Some(rx))),
        }
    }
}

#[async_trait]
impl<T> ChangeDispatcher<T> for ChannelChangeDispatcher<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn dispatch_change(&self, change: Arc<T>) -> Result<()> {
        self.tx
            .send(change)
            .await
            .map_err(|_| anyhow::anyhow!("Failed to send on channel"))?;
        Ok(())
    }

    fn try_dispatch_change(&self, change: Arc<T>) -> Result<()> {
        self.tx.try_send(change).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => anyhow::anyhow!("Channel at capacity"),
            mpsc::error::TrySendError::Closed(_) => anyhow::anyhow!("Channel closed"),
        })
    }

    async fn create_receiver(&self) -> Result<Box<dyn ChangeReceiver<T>>> {
        // Only one receiver may exist per channel
        let mut rx_opt = self.rx.lock().await;
        let rx = rx_opt.take().ok_or_else(|| {
            anyhow::anyhow!("Receiver already created for this channel dispatcher")
        })?;
        Ok(Box::new(ChannelChangeReceiver { rx }))
    }
}

/// Channel-based (MPSC) implementation of ChangeReceiver
pub struct ChannelChangeReceiver<T>
where
    T: Clone + Send + Sync + 'static,
{
    rx: mpsc::Receiver<Arc<T>>,
}

#[async_trait]
impl<T> ChangeReceiver<T> for ChannelChangeReceiver<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn recv(&mut self) -> Result<Arc<T>> {
        self.rx
            .recv()
            .await
            .ok_or_else(|| anyhow::anyhow!("Channel closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct TestMessage {
        id: u32,
        content: String,
    }

    fn message(id: u32, content: &str) -> Arc<TestMessage> {
        Arc::new(TestMessage {
            id,
            content: content.to_string(),
        })
    }

    #[tokio::test]
    async fn test_channel_dispatcher_single_receiver() {
        let dispatcher = ChannelChangeDispatcher::<TestMessage>::new(100);
        let mut receiver = dispatcher.create_receiver().await.unwrap();

        let msg = message(1, "channel");
        dispatcher.dispatch_change(msg.clone()).await.unwrap();

        let received = receiver.recv().await.unwrap();
        assert_eq!(*received, *msg);
    }

    #[tokio::test]
    async fn test_channel_dispatcher_only_one_receiver() {
        let dispatcher = ChannelChangeDispatcher::<TestMessage>::new(100);
        let _receiver = dispatcher.create_receiver().await.unwrap();

        let second = dispatcher.create_receiver().await;
        assert!(second.is_err());
    }

    #[tokio::test]
    async fn test_channel_dispatcher_preserves_order() {
        let dispatcher = ChannelChangeDispatcher::<TestMessage>::new(100);
        let mut receiver = dispatcher.create_receiver().await.unwrap();

        let messages = vec![message(1, "first"), message(2, "second"), message(3, "third")];
        for msg in &messages {
            dispatcher.dispatch_change(msg.clone()).await.unwrap();
        }

        for expected in messages {
            let received = receiver.recv().await.unwrap();
            assert_eq!(received.id, expected.id);
        }
    }

    #[tokio::test]
    async fn test_try_dispatch_reports_full_channel() {
        let dispatcher = ChannelChangeDispatcher::<TestMessage>::new(1);
        let _receiver = dispatcher.create_receiver().await.unwrap();

        dispatcher.try_dispatch_change(message(1, "fits")).unwrap();
        let overflow = dispatcher.try_dispatch_change(message(2, "overflow"));
        assert!(overflow.is_err());
    }

    #[tokio::test]
    async fn test_receiver_errors_when_dispatcher_dropped() {
        let dispatcher = ChannelChangeDispatcher::<TestMessage>::new(10);
        let mut receiver = dispatcher.create_receiver().await.unwrap();
        dispatcher.dispatch_change(message(1, "last")).await.unwrap();
        drop(dispatcher);

        assert_eq!(receiver.recv().await.unwrap().id, 1);
        assert!(receiver.recv().await.is_err());
    }
}
