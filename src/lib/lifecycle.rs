use std::sync::{Arc, Mutex};

use anyhow::Result;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tracing::*;

use crate::protocol::MatchField;

/// Configuration items a switch reports as added or removed outside of polling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LifecycleItem {
    Flow {
        table_id: u8,
        priority: u16,
        cookie: u64,
        match_fields: Vec<MatchField>,
    },
    Group {
        group_id: u32,
    },
    Meter {
        meter_id: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ItemLifecycleEvent {
    Added(LifecycleItem),
    Removed(LifecycleItem),
}

#[derive(Clone)]
pub struct ItemLifecycleListener {
    callback: Arc<dyn Fn(ItemLifecycleEvent) -> BoxFuture<'static, Result<()>> + Send + Sync>,
}

impl std::fmt::Debug for ItemLifecycleListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemLifecycleListener").finish()
    }
}

impl ItemLifecycleListener {
    pub fn new<F, Fut>(callback: F) -> Self
    where
        F: Fn(ItemLifecycleEvent) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        Self {
            callback: Arc::new(move |event| Box::pin(callback(event))),
        }
    }

    fn call(&self, event: ItemLifecycleEvent) -> BoxFuture<'static, Result<()>> {
        (self.callback)(event)
    }
}

/// Per-device source of item lifecycle events. Holds at most one listener.
#[derive(Debug, Default)]
pub struct ItemLifecycleSource {
    listener: Mutex<Option<ItemLifecycleListener>>,
}

impl ItemLifecycleSource {
    pub fn set_listener(&self, listener: Option<ItemLifecycleListener>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = listener;
    }

    pub fn has_listener(&self) -> bool {
        self.listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }

    /// Hands the event to the registered listener, if any.
    pub async fn notify(&self, event: ItemLifecycleEvent) -> Result<()> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();

        let Some(listener) = listener else {
            trace!("No lifecycle listener registered, dropping {event:?}");
            return Ok(());
        };

        listener.call(event).await
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    #[tokio::test]
    async fn only_the_current_listener_is_called() {
        let source = ItemLifecycleSource::default();
        let (tx, mut rx) = mpsc::unbounded_channel();

        source
            .notify(ItemLifecycleEvent::Added(LifecycleItem::Group { group_id: 1 }))
            .await
            .unwrap();

        let first_tx = tx.clone();
        source.set_listener(Some(ItemLifecycleListener::new(move |event| {
            let tx = first_tx.clone();
            async move {
                tx.send(("first", event))?;
                Ok(())
            }
        })));

        let second_tx = tx.clone();
        source.set_listener(Some(ItemLifecycleListener::new(move |event| {
            let tx = second_tx.clone();
            async move {
                tx.send(("second", event))?;
                Ok(())
            }
        })));
        assert!(source.has_listener());

        let event = ItemLifecycleEvent::Removed(LifecycleItem::Meter { meter_id: 4 });
        source.notify(event.clone()).await.unwrap();
        assert_eq!(rx.try_recv().unwrap(), ("second", event));
        assert!(rx.try_recv().is_err());

        source.set_listener(None);
        assert!(!source.has_listener());
    }
}
