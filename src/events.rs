//! Observer list for connection and routing notifications.

use crate::connection::ConnectionHandle;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Notification emitted by the handle and the router. Listeners get a borrowed view.
#[derive(Debug)]
pub enum TenancyEvent<'a> {
    /// A handle finished (re)connecting; caches keyed on the connection should resync.
    PostConnect(&'a ConnectionHandle),
    /// The router selected a new tenant.
    TenantSwitch {
        tenant_id: i64,
        database_name: &'a str,
    },
}

pub type Listener = Arc<dyn Fn(&TenancyEvent<'_>) + Send + Sync>;

/// Cloning shares the listener list.
#[derive(Clone, Default)]
pub struct EventBus {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("listeners", &self.len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, listener: F)
    where
        F: Fn(&TenancyEvent<'_>) + Send + Sync + 'static,
    {
        let mut guard = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        guard.push(Arc::new(listener));
    }

    pub fn has_listeners(&self) -> bool {
        self.len() > 0
    }

    pub fn len(&self) -> usize {
        self.listeners.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Fire-and-forget delivery. The list is snapshotted so listeners may register others.
    pub fn notify(&self, event: &TenancyEvent<'_>) {
        let snapshot: Vec<Listener> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in snapshot {
            listener(event);
        }
    }
}
