use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;

/// Change callback registered by one client session.
pub type Callback = Arc<dyn Fn() + Send + Sync>;

struct Listener {
    session: String,
    callback: Callback,
    // Runtime the subscriber lived on when it subscribed. Notifications run
    // there, never on the publisher's task.
    context: Option<Handle>,
}

/// Session-keyed publish/subscribe of "something changed" notifications.
///
/// Subscribing the same session twice registers it twice and it is then
/// notified twice per publish; callers subscribe once per session.
#[derive(Default)]
pub struct NotificationHub {
    listeners: Mutex<Vec<Listener>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `callback` for `session`; returns the new listener count.
    pub fn subscribe(&self, session: impl Into<String>, callback: impl Fn() + Send + Sync + 'static) -> usize {
        let mut listeners = self.lock();
        listeners.push(Listener {
            session: session.into(),
            callback: Arc::new(callback),
            context: Handle::try_current().ok(),
        });
        listeners.len()
    }

    /// Drops every registration of `session`; returns the remaining count.
    pub fn unsubscribe(&self, session: &str) -> usize {
        let mut listeners = self.lock();
        listeners.retain(|l| l.session != session);
        listeners.len()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().len()
    }

    pub fn publish(&self) {
        let targets: Vec<(Option<Handle>, Callback)> = self
            .lock()
            .iter()
            .map(|l| (l.context.clone(), l.callback.clone()))
            .collect();

        for (context, callback) in targets {
            match context {
                Some(handle) => {
                    handle.spawn(async move { callback() });
                }
                None => callback(),
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Listener>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}
