use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use lime_envelope::{Command, Message, Notification, SessionState};
use tokio_util::sync::CancellationToken;

/// Inspects or rewrites envelopes of one kind as they cross the channel.
///
/// Modules run in registration order. Returning `None` drops the envelope:
/// an inbound one is not delivered, an outbound one is not sent.
#[async_trait]
pub trait ChannelModule<T: Send + 'static>: Send + Sync {
    /// Called after every session state change.
    async fn on_state_changed(&self, _state: SessionState) {}

    async fn on_receiving(&self, envelope: T, _cancel: &CancellationToken) -> Option<T> {
        Some(envelope)
    }

    async fn on_sending(&self, envelope: T, _cancel: &CancellationToken) -> Option<T> {
        Some(envelope)
    }
}

/// Ordered module chain for one envelope kind.
pub(crate) struct ModuleList<T: Send + 'static> {
    modules: RwLock<Vec<Arc<dyn ChannelModule<T>>>>,
}

impl<T: Send + 'static> ModuleList<T> {
    fn new() -> Self {
        Self {
            modules: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, module: Arc<dyn ChannelModule<T>>) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(module);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn snapshot(&self) -> Vec<Arc<dyn ChannelModule<T>>> {
        self.modules
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn clear(&self) {
        self.modules
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub(crate) async fn receiving(&self, mut envelope: T, cancel: &CancellationToken) -> Option<T> {
        for module in self.snapshot() {
            envelope = module.on_receiving(envelope, cancel).await?;
        }
        Some(envelope)
    }

    pub(crate) async fn sending(&self, mut envelope: T, cancel: &CancellationToken) -> Option<T> {
        for module in self.snapshot() {
            envelope = module.on_sending(envelope, cancel).await?;
        }
        Some(envelope)
    }

    async fn state_changed(&self, state: SessionState) {
        for module in self.snapshot() {
            module.on_state_changed(state).await;
        }
    }
}

/// Module chains for the three content kinds.
pub(crate) struct ChannelModules {
    pub(crate) message: ModuleList<Message>,
    pub(crate) notification: ModuleList<Notification>,
    pub(crate) command: ModuleList<Command>,
}

impl ChannelModules {
    pub(crate) fn new() -> Self {
        Self {
            message: ModuleList::new(),
            notification: ModuleList::new(),
            command: ModuleList::new(),
        }
    }

    /// Tell every module about `current`; drop them all when the session
    /// leaves `Established` or ends.
    pub(crate) async fn state_changed(&self, previous: SessionState, current: SessionState) {
        self.message.state_changed(current).await;
        self.notification.state_changed(current).await;
        self.command.state_changed(current).await;

        let left_established =
            previous == SessionState::Established && current != SessionState::Established;
        if left_established || current.is_terminal() {
            self.message.clear();
            self.notification.clear();
            self.command.clear();
        }
    }
}
