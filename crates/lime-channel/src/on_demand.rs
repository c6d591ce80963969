use std::fmt;
use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use futures_util::future::{BoxFuture, FutureExt};
use lime_envelope::{Command, Message, Notification};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::channel::Channel;
use crate::error::{ChannelError, Result};
use crate::established::EstablishChannel;
use crate::information::{ChannelInformation, FailedChannelInformation};

/// Observer of channel creation or discard.
pub type ChannelInformationHandler =
    Arc<dyn Fn(ChannelInformation) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Observer of a failure; returns whether the failed step should be retried.
pub type FailedChannelHandler =
    Arc<dyn Fn(FailedChannelInformation) -> BoxFuture<'static, bool> + Send + Sync>;

#[derive(Default)]
struct Handlers {
    created: RwLock<Vec<ChannelInformationHandler>>,
    discarded: RwLock<Vec<ChannelInformationHandler>>,
    creation_failed: RwLock<Vec<FailedChannelHandler>>,
    operation_failed: RwLock<Vec<FailedChannelHandler>>,
}

/// A client channel that is (re)established whenever it is needed.
///
/// The first operation builds and establishes a channel; later operations
/// reuse it while it stays usable. Concurrent callers that find no usable
/// channel share a single build. When an operation fails, the
/// operation-failed observers decide whether the channel is discarded and
/// the operation retried on a new one; when a build fails, the
/// creation-failed observers decide whether to build again. A failure is
/// retried only if every observer agrees, and every observer is called.
/// With no observers, failures are always retried.
///
/// Cancellation and usage errors are returned as they are.
pub struct OnDemandChannel {
    builder: Arc<dyn EstablishChannel>,
    current: RwLock<Option<Arc<Channel>>>,
    gate: Mutex<()>,
    disposed: CancellationToken,
    handlers: Handlers,
}

impl OnDemandChannel {
    pub fn new<B>(builder: B) -> Self
    where
        B: EstablishChannel + 'static,
    {
        Self::from_arc(Arc::new(builder))
    }

    pub fn from_arc(builder: Arc<dyn EstablishChannel>) -> Self {
        Self {
            builder,
            current: RwLock::new(None),
            gate: Mutex::new(()),
            disposed: CancellationToken::new(),
            handlers: Handlers::default(),
        }
    }

    /// Called after a channel is established, before it is used.
    pub fn on_channel_created<F, Fut>(&self, handler: F)
    where
        F: Fn(ChannelInformation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        push::<ChannelInformationHandler>(
            &self.handlers.created,
            Arc::new(move |information| handler(information).boxed()),
        );
    }

    /// Called after a channel is closed and dropped.
    pub fn on_channel_discarded<F, Fut>(&self, handler: F)
    where
        F: Fn(ChannelInformation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        push::<ChannelInformationHandler>(
            &self.handlers.discarded,
            Arc::new(move |information| handler(information).boxed()),
        );
    }

    pub fn on_channel_creation_failed<F, Fut>(&self, handler: F)
    where
        F: Fn(FailedChannelInformation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        push::<FailedChannelHandler>(
            &self.handlers.creation_failed,
            Arc::new(move |failure| handler(failure).boxed()),
        );
    }

    pub fn on_channel_operation_failed<F, Fut>(&self, handler: F)
    where
        F: Fn(FailedChannelInformation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        push::<FailedChannelHandler>(
            &self.handlers.operation_failed,
            Arc::new(move |failure| handler(failure).boxed()),
        );
    }

    /// True while a usable channel is held.
    pub fn is_established(&self) -> bool {
        self.usable_channel().is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// Snapshot of the current channel, if one is held.
    pub fn information(&self) -> Option<ChannelInformation> {
        self.current_channel().map(|channel| channel.information())
    }

    pub async fn send_message(&self, message: Message, cancel: &CancellationToken) -> Result<()> {
        self.execute("SendMessage", cancel, |channel| {
            let message = message.clone();
            async move { channel.send_message(message, cancel).await }
        })
        .await
    }

    pub async fn receive_message(&self, cancel: &CancellationToken) -> Result<Message> {
        self.execute("ReceiveMessage", cancel, |channel| async move {
            channel.receive_message(cancel).await
        })
        .await
    }

    pub async fn send_notification(
        &self,
        notification: Notification,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.execute("SendNotification", cancel, |channel| {
            let notification = notification.clone();
            async move { channel.send_notification(notification, cancel).await }
        })
        .await
    }

    pub async fn receive_notification(&self, cancel: &CancellationToken) -> Result<Notification> {
        self.execute("ReceiveNotification", cancel, |channel| async move {
            channel.receive_notification(cancel).await
        })
        .await
    }

    pub async fn send_command(&self, command: Command, cancel: &CancellationToken) -> Result<()> {
        self.execute("SendCommand", cancel, |channel| {
            let command = command.clone();
            async move { channel.send_command(command, cancel).await }
        })
        .await
    }

    pub async fn receive_command(&self, cancel: &CancellationToken) -> Result<Command> {
        self.execute("ReceiveCommand", cancel, |channel| async move {
            channel.receive_command(cancel).await
        })
        .await
    }

    /// Send `request` and wait for its response.
    pub async fn process_command(
        &self,
        request: Command,
        cancel: &CancellationToken,
    ) -> Result<Command> {
        self.execute("ProcessCommand", cancel, |channel| {
            let request = request.clone();
            async move { channel.process_command(request, cancel).await }
        })
        .await
    }

    /// End the current session, if any, and discard its channel.
    ///
    /// The next operation establishes a new channel.
    pub async fn finish(&self, cancel: &CancellationToken) -> Result<()> {
        self.check_disposed()?;
        let _gate = self.enter(cancel).await?;
        let Some(channel) = self.take_current() else {
            return Ok(());
        };
        let result = if channel.is_usable() {
            finish_session(&channel, cancel).await
        } else {
            Ok(())
        };
        self.discard(channel).await;
        result
    }

    /// Release the current channel. Every later operation fails with
    /// [`ChannelError::Disposed`].
    pub async fn dispose(&self) {
        if self.disposed.is_cancelled() {
            return;
        }
        self.disposed.cancel();
        if let Some(channel) = self.take_current() {
            self.discard(channel).await;
        }
        debug!("on-demand channel disposed");
    }

    async fn execute<T, F, Fut>(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
        action: F,
    ) -> Result<T>
    where
        F: Fn(Arc<Channel>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            let channel = self.ensure_channel(operation, cancel).await?;
            let err = match action(Arc::clone(&channel)).await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            if self.is_disposed() {
                return Err(ChannelError::Disposed);
            }
            if err.is_cancelled() || err.is_usage_error() {
                return Err(err);
            }

            warn!(operation, error = %err, "channel operation failed");
            let failure = FailedChannelInformation::new(channel.information(), err.clone(), operation);
            if !should_retry(&self.handlers.operation_failed, failure).await {
                return Err(err);
            }
            self.discard_if_current(&channel).await;
        }
    }

    async fn ensure_channel(
        &self,
        operation: &'static str,
        cancel: &CancellationToken,
    ) -> Result<Arc<Channel>> {
        self.check_available(cancel)?;
        if let Some(channel) = self.usable_channel() {
            return Ok(channel);
        }

        let _gate = self.enter(cancel).await?;
        self.check_available(cancel)?;
        if let Some(channel) = self.usable_channel() {
            return Ok(channel);
        }
        if let Some(stale) = self.take_current() {
            self.discard(stale).await;
        }

        loop {
            let built = tokio::select! {
                biased;
                _ = self.disposed.cancelled() => Err(ChannelError::Disposed),
                built = self.builder.build_and_establish(cancel) => built,
            };
            match built {
                Ok(channel) => return self.adopt(channel).await,
                Err(err) if err.is_cancelled() || err.is_usage_error() => return Err(err),
                Err(err) => {
                    warn!(operation, error = %err, "channel creation failed");
                    let failure = FailedChannelInformation::new(
                        ChannelInformation::unavailable(),
                        err.clone(),
                        operation,
                    );
                    if !should_retry(&self.handlers.creation_failed, failure).await {
                        return Err(err);
                    }
                    self.check_available(cancel)?;
                }
            }
        }
    }

    /// Make `channel` current and tell the creation observers.
    async fn adopt(&self, channel: Arc<Channel>) -> Result<Arc<Channel>> {
        if self.is_disposed() {
            close_quietly(&channel).await;
            return Err(ChannelError::Disposed);
        }
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&channel));
        let information = channel.information();
        info!(session_id = ?information.session_id, "channel created");
        notify(&self.handlers.created, information).await?;
        Ok(channel)
    }

    async fn discard_if_current(&self, channel: &Arc<Channel>) {
        let _gate = self.gate.lock().await;
        let removed = {
            let mut current = self.current.write().unwrap_or_else(PoisonError::into_inner);
            if current
                .as_ref()
                .is_some_and(|held| Arc::ptr_eq(held, channel))
            {
                current.take()
            } else {
                None
            }
        };
        if let Some(channel) = removed {
            self.discard(channel).await;
        }
    }

    /// Close `channel` and tell the discard observers.
    async fn discard(&self, channel: Arc<Channel>) {
        close_quietly(&channel).await;
        let information = channel.information();
        debug!(session_id = ?information.session_id, "channel discarded");
        if let Err(err) = notify(&self.handlers.discarded, information).await {
            warn!(error = %err, "channel discarded handler failed");
        }
    }

    async fn enter(&self, cancel: &CancellationToken) -> Result<tokio::sync::MutexGuard<'_, ()>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ChannelError::Cancelled),
            _ = self.disposed.cancelled() => Err(ChannelError::Disposed),
            guard = self.gate.lock() => Ok(guard),
        }
    }

    fn check_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(ChannelError::Disposed);
        }
        Ok(())
    }

    fn check_available(&self, cancel: &CancellationToken) -> Result<()> {
        self.check_disposed()?;
        if cancel.is_cancelled() {
            return Err(ChannelError::Cancelled);
        }
        Ok(())
    }

    fn current_channel(&self) -> Option<Arc<Channel>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn usable_channel(&self) -> Option<Arc<Channel>> {
        self.current_channel().filter(|channel| channel.is_usable())
    }

    fn take_current(&self) -> Option<Arc<Channel>> {
        self.current
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl fmt::Debug for OnDemandChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OnDemandChannel")
            .field("current", &self.information())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn push<T>(list: &RwLock<Vec<T>>, handler: T) {
    list.write()
        .unwrap_or_else(PoisonError::into_inner)
        .push(handler);
}

fn snapshot<T: Clone>(list: &RwLock<Vec<T>>) -> Vec<T> {
    list.read().unwrap_or_else(PoisonError::into_inner).clone()
}

/// Call every observer; retry only if all of them agree.
async fn should_retry(
    handlers: &RwLock<Vec<FailedChannelHandler>>,
    failure: FailedChannelInformation,
) -> bool {
    let mut retry = true;
    for handler in snapshot(handlers) {
        retry &= handler(failure.clone()).await;
    }
    retry
}

async fn notify(
    handlers: &RwLock<Vec<ChannelInformationHandler>>,
    information: ChannelInformation,
) -> Result<()> {
    let mut errors = Vec::new();
    for handler in snapshot(handlers) {
        if let Err(err) = handler(information.clone()).await {
            errors.push(err);
        }
    }
    match ChannelError::aggregate(errors) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

async fn finish_session(channel: &Channel, cancel: &CancellationToken) -> Result<()> {
    channel.send_finishing_session(cancel).await?;
    channel.receive_finished_session(cancel).await?;
    Ok(())
}

async fn close_quietly(channel: &Channel) {
    if let Err(err) = channel.close(&CancellationToken::new()).await {
        debug!(error = %err, "channel close failed");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use lime_transport::{Transport, TransportError};
    use url::Url;

    use super::*;
    use crate::builder::ChannelBuilder;
    use crate::established::EstablishedChannelBuilder;
    use crate::testing::{echo_factory, ServerEnds};

    /// Counts builds and fails the first `failures` of them.
    struct FlakyBuilder {
        inner: EstablishedChannelBuilder,
        builds: AtomicUsize,
        failures: usize,
        delay: Duration,
    }

    #[async_trait]
    impl EstablishChannel for FlakyBuilder {
        async fn build_and_establish(&self, cancel: &CancellationToken) -> Result<Arc<Channel>> {
            let attempt = self.builds.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if attempt < self.failures {
                return Err(ChannelError::from(TransportError::Closed));
            }
            self.inner.build_and_establish(cancel).await
        }
    }

    fn flaky(failures: usize) -> (Arc<FlakyBuilder>, ServerEnds) {
        let (factory, servers) = echo_factory();
        let inner = ChannelBuilder::new(Url::parse("net.tcp://localhost").unwrap(), factory).established();
        let builder = Arc::new(FlakyBuilder {
            inner,
            builds: AtomicUsize::new(0),
            failures,
            delay: Duration::from_millis(20),
        });
        (builder, servers)
    }

    fn counter() -> Arc<AtomicUsize> {
        Arc::new(AtomicUsize::new(0))
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_build() {
        let (builder, _servers) = flaky(0);
        let on_demand = Arc::new(OnDemandChannel::from_arc(builder.clone()));
        let created = counter();
        let seen = Arc::clone(&created);
        on_demand.on_channel_created(move |_| {
            let seen = Arc::clone(&seen);
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let on_demand = Arc::clone(&on_demand);
                tokio::spawn(async move {
                    on_demand
                        .send_message(Message::text(format!("hello {i}")), &CancellationToken::new())
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(on_demand.is_established());
    }

    #[tokio::test]
    async fn failed_builds_are_retried_until_one_succeeds() {
        let (builder, _servers) = flaky(3);
        let on_demand = OnDemandChannel::from_arc(builder.clone());
        let failures = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&failures);
        on_demand.on_channel_creation_failed(move |failure: FailedChannelInformation| {
            record
                .lock()
                .unwrap()
                .push((failure.operation_name, failure.is_connected()));
            async { true }
        });
        let created = counter();
        let seen = Arc::clone(&created);
        on_demand.on_channel_created(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        on_demand
            .send_message(Message::text("hi"), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(builder.builds.load(Ordering::SeqCst), 4);
        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert_eq!(*failures.lock().unwrap(), vec![("SendMessage", false); 3]);
    }

    #[tokio::test]
    async fn every_observer_runs_and_any_veto_wins() {
        let (builder, _servers) = flaky(usize::MAX);
        let on_demand = OnDemandChannel::from_arc(builder.clone());
        let calls: Vec<_> = (0..3).map(|_| counter()).collect();
        for (index, calls) in calls.iter().enumerate() {
            let calls = Arc::clone(calls);
            on_demand.on_channel_creation_failed(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { index != 1 }
            });
        }

        let err = on_demand
            .receive_message(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
        for calls in &calls {
            assert_eq!(calls.load(Ordering::SeqCst), 1);
        }
    }

    #[tokio::test]
    async fn cancelled_operations_build_nothing() {
        let (builder, _servers) = flaky(0);
        let on_demand = OnDemandChannel::from_arc(builder.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = on_demand.receive_message(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn disposed_channel_refuses_everything() {
        let (builder, _servers) = flaky(0);
        let on_demand = OnDemandChannel::from_arc(builder.clone());
        let cancel = CancellationToken::new();
        on_demand.send_message(Message::text("hi"), &cancel).await.unwrap();

        let discarded = counter();
        let seen = Arc::clone(&discarded);
        on_demand.on_channel_discarded(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });
        on_demand.dispose().await;
        on_demand.dispose().await;
        assert!(on_demand.is_disposed());
        assert_eq!(discarded.load(Ordering::SeqCst), 1);

        assert!(matches!(
            on_demand.send_message(Message::text("again"), &cancel).await,
            Err(ChannelError::Disposed)
        ));
        assert!(matches!(
            on_demand.process_command(Command::ping("p1"), &cancel).await,
            Err(ChannelError::Disposed)
        ));
        assert!(matches!(on_demand.finish(&cancel).await, Err(ChannelError::Disposed)));
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn broken_channel_is_replaced_and_the_operation_retried() {
        let (builder, servers) = flaky(0);
        let on_demand = Arc::new(OnDemandChannel::from_arc(builder.clone()));
        let failed = Arc::new(StdMutex::new(Vec::new()));
        let record = Arc::clone(&failed);
        on_demand.on_channel_operation_failed(move |failure: FailedChannelInformation| {
            record.lock().unwrap().push(failure.operation_name);
            async { true }
        });

        let receiver = {
            let on_demand = Arc::clone(&on_demand);
            tokio::spawn(async move { on_demand.receive_message(&CancellationToken::new()).await })
        };
        wait_for(|| on_demand.is_established()).await;

        let first_server = Arc::clone(&servers.lock().unwrap()[0]);
        first_server.close(&CancellationToken::new()).await.unwrap();
        wait_for(|| builder.builds.load(Ordering::SeqCst) == 2 && on_demand.is_established()).await;

        let cancel = CancellationToken::new();
        on_demand.send_message(Message::text("echo me"), &cancel).await.unwrap();
        let echoed = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(echoed.content, serde_json::json!("echo me"));
        assert!(failed.lock().unwrap().contains(&"ReceiveMessage"));
    }

    #[tokio::test]
    async fn vetoed_operation_failure_keeps_the_error() {
        let (builder, servers) = flaky(0);
        let on_demand = Arc::new(OnDemandChannel::from_arc(builder.clone()));
        let vetoes = counter();
        let seen = Arc::clone(&vetoes);
        on_demand.on_channel_operation_failed(move |failure: FailedChannelInformation| {
            assert_eq!(failure.operation_name, "ReceiveMessage");
            seen.fetch_add(1, Ordering::SeqCst);
            async { false }
        });
        let discarded = counter();
        let seen = Arc::clone(&discarded);
        on_demand.on_channel_discarded(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        });

        let receiver = {
            let on_demand = Arc::clone(&on_demand);
            tokio::spawn(async move { on_demand.receive_message(&CancellationToken::new()).await })
        };
        wait_for(|| on_demand.is_established()).await;
        let server = Arc::clone(&servers.lock().unwrap()[0]);
        server.close(&CancellationToken::new()).await.unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, ChannelError::Transport(_)), "{err:?}");
        assert_eq!(vetoes.load(Ordering::SeqCst), 1);
        assert_eq!(discarded.load(Ordering::SeqCst), 0);
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn created_observer_errors_are_aggregated() {
        let (builder, _servers) = flaky(0);
        let on_demand = OnDemandChannel::from_arc(builder.clone());
        for name in ["first", "second"] {
            on_demand.on_channel_created(move |_| async move { Err(ChannelError::Hook(name.into())) });
        }

        let err = on_demand
            .send_message(Message::text("hi"), &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            ChannelError::Aggregate(errors) => {
                let messages: Vec<_> = errors.iter().map(ToString::to_string).collect();
                assert_eq!(
                    messages,
                    vec!["handler failed: first", "handler failed: second"]
                );
            }
            other => panic!("unexpected {other:?}"),
        }
        // The channel stays current after its observers complained.
        assert!(on_demand.is_established());
        assert_eq!(builder.builds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn finish_ends_the_session_and_next_use_rebuilds() {
        let (builder, _servers) = flaky(0);
        let on_demand = OnDemandChannel::from_arc(builder.clone());
        let cancel = CancellationToken::new();

        on_demand.finish(&cancel).await.unwrap();
        assert_eq!(builder.builds.load(Ordering::SeqCst), 0);

        on_demand.send_message(Message::text("one"), &cancel).await.unwrap();
        let session_id = on_demand.information().and_then(|info| info.session_id);
        on_demand.finish(&cancel).await.unwrap();
        assert!(on_demand.information().is_none());

        on_demand.send_message(Message::text("two"), &cancel).await.unwrap();
        assert_eq!(builder.builds.load(Ordering::SeqCst), 2);
        assert_ne!(on_demand.information().and_then(|info| info.session_id), session_id);
    }

    async fn wait_for(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }
}
