use std::ops::Deref;
use std::sync::Arc;

use arc_swap::{ArcSwap, ArcSwapOption};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::instrument::WithSubscriber;
use tracing::{Dispatch, Instrument, Span, dispatcher};
use tripwire::{Trigger, Tripwire};

use crate::config::Config;
use crate::discovery::{self, Syncer, TargetSet, providers_from_config};
use crate::relabel;
use crate::target::{ADDRESS_LABEL, TargetGroup};

#[derive(Debug, Error)]
pub enum Error {
    #[error("server group is cancelled")]
    Cancelled,

    #[error("update providers failed, {0}")]
    Discovery(#[from] discovery::Error),
}

/// An immutable, published list of target URLs.
#[derive(Debug, Default, PartialEq)]
pub struct Snapshot {
    version: u64,
    targets: Vec<String>,
}

impl Snapshot {
    /// Increases with every publication, zero means nothing is published yet.
    #[inline]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[inline]
    pub fn targets(&self) -> &[String] {
        &self.targets
    }
}

impl Deref for Snapshot {
    type Target = [String];

    fn deref(&self) -> &Self::Target {
        &self.targets
    }
}

/// Runs `f` with the injected dispatcher as the default, if there is one.
fn scoped<R>(dispatch: Option<&Dispatch>, f: impl FnOnce() -> R) -> R {
    match dispatch {
        Some(dispatch) => dispatcher::with_default(dispatch, f),
        None => f(),
    }
}

struct Inner {
    span: Span,
    dispatch: Option<Dispatch>,

    config: ArcSwapOption<Config>,
    snapshot: ArcSwap<Snapshot>,

    // serializes relabel and publish, holds the last published version
    published: Mutex<u64>,

    ready_trigger: Mutex<Option<Trigger>>,
    ready: Tripwire,
}

impl Inner {
    fn in_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        scoped(self.dispatch.as_ref(), || self.span.in_scope(f))
    }

    fn latch_ready(&self) {
        if self.ready.cancelled() {
            return;
        }

        if let Some(trigger) = self.ready_trigger.lock().take() {
            info!(message = "server group is ready");

            trigger.cancel();
        }
    }

    fn publish(&self, groups: &[TargetGroup]) {
        let mut version = self.published.lock();

        let config = self.config.load_full().unwrap_or_default();
        let scheme = config.scheme();

        let mut targets = Vec::with_capacity(groups.iter().map(|group| group.targets.len()).sum());
        let mut dropped = 0usize;
        for group in groups {
            for labels in group.merged_targets() {
                let Some(labels) = relabel::process(labels, &config.relabel_configs) else {
                    dropped += 1;
                    continue;
                };

                let address = match labels.get(ADDRESS_LABEL) {
                    Some(address) => address.as_str(),
                    None => {
                        debug!(message = "target without address", source = %group.source, ?labels);
                        ""
                    }
                };

                targets.push(format!("{scheme}://{address}"));
            }
        }

        *version += 1;
        debug!(
            message = "publish targets",
            version = *version,
            groups = groups.len(),
            targets = targets.len(),
            dropped,
        );

        self.snapshot.store(Arc::new(Snapshot {
            version: *version,
            targets,
        }));
        drop(version);

        self.latch_ready();
    }
}

impl Syncer for Inner {
    fn sync(&self, groups: &[TargetGroup]) {
        self.in_scope(|| self.publish(groups))
    }
}

/// Builds a [`ServerGroup`] with a custom name or logging capability.
#[derive(Default)]
pub struct Builder {
    name: Option<String>,
    span: Option<Span>,
    dispatch: Option<Dispatch>,
}

impl Builder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Every log of the group, its target set and providers is emitted inside
    /// this span. Defaults to an `info` level `server_group` span carrying the
    /// group name.
    pub fn span(mut self, span: Span) -> Self {
        self.span = Some(span);
        self
    }

    /// Send the logs of this group to `dispatch` instead of the default
    /// subscriber.
    pub fn dispatch(mut self, dispatch: Dispatch) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    /// Creates the group and starts its discovery loop.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn build(self) -> ServerGroup {
        let name = self.name.unwrap_or_else(|| "default".to_string());
        let dispatch = self.dispatch;
        let span = match self.span {
            Some(span) => span,
            None => scoped(dispatch.as_ref(), || info_span!("server_group", name = %name)),
        };

        let (ready_trigger, ready) = Tripwire::new(format!("{name}-ready"));
        let (lifetime, shutdown) = Tripwire::new(name.clone());

        let inner = Arc::new(Inner {
            span: span.clone(),
            dispatch: dispatch.clone(),
            config: ArcSwapOption::empty(),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            published: Mutex::new(0),
            ready_trigger: Mutex::new(Some(ready_trigger)),
            ready,
        });

        let (target_set, driver) = TargetSet::new(Arc::clone(&inner) as Arc<dyn Syncer>);
        let task = driver.run(shutdown.clone()).instrument(span);
        match dispatch {
            Some(dispatch) => tokio::spawn(task.with_subscriber(dispatch)),
            None => tokio::spawn(task),
        };

        ServerGroup {
            name,
            inner,
            target_set,
            lifetime: Mutex::new(Some(lifetime)),
            shutdown,
        }
    }
}

/// Keeps the current list of target URLs of a group of servers.
///
/// Construction starts a background target set, [`apply_config`] tells it which
/// discovery sources to run, and every view they produce is relabeled and
/// published by [`sync`]. [`targets`] never blocks and never locks.
///
/// [`apply_config`]: ServerGroup::apply_config
/// [`sync`]: ServerGroup::sync
/// [`targets`]: ServerGroup::targets
pub struct ServerGroup {
    name: String,
    inner: Arc<Inner>,
    target_set: TargetSet,

    // also serializes apply_config, `None` once cancelled
    lifetime: Mutex<Option<Trigger>>,
    shutdown: Tripwire,
}

impl ServerGroup {
    /// Creates an unconfigured group named `default`.
    ///
    /// # Panics
    ///
    /// Panics if called outside of a Tokio runtime.
    pub fn new() -> ServerGroup {
        Builder::default().build()
    }

    pub fn builder() -> Builder {
        Builder::default()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The config applied last, if any.
    pub fn config(&self) -> Option<Arc<Config>> {
        self.inner.config.load_full()
    }

    /// Installs the config and reconfigures discovery to exactly its sources.
    ///
    /// Providers are only restarted when the discovery part of the config
    /// differs from the current one, otherwise the current targets are
    /// published again under the new rules and scheme.
    pub fn apply_config(&self, config: Config) -> Result<(), Error> {
        self.inner.in_scope(|| {
            // held until the command is sent, so cancel can't slip in between
            let lifetime = self.lifetime.lock();
            if lifetime.is_none() {
                return Err(Error::Cancelled);
            }

            let unchanged = match self.inner.config.load_full() {
                Some(current) => current.hosts == config.hosts,
                None => false,
            };
            let providers = if unchanged {
                None
            } else {
                Some(providers_from_config(&config.hosts)?)
            };

            info!(
                message = "apply config",
                scheme = config.scheme(),
                relabel_configs = config.relabel_configs.len(),
                restart_providers = providers.is_some(),
            );

            self.inner.config.store(Some(Arc::new(config)));

            let result = match providers {
                Some(providers) => self.target_set.update_providers(providers),
                None => self.target_set.resync(),
            };

            drop(lifetime);

            result.map_err(|_| Error::Cancelled)
        })
    }

    /// Relabels the full view of discovered target groups and publishes the
    /// result as the new snapshot. The first call marks the group ready.
    pub fn sync(&self, groups: &[TargetGroup]) {
        Syncer::sync(self.inner.as_ref(), groups)
    }

    /// The current snapshot, empty until the first sync.
    #[inline]
    pub fn targets(&self) -> Arc<Snapshot> {
        self.inner.snapshot.load_full()
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.inner.ready.cancelled()
    }

    /// Waits until the first snapshot is published. Returns an error if the
    /// group is cancelled before that.
    pub async fn ready(&self) -> Result<(), Error> {
        let mut ready = self.inner.ready.clone();
        let mut shutdown = self.shutdown.clone();

        tokio::select! {
            biased;

            _ = &mut ready => {},
            _ = &mut shutdown => {},
        }

        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::Cancelled)
        }
    }

    /// Stops the discovery loop. The last snapshot stays readable.
    pub fn cancel(&self) {
        if let Some(trigger) = self.lifetime.lock().take() {
            self.inner.in_scope(|| {
                info!(message = "cancel server group");

                trigger.cancel();
            });
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.shutdown.cancelled()
    }
}

impl Default for ServerGroup {
    fn default() -> Self {
        ServerGroup::new()
    }
}

impl Drop for ServerGroup {
    fn drop(&mut self) {
        self.cancel();
    }
}
