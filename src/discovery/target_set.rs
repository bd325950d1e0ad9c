use std::sync::Arc;

use indexmap::IndexMap;
use tokio::sync::mpsc;
use tracing::Instrument;
use tripwire::{Trigger, Tripwire};

use super::{Error, Provider, Update, Updates};
use crate::target::TargetGroup;

/// Capacity of the channel between providers and the target set.
const UPDATES_BUFFER: usize = 16;

/// Receives the full, merged view of all running providers.
pub trait Syncer: Send + Sync + 'static {
    fn sync(&self, groups: &[TargetGroup]);
}

enum Command {
    Update(Vec<Provider>),
    Resync,
}

/// Handle of a running target set, the work itself happens in the [`Driver`].
#[derive(Clone)]
pub struct TargetSet {
    commands: mpsc::UnboundedSender<Command>,
}

impl TargetSet {
    pub fn new(syncer: Arc<dyn Syncer>) -> (TargetSet, Driver) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (updates_tx, updates_rx) = mpsc::channel(UPDATES_BUFFER);

        let driver = Driver {
            syncer,
            commands: commands_rx,
            updates_tx,
            updates_rx,
            generation: 0,
            running: None,
            groups: vec![],
            synced: false,
        };

        (
            TargetSet {
                commands: commands_tx,
            },
            driver,
        )
    }

    /// Stop every running provider and start the given ones instead.
    pub fn update_providers(&self, providers: Vec<Provider>) -> Result<(), Error> {
        self.commands
            .send(Command::Update(providers))
            .map_err(|_| Error::Stopped)
    }

    /// Deliver the current view again, without touching the providers.
    pub fn resync(&self) -> Result<(), Error> {
        self.commands
            .send(Command::Resync)
            .map_err(|_| Error::Stopped)
    }
}

/// The background loop, merging provider updates and calling the syncer.
pub struct Driver {
    syncer: Arc<dyn Syncer>,

    commands: mpsc::UnboundedReceiver<Command>,
    updates_tx: mpsc::Sender<Update>,
    updates_rx: mpsc::Receiver<Update>,

    // bumped on every provider update, so late updates of stopped providers
    // can be told apart
    generation: u64,
    running: Option<Trigger>,

    // latest groups of each provider, keyed by group source
    groups: Vec<(String, IndexMap<String, TargetGroup>)>,
    // whether the current generation has delivered anything yet
    synced: bool,
}

impl Driver {
    pub async fn run(mut self, mut shutdown: Tripwire) {
        debug!(message = "target set started");

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                command = self.commands.recv() => match command {
                    Some(Command::Update(providers)) => self.replace(providers),
                    Some(Command::Resync) => {
                        if self.synced {
                            self.sync();
                        }
                    }
                    // every handle is dropped
                    None => break,
                },

                Some(update) = self.updates_rx.recv() => {
                    let mut changed = self.apply(update);

                    // coalesce whatever else is already queued
                    while let Ok(update) = self.updates_rx.try_recv() {
                        changed |= self.apply(update);
                    }

                    if changed {
                        self.sync();
                    }
                }
            }
        }

        self.stop_providers();

        debug!(message = "target set stopped");
    }

    fn stop_providers(&mut self) {
        if let Some(trigger) = self.running.take() {
            trigger.cancel();
        }
    }

    fn replace(&mut self, providers: Vec<Provider>) {
        self.stop_providers();

        self.generation += 1;
        self.synced = false;
        self.groups = providers
            .iter()
            .map(|(name, _)| (name.clone(), IndexMap::new()))
            .collect();

        info!(
            message = "update providers",
            generation = self.generation,
            providers = ?self.groups.iter().map(|(name, _)| name.as_str()).collect::<Vec<_>>(),
        );

        if providers.is_empty() {
            self.sync();
            return;
        }

        let (trigger, _) = Tripwire::new(format!("providers-{}", self.generation));
        for (index, (name, discoverer)) in providers.into_iter().enumerate() {
            let updates = Updates {
                generation: self.generation,
                provider: index,
                tx: self.updates_tx.clone(),
            };

            let span = info_span!("provider", name = %name);
            tokio::spawn(discoverer.run(trigger.tripwire(), updates).instrument(span));
        }

        self.running = Some(trigger);
    }

    /// Returns false if the update came from a stopped provider.
    fn apply(&mut self, update: Update) -> bool {
        if update.generation != self.generation {
            trace!(
                message = "discard stale update",
                generation = update.generation,
                current = self.generation
            );

            return false;
        }

        let Some((name, groups)) = self.groups.get_mut(update.provider) else {
            return false;
        };

        trace!(message = "provider update", provider = %name, groups = update.groups.len());

        for group in update.groups {
            if group.is_empty() {
                groups.shift_remove(&group.source);
            } else {
                groups.insert(group.source.clone(), group);
            }
        }

        true
    }

    fn sync(&mut self) {
        let all = self
            .groups
            .iter()
            .flat_map(|(_, groups)| groups.values().cloned())
            .collect::<Vec<_>>();

        self.synced = true;
        self.syncer.sync(&all);
    }
}
