//! Keeps the partition consistent while cluster membership changes.
//!
//! On every membership change the [`HandoffManager`]:
//!
//! 1. Drops partition entries this silo no longer owns, and entries hosted
//!    on silos that are now dead.
//! 2. Groups the activations hosted here whose owner changed by their new
//!    owner and queues "accept existing registrations" batches for each.
//! 3. On the receiving side, replays accepted registrations through the
//!    normal first-writer-wins path and queues a destroy instruction for
//!    every activation that lost, on the silo hosting it.
//!
//! All cross-silo work goes through [`SiloOperationQueues`], one serial
//! queue per target silo. Work targeting a silo that is no longer active is
//! skipped rather than retried.

mod queue;

pub use queue::{PendingOperation, SiloOperationQueues};

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::FutureExt;
use tokio_util::sync::CancellationToken;

use crate::config::DirectoryConfig;
use crate::local::{ActivationSource, DirectoryTransport};
use crate::membership::{DirectoryMembership, SiloStatus, SiloStatusOracle};
use crate::model::{ActivationAddress, SiloAddress};
use crate::partition::DirectoryPartition;

/// Migrates and deduplicates registrations after membership changes.
pub struct HandoffManager {
    local_silo: SiloAddress,
    partition: Arc<DirectoryPartition>,
    transport: Arc<dyn DirectoryTransport>,
    activations: Arc<dyn ActivationSource>,
    oracle: Arc<dyn SiloStatusOracle>,
    queues: SiloOperationQueues,
    chunk_size: usize,
    this: Weak<HandoffManager>,
}

impl std::fmt::Debug for HandoffManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandoffManager")
            .field("local_silo", &self.local_silo)
            .field("chunk_size", &self.chunk_size)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl HandoffManager {
    /// Create a handoff manager for `local_silo`.
    pub fn new(
        local_silo: SiloAddress,
        config: &DirectoryConfig,
        partition: Arc<DirectoryPartition>,
        transport: Arc<dyn DirectoryTransport>,
        activations: Arc<dyn ActivationSource>,
        oracle: Arc<dyn SiloStatusOracle>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            local_silo,
            partition,
            transport,
            activations,
            oracle,
            queues: SiloOperationQueues::new(
                config.handoff_retry_delay(),
                config.handoff_max_attempts(),
                shutdown,
            ),
            chunk_size: config.handoff_chunk_size(),
            this: this.clone(),
        })
    }

    /// React to a membership change from `previous` to `current`.
    ///
    /// Purges the partition synchronously and queues re-registration
    /// batches; call [`quiesce`](Self::quiesce) to wait for them.
    pub fn process_membership_change(
        &self,
        previous: &DirectoryMembership,
        current: &DirectoryMembership,
    ) {
        let changes = current.snapshot().changes_since(previous.snapshot());
        tracing::info!(
            silo = %self.local_silo,
            added = ?changes.added,
            removed = ?changes.removed,
            died = ?changes.died,
            version = %current.snapshot().version,
            "Handoff: membership changed"
        );

        for silo in changes.removed.iter().chain(&changes.died) {
            self.queues.forget(silo);
        }

        let purged = self.partition.retain_activations(|grain, host| {
            current.owner(grain) == Some(&self.local_silo)
                && current.approximate_status(host) != SiloStatus::Dead
        });
        if purged > 0 {
            tracing::debug!(silo = %self.local_silo, purged, "Handoff: purged partition entries");
        }

        let mut batches: HashMap<SiloAddress, (Vec<ActivationAddress>, Vec<ActivationAddress>)> =
            HashMap::new();
        for activation in self.activations.local_activations() {
            let grain = &activation.address.grain;
            let Some(owner) = current.owner(grain) else {
                continue;
            };
            if previous.owner(grain) == Some(owner) {
                continue;
            }
            let batch = batches.entry(owner.clone()).or_default();
            if activation.single_activation {
                batch.0.push(activation.address);
            } else {
                batch.1.push(activation.address);
            }
        }

        for (owner, (single, multi)) in batches {
            for chunk in single.chunks(self.chunk_size) {
                self.enqueue_accept(&owner, chunk.to_vec(), Vec::new());
            }
            for chunk in multi.chunks(self.chunk_size) {
                self.enqueue_accept(&owner, Vec::new(), chunk.to_vec());
            }
        }
    }

    fn enqueue_accept(
        &self,
        target: &SiloAddress,
        single: Vec<ActivationAddress>,
        multi: Vec<ActivationAddress>,
    ) {
        let count = single.len() + multi.len();
        tracing::debug!(silo = %self.local_silo, target_silo = %target, count, "Handoff: queueing registrations");

        let this = self.this.clone();
        let target_silo = target.clone();
        self.queues.enqueue(
            target,
            PendingOperation::new(format!("accept {count} registrations"), move || {
                let this = this.clone();
                let target = target_silo.clone();
                let single = single.clone();
                let multi = multi.clone();
                async move {
                    let Some(this) = this.upgrade() else {
                        return Ok(());
                    };
                    if !this.oracle.is_active(&target) {
                        tracing::warn!(target_silo = %target, "Handoff: target not active, skipping batch");
                        return Ok(());
                    }
                    if target == this.local_silo {
                        this.accept_existing_registrations(single, multi);
                        Ok(())
                    } else {
                        this.transport
                            .accept_existing_registrations(&target, single, multi)
                            .await
                    }
                }
                .boxed()
            }),
        );
    }

    /// Replay registrations handed over by their hosting silos.
    ///
    /// Every single-activation registration that loses to an existing entry
    /// is a duplicate; a destroy instruction is queued for the silo hosting
    /// it. Returns the losers.
    pub fn accept_existing_registrations(
        &self,
        single: Vec<ActivationAddress>,
        multi: Vec<ActivationAddress>,
    ) -> Vec<ActivationAddress> {
        let mut losers = Vec::new();
        for address in single {
            let stored = self.partition.register_activation(&address, true);
            if stored.address.activation != address.activation {
                tracing::debug!(
                    grain = %address.grain,
                    loser = %address.silo,
                    winner = %stored.address.silo,
                    "Handoff: duplicate activation"
                );
                losers.push(address);
            }
        }
        for address in &multi {
            self.partition.register_activation(address, false);
        }

        let mut by_host: HashMap<SiloAddress, Vec<ActivationAddress>> = HashMap::new();
        for loser in &losers {
            by_host.entry(loser.silo.clone()).or_default().push(loser.clone());
        }
        for (host, duplicates) in by_host {
            self.enqueue_destroy(&host, duplicates);
        }
        losers
    }

    fn enqueue_destroy(&self, host: &SiloAddress, duplicates: Vec<ActivationAddress>) {
        let count = duplicates.len();
        tracing::info!(silo = %self.local_silo, host = %host, count, "Handoff: destroying duplicate activations");

        let this = self.this.clone();
        let host_silo = host.clone();
        self.queues.enqueue(
            host,
            PendingOperation::new(format!("destroy {count} duplicates"), move || {
                let this = this.clone();
                let host = host_silo.clone();
                let duplicates = duplicates.clone();
                async move {
                    let Some(this) = this.upgrade() else {
                        return Ok(());
                    };
                    if !this.oracle.is_active(&host) {
                        tracing::warn!(host = %host, "Handoff: host not active, skipping destroy");
                        return Ok(());
                    }
                    if host == this.local_silo {
                        this.activations.destroy_activations(duplicates).await;
                        Ok(())
                    } else {
                        this.transport.delete_activations(&host, duplicates).await
                    }
                }
                .boxed()
            }),
        );
    }

    /// Wait until every queued handoff operation has run or been dropped.
    pub async fn quiesce(&self) {
        self.queues.quiesce().await;
    }

    /// Operations dropped after exhausting their retries.
    pub fn dropped_operations(&self) -> u64 {
        self.queues.dropped()
    }
}
