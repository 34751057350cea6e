// rust/mlsync-core/src/sync.rs

//! Periodic cluster reconciliation.
//!
//! Each cycle runs three phases in order:
//!
//! 1. **Gathering**: ask every node in the directory for its snapshot.
//! 2. **Reconciling**: rebuild the routing table and running task index from
//!    the snapshots that arrived.
//! 3. **Broadcasting**: push the rebuilt tables (or `clear_all`) to every
//!    node.
//!
//! Cycles are single-flight. A tick that fires while a cycle is still running
//! is dropped and counted, never queued. Failed nodes are logged; they
//! contribute nothing to the cycle unless grace cycles are configured.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::{ArcSwap, ArcSwapOption};
use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SyncConfig;
use crate::directory::NodeDirectory;
use crate::protocol::{NodeId, NodeRequest, NodeSnapshot, SyncRequest, SyncResponse};
use crate::reconcile::{reconcile, Reconciled};
use crate::stats::NodeStats;
use crate::tasks::TaskManager;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncPhase {
    Idle,
    Gathering,
    Reconciling,
    Broadcasting,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Gathering,
            2 => Self::Reconciling,
            3 => Self::Broadcasting,
            _ => Self::Idle,
        }
    }
}

/// Summary of one completed cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub cycle: u64,
    pub responded: Vec<NodeId>,
    pub failed_gather: Vec<NodeId>,
    /// Silent nodes whose previous snapshot was reused this cycle.
    pub carried_over: Vec<NodeId>,
    pub cleared: bool,
    pub routed_models: usize,
    pub running_tasks: usize,
    pub failed_broadcast: Vec<NodeId>,
    pub finished_at: DateTime<Utc>,
}

struct LastSeen {
    snapshot: NodeSnapshot,
    missed: u32,
}

pub struct SyncCoordinator {
    directory: Arc<dyn NodeDirectory>,
    transport: Arc<dyn Transport>,
    stats: Arc<NodeStats>,
    tasks: Option<Arc<TaskManager>>,
    fan_out_timeout: Duration,
    grace_cycles: u32,

    in_flight: AtomicBool,
    phase: AtomicU8,
    cycles: AtomicU64,
    latest: ArcSwap<Reconciled>,
    last_report: ArcSwapOption<CycleReport>,
    last_seen: Mutex<HashMap<NodeId, LastSeen>>,
}

/// Clears the single-flight flag when a cycle ends, including on panic.
struct InFlightGuard<'a> {
    coordinator: &'a SyncCoordinator,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.coordinator.set_phase(SyncPhase::Idle);
        self.coordinator.in_flight.store(false, Ordering::Release);
    }
}

impl SyncCoordinator {
    pub fn new(
        directory: Arc<dyn NodeDirectory>,
        transport: Arc<dyn Transport>,
        stats: Arc<NodeStats>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            directory,
            transport,
            stats,
            tasks: None,
            fan_out_timeout: Duration::from_millis(config.fan_out_timeout_ms),
            grace_cycles: config.silent_node_grace_cycles,
            in_flight: AtomicBool::new(false),
            phase: AtomicU8::new(SyncPhase::Idle as u8),
            cycles: AtomicU64::new(0),
            latest: ArcSwap::from_pointee(Reconciled::default()),
            last_report: ArcSwapOption::empty(),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Feed every reconciled cycle to `tasks` so dispatched tasks advance.
    pub fn with_task_manager(mut self, tasks: Arc<TaskManager>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    /// Tables from the last completed reconciliation.
    pub fn latest(&self) -> Arc<Reconciled> {
        self.latest.load_full()
    }

    pub fn last_report(&self) -> Option<Arc<CycleReport>> {
        self.last_report.load_full()
    }

    pub fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: SyncPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Run one cycle unless another is in flight.
    ///
    /// Returns `None` when the tick was dropped.
    pub async fn tick(&self) -> Option<CycleReport> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            self.stats.record_skipped_tick();
            tracing::debug!("Sync cycle still running, skipping tick");
            return None;
        }
        let _guard = InFlightGuard { coordinator: self };
        Some(self.run_cycle().await)
    }

    async fn run_cycle(&self) -> CycleReport {
        let cycle = self.cycles.fetch_add(1, Ordering::Relaxed) + 1;
        let nodes = self.directory.list_all_nodes();

        // Gathering
        self.set_phase(SyncPhase::Gathering);
        let request = NodeRequest::Sync(SyncRequest {
            want_loaded_models: true,
        });
        let gathered = self
            .transport
            .fan_out(&nodes, request, self.fan_out_timeout)
            .await
            .try_map(|node, response| {
                let response: SyncResponse = response.into_sync(node)?;
                let mut snapshot = NodeSnapshot::from(response);
                snapshot.node_id = node.to_string();
                Ok(snapshot)
            });

        for failure in &gathered.failures {
            tracing::warn!(
                cycle,
                node_id = %failure.node_id,
                reason = %failure.reason,
                timed_out = failure.timed_out,
                "Node did not report state"
            );
        }
        self.stats.record_transport_failures(gathered.failures.len());

        let responded = gathered.responded_nodes();
        let failed_gather = gathered.failed_nodes();
        let mut snapshots: Vec<NodeSnapshot> =
            gathered.responses.into_iter().map(|(_, s)| s).collect();
        let carried_over = self
            .apply_grace(&nodes, &mut snapshots, &failed_gather)
            .await;

        // Reconciling
        self.set_phase(SyncPhase::Reconciling);
        let reconciled = reconcile(&snapshots);
        if let Some(tasks) = &self.tasks {
            tasks.observe(&reconciled.routing_table, &reconciled.running_tasks);
        }
        let broadcast = reconciled.to_broadcast();
        let cleared = broadcast.clear_all;
        let routed_models = reconciled.routing_table.len();
        let running_tasks = reconciled.running_tasks.len();
        self.latest.store(Arc::new(reconciled));

        // Broadcasting
        self.set_phase(SyncPhase::Broadcasting);
        let acked = self
            .transport
            .fan_out(
                &nodes,
                NodeRequest::Broadcast(broadcast),
                self.fan_out_timeout,
            )
            .await
            .try_map(|node, response| response.into_broadcast(node));
        for failure in &acked.failures {
            tracing::warn!(
                cycle,
                node_id = %failure.node_id,
                reason = %failure.reason,
                "Routing broadcast not applied"
            );
        }
        self.stats.record_transport_failures(acked.failures.len());
        self.stats.record_sync_cycle();

        let report = CycleReport {
            cycle,
            responded,
            failed_gather,
            carried_over,
            cleared,
            routed_models,
            running_tasks,
            failed_broadcast: acked.failed_nodes(),
            finished_at: Utc::now(),
        };

        tracing::info!(
            cycle,
            responded = report.responded.len(),
            failed = report.failed_gather.len(),
            cleared,
            routed_models,
            running_tasks,
            "Sync cycle complete"
        );

        self.last_report.store(Some(Arc::new(report.clone())));
        report
    }

    /// Remember fresh snapshots and, within the grace window, stand in for
    /// nodes that stayed silent. Returns the nodes stood in for.
    async fn apply_grace(
        &self,
        nodes: &[NodeId],
        snapshots: &mut Vec<NodeSnapshot>,
        failed: &[NodeId],
    ) -> Vec<NodeId> {
        if self.grace_cycles == 0 {
            return Vec::new();
        }

        let mut last_seen = self.last_seen.lock().await;
        last_seen.retain(|node, _| nodes.contains(node));

        for snapshot in snapshots.iter() {
            last_seen.insert(
                snapshot.node_id.clone(),
                LastSeen {
                    snapshot: snapshot.clone(),
                    missed: 0,
                },
            );
        }

        let mut carried = Vec::new();
        for node in failed {
            let Some(seen) = last_seen.get_mut(node) else {
                continue;
            };
            seen.missed += 1;
            if seen.missed > self.grace_cycles {
                last_seen.remove(node);
                continue;
            }
            tracing::debug!(node_id = %node, missed = seen.missed, "Reusing last snapshot of silent node");
            snapshots.push(seen.snapshot.clone());
            carried.push(node.clone());
        }
        carried
    }

    /// Run cycles every `interval` until `shutdown` flips to `true`.
    ///
    /// Each tick is spawned, so a slow cycle makes later ticks hit the
    /// single-flight check instead of piling up.
    pub fn spawn(
        self: Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            tracing::info!(interval_ms = interval.as_millis() as u64, "Sync loop started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let coordinator = Arc::clone(&self);
                        tokio::spawn(async move {
                            coordinator.tick().await;
                        });
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Sync loop stopped");
        })
    }
}
