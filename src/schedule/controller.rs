//! The operator controller: admits, sequences, rate-limits, dispatches, and
//! retires operators.

use crate::core::cluster::ClusterInformer;
use crate::core::command::{ConfChangeType, HeartbeatSink, RegionCommand};
use crate::core::region::RegionInfo;
use crate::hooks;
use crate::metrics::SchedulerMetrics;
use crate::schedule::influence::OpInfluence;
use crate::schedule::operator::{OpHistory, OpKind, OpStatus, Operator};
use crate::schedule::records::{OperatorRecord, OperatorRecords};
use crate::schedule::step::OpStep;
use crate::schedule::store_limit::{StoreLimit, StoreLimitType};
use crate::schedule::waiting::{RandBuckets, WaitingOperatorStatus};
use crate::types::{Peer, RegionId, StoreId};
use parking_lot::RwLock;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Dispatch triggered by a region heartbeat.
pub const DISPATCH_FROM_HEARTBEAT: &str = "heartbeat";
/// Dispatch triggered by the timed push queue.
pub const DISPATCH_FROM_NOTIFIER: &str = "active push";
/// Dispatch performed right after admission.
pub const DISPATCH_FROM_CREATE: &str = "create";

/// How long finished step records stay in the history list.
const HISTORY_KEEP_TIME: Duration = Duration::from_secs(5 * 60);

/// Push cadence for data-movement steps.
const SLOW_NOTIFY_INTERVAL: Duration = Duration::from_secs(5);

/// Push cadence for leader and configuration-change steps.
const FAST_NOTIFY_INTERVAL: Duration = Duration::from_secs(2);

/// Interval of the background push tick.
pub const PUSH_OPERATOR_TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Base time, seconds, converting configured regions-per-minute limits into
/// per-second bucket rates.
pub const STORE_BALANCE_BASE_TIME: f64 = 60.0;

/// Push-queue entry: an operator and when to push it next.
#[derive(Debug)]
struct OperatorWithTime {
    op: Arc<Operator>,
    time: Instant,
}

impl PartialEq for OperatorWithTime {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time
    }
}

impl Eq for OperatorWithTime {}

impl PartialOrd for OperatorWithTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OperatorWithTime {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert for earliest-first ordering.
        other.time.cmp(&self.time)
    }
}

#[derive(Debug, Default)]
struct ControllerInner {
    operators: HashMap<RegionId, Arc<Operator>>,
    histories: VecDeque<OpHistory>,
    counts: HashMap<u32, u64>,
    wop: RandBuckets,
    wop_status: WaitingOperatorStatus,
    push_queue: BinaryHeap<OperatorWithTime>,
    stores_limit: HashMap<StoreId, HashMap<StoreLimitType, StoreLimit>>,
}

/// Admits, starts, dispatches, and retires operators, enforcing at most one
/// running operator per region and per-store movement limits.
pub struct OperatorController {
    cluster: Arc<dyn ClusterInformer>,
    sink: Arc<dyn HeartbeatSink>,
    metrics: Arc<SchedulerMetrics>,
    records: OperatorRecords,
    shutdown: CancellationToken,
    inner: RwLock<ControllerInner>,
}

impl std::fmt::Debug for OperatorController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("OperatorController")
            .field("running", &inner.operators.len())
            .field("waiting", &inner.wop.len())
            .field("push_queue", &inner.push_queue.len())
            .finish()
    }
}

impl OperatorController {
    /// Create a controller over the given cluster facade and command sink.
    pub fn new(
        cluster: Arc<dyn ClusterInformer>,
        sink: Arc<dyn HeartbeatSink>,
        metrics: Arc<SchedulerMetrics>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            cluster,
            sink,
            metrics,
            records: OperatorRecords::new(),
            shutdown,
            inner: RwLock::new(ControllerInner::default()),
        }
    }

    /// Cancellation signal tied to the cluster lifecycle.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Metrics handle.
    pub fn metrics(&self) -> &Arc<SchedulerMetrics> {
        &self.metrics
    }

    /// Dispatch the running operator of `region`, if any: advance its step
    /// cursor against the fresh region view, send the next step, or retire
    /// it.
    pub fn dispatch(&self, region: &RegionInfo, source: &str) {
        let Some(op) = self.get_operator(region.id()) else {
            return;
        };
        hooks::poke("concurrent-remove-operator");

        // Check advances past finished steps and may transition the status
        // to success or timeout.
        let step = op.check(region);

        match op.status() {
            OpStatus::Started => {
                self.metrics.operator_events.inc(op.desc(), "check");
                if source == DISPATCH_FROM_HEARTBEAT
                    && self.check_stale_operator(&op, step.as_ref(), region)
                {
                    return;
                }
                if let Some(step) = step {
                    self.send_schedule_command(region, &step, source);
                }
            }
            OpStatus::Success => {
                self.push_history(&op);
                if self.remove_operator(&op, None) {
                    self.promote_waiting_operator();
                }
            }
            OpStatus::Timeout => {
                if self.remove_operator(&op, None) {
                    self.promote_waiting_operator();
                }
            }
            status => {
                // Created and expired must not be dispatchable; canceled and
                // replaced are removed before their transition.
                if self.remove_operator_without_bury(&op) {
                    tracing::error!(
                        region_id = op.region_id(),
                        status = status.as_str(),
                        operator = %op,
                        "dispatching operator with unexpected status"
                    );
                    self.metrics.operator_events.inc(op.desc(), "unexpected");
                    hooks::poke("unexpected-operator");
                    op.cancel();
                    self.bury_operator(&op, None);
                    self.promote_waiting_operator();
                }
            }
        }
    }

    fn check_stale_operator(
        &self,
        op: &Arc<Operator>,
        step: Option<&OpStep>,
        region: &RegionInfo,
    ) -> bool {
        if let Some(step) = step {
            if let Err(err) = step.check_safety(region) {
                if self.remove_operator(op, Some(&err.to_string())) {
                    self.metrics.operator_events.inc(op.desc(), "stale");
                    self.promote_waiting_operator();
                    return true;
                }
            }
        }
        // A heartbeat may carry a newer conf version than the operator
        // accounts for; such an operator acts on a region that has already
        // moved on.
        let changes = region
            .epoch()
            .conf_ver
            .saturating_sub(op.region_epoch().conf_ver);
        if changes > op.conf_ver_changed(region) {
            if self.remove_operator(
                op,
                Some("stale operator, confver does not meet expectations"),
            ) {
                self.metrics.operator_events.inc(op.desc(), "stale");
                self.promote_waiting_operator();
                return true;
            }
        }
        false
    }

    fn next_push_time(step: Option<&OpStep>, now: Instant) -> Instant {
        let interval = match step {
            Some(step) if step.is_fast() => FAST_NOTIFY_INTERVAL,
            _ => SLOW_NOTIFY_INTERVAL,
        };
        now + interval
    }

    /// Pop the next region due for a timed push. The boolean is `false` when
    /// polling should stop for this tick.
    fn poll_need_dispatch_region(&self) -> (Option<RegionInfo>, bool) {
        let mut inner = self.inner.write();
        let Some(mut item) = inner.push_queue.pop() else {
            return (None, false);
        };
        let region_id = item.op.region_id();
        let current = inner.operators.get(&region_id);
        // Entries of retired or replaced operators are discarded lazily.
        if !current.map(|op| Arc::ptr_eq(op, &item.op)).unwrap_or(false) {
            return (None, true);
        }
        let Some(region) = self.cluster.get_region(region_id) else {
            let op = item.op;
            Self::remove_operator_locked(&mut inner, &op, &self.metrics);
            drop(inner);
            if op.cancel() {
                tracing::warn!(
                    region_id,
                    operator = %op,
                    "remove operator because region disappeared"
                );
                self.metrics.operator_events.inc(op.desc(), "disappear");
            }
            self.bury_operator(&op, None);
            return (None, true);
        };
        let step = item.op.check(&region);
        if step.is_none() {
            // Finished by another path; hand it to dispatch for retirement.
            return (Some(region), true);
        }
        let now = Instant::now();
        if now < item.time {
            // Heap order guarantees nothing earlier is pending.
            inner.push_queue.push(item);
            return (None, false);
        }
        item.time = Self::next_push_time(step.as_ref(), now);
        inner.push_queue.push(item);
        (Some(region), true)
    }

    /// One background tick: dispatch every region whose push time arrived.
    pub fn push_operators(&self) {
        loop {
            let (region, next) = self.poll_need_dispatch_region();
            if !next {
                break;
            }
            let Some(region) = region else {
                continue;
            };
            self.dispatch(&region, DISPATCH_FROM_NOTIFIER);
        }
    }

    /// Enqueue operators into the waiting pool. Merge operators must arrive
    /// as adjacent pairs. Returns how many were accepted.
    pub fn add_waiting_operator(&self, ops: Vec<Arc<Operator>>) -> usize {
        let mut added = 0;
        let mut inner = self.inner.write();

        let mut i = 0;
        while i < ops.len() {
            let op = &ops[i];
            let desc = op.desc().to_string();
            let mut is_merge = false;
            if op.kind().contains_any(OpKind::MERGE) {
                let paired = ops
                    .get(i + 1)
                    .map(|next| next.kind().contains_any(OpKind::MERGE))
                    .unwrap_or(false);
                if !paired {
                    // Orphan merge is a hard rejection of the rest of the
                    // call; the head itself is retired as canceled.
                    tracing::error!(desc = %op.desc(), "merge operator should be paired");
                    op.cancel();
                    self.bury_operator(op, Some("operator should be paired"));
                    drop(inner);
                    self.promote_waiting_operator();
                    return added;
                }
                is_merge = true;
            }
            if !self.check_add_operator(&inner, std::slice::from_ref(op)) {
                op.cancel();
                self.bury_operator(op, None);
                if is_merge {
                    // Merge operators travel as one unit; cancel them both.
                    let next = &ops[i + 1];
                    next.cancel();
                    self.bury_operator(next, None);
                }
                drop(inner);
                self.promote_waiting_operator();
                return added;
            }
            inner.wop.put_operator(op.clone());
            if is_merge {
                // A pair counts as one waiting entry for the per-desc cap.
                i += 1;
                added += 1;
                inner.wop.put_operator(ops[i].clone());
            }
            self.metrics.waiting_events.inc(&desc, "put");
            inner.wop_status.incr(&desc);
            added += 1;
            i += 1;
        }

        drop(inner);
        self.promote_waiting_operator();
        added
    }

    /// Admit operators directly to running, skipping the waiting pool.
    pub fn add_operator(&self, ops: Vec<Arc<Operator>>) -> bool {
        let mut deferred = Vec::new();
        let ok = {
            let mut inner = self.inner.write();
            if self.exceed_store_limit_locked(&mut inner, &ops)
                || !self.check_add_operator(&inner, &ops)
            {
                for op in &ops {
                    self.metrics.operator_events.inc(op.desc(), "cancel");
                    op.cancel();
                    self.bury_operator(op, None);
                }
                false
            } else {
                let mut all = true;
                for op in &ops {
                    if !self.add_operator_locked(&mut inner, op.clone(), &mut deferred) {
                        all = false;
                        break;
                    }
                }
                all
            }
        };
        self.flush_deferred_sends(deferred);
        ok
    }

    /// Drain the waiting pool: cancel heads that no longer pass admission,
    /// start the first admissible set. Hot-region split operators batch:
    /// the loop keeps pulling past them for one combined admission round.
    pub fn promote_waiting_operator(&self) {
        let mut deferred = Vec::new();
        {
            let mut inner = self.inner.write();
            let mut ret_ops: Vec<Arc<Operator>> = Vec::new();
            loop {
                let Some(ops) = inner.wop.get_operator() else {
                    if ret_ops.is_empty() {
                        return;
                    }
                    break;
                };
                self.metrics.waiting_events.inc(ops[0].desc(), "get");

                if self.exceed_store_limit_locked(&mut inner, &ops)
                    || !self.check_add_operator(&inner, &ops)
                {
                    for op in &ops {
                        self.metrics
                            .waiting_events
                            .inc(op.desc(), "promote_canceled");
                        op.cancel();
                        self.bury_operator(op, None);
                    }
                    inner.wop_status.decr(ops[0].desc());
                    continue;
                }
                inner.wop_status.decr(ops[0].desc());

                let hot_split = ops.iter().any(|op| {
                    op.kind().contains_any(OpKind::HOT_REGION)
                        && op.kind().contains_any(OpKind::SPLIT)
                });
                ret_ops.extend(ops);
                if !hot_split {
                    break;
                }
            }

            for op in ret_ops {
                if !self.add_operator_locked(&mut inner, op, &mut deferred) {
                    break;
                }
            }
        }
        self.flush_deferred_sends(deferred);
    }

    /// Whether a set of operators may be admitted right now.
    fn check_add_operator(&self, inner: &ControllerInner, ops: &[Arc<Operator>]) -> bool {
        let options = self.cluster.options();
        let max_waiting = options.schedule().scheduler_max_waiting_operator;
        for op in ops {
            let Some(region) = self.cluster.get_region(op.region_id()) else {
                tracing::info!(region_id = op.region_id(), "region not found, cancel add operator");
                self.metrics.waiting_events.inc(op.desc(), "add_canceled");
                return false;
            };
            if region.epoch() != op.region_epoch() {
                tracing::info!(
                    region_id = op.region_id(),
                    current = %region.epoch(),
                    snapshot = %op.region_epoch(),
                    "region epoch not match, cancel add operator"
                );
                self.metrics.waiting_events.inc(op.desc(), "add_canceled");
                return false;
            }
            if let Some(old) = inner.operators.get(&op.region_id()) {
                if op.priority_level() <= old.priority_level() {
                    tracing::info!(
                        region_id = op.region_id(),
                        old = %old,
                        "already have operator, cancel add operator"
                    );
                    self.metrics.waiting_events.inc(op.desc(), "add_canceled");
                    return false;
                }
            }
            if op.status() != OpStatus::Created {
                tracing::error!(
                    region_id = op.region_id(),
                    status = op.status().as_str(),
                    operator = %op,
                    "trying to add operator with unexpected status"
                );
                hooks::poke("unexpected-operator");
                self.metrics.waiting_events.inc(op.desc(), "add_canceled");
                return false;
            }
            if inner.wop_status.count(op.desc()) >= max_waiting {
                tracing::info!(
                    desc = op.desc(),
                    waiting = inner.wop_status.count(op.desc()),
                    max = max_waiting,
                    "waiting operators exceed max"
                );
                self.metrics.waiting_events.inc(op.desc(), "exceed_max");
                return false;
            }
        }
        // Any expired operator fails the whole call before any admission.
        let mut expired = false;
        for op in ops {
            if op.check_expired() {
                expired = true;
                self.metrics.waiting_events.inc(op.desc(), "add_canceled");
            }
        }
        !expired
    }

    fn add_operator_locked(
        &self,
        inner: &mut ControllerInner,
        op: Arc<Operator>,
        deferred: &mut Vec<(RegionInfo, OpStep, &'static str)>,
    ) -> bool {
        let region_id = op.region_id();
        tracing::info!(region_id, operator = %op, "add operator");

        // Priority was already checked; an occupant at this point loses.
        if let Some(old) = inner.operators.get(&region_id).cloned() {
            Self::remove_operator_locked(inner, &old, &self.metrics);
            old.replace();
            self.bury_operator(&old, None);
        }

        if !op.start() {
            tracing::error!(
                region_id,
                status = op.status().as_str(),
                operator = %op,
                "adding operator with unexpected status"
            );
            hooks::poke("unexpected-operator");
            self.metrics.operator_events.inc(op.desc(), "unexpected");
            return false;
        }
        inner.operators.insert(region_id, op.clone());
        self.metrics.operator_events.inc(op.desc(), "start");

        let influence = Self::total_influence(self.cluster.as_ref(), std::slice::from_ref(&op));
        for store_id in influence.store_ids().collect::<Vec<_>>() {
            for typ in StoreLimitType::ALL {
                let cost = influence
                    .get(store_id)
                    .map(|s| s.step_cost(typ))
                    .unwrap_or(0);
                if cost == 0 {
                    continue;
                }
                if let Some(limit) = inner
                    .stores_limit
                    .get(&store_id)
                    .and_then(|m| m.get(&typ))
                {
                    limit.take(cost);
                    self.metrics
                        .store_limit_cost
                        .inc(&store_id.to_string(), &typ.to_string());
                }
            }
        }
        Self::update_counts(inner);
        self.metrics
            .running_operators
            .set(inner.operators.len() as i64);

        let mut first_step = None;
        if let Some(region) = self.cluster.get_region(region_id) {
            if let Some(step) = op.check(&region) {
                first_step = Some(step.clone());
                deferred.push((region, step, DISPATCH_FROM_CREATE));
            }
        }

        inner.push_queue.push(OperatorWithTime {
            op: op.clone(),
            time: Self::next_push_time(first_step.as_ref(), Instant::now()),
        });
        self.metrics.operator_events.inc(op.desc(), "create");
        true
    }

    fn flush_deferred_sends(&self, deferred: Vec<(RegionInfo, OpStep, &'static str)>) {
        for (region, step, source) in deferred {
            self.send_schedule_command(&region, &step, source);
        }
    }

    /// Remove a running operator; cancels and buries it if it was present.
    /// Extra `reason` text lands in the terminal log.
    pub fn remove_operator(&self, op: &Arc<Operator>, reason: Option<&str>) -> bool {
        let removed = {
            let mut inner = self.inner.write();
            Self::remove_operator_locked(&mut inner, op, &self.metrics)
        };
        if removed {
            if op.cancel() {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "operator removed"
                );
            }
            self.bury_operator(op, reason);
        }
        removed
    }

    fn remove_operator_without_bury(&self, op: &Arc<Operator>) -> bool {
        let mut inner = self.inner.write();
        Self::remove_operator_locked(&mut inner, op, &self.metrics)
    }

    fn remove_operator_locked(
        inner: &mut ControllerInner,
        op: &Arc<Operator>,
        metrics: &SchedulerMetrics,
    ) -> bool {
        let region_id = op.region_id();
        let is_current = inner
            .operators
            .get(&region_id)
            .map(|cur| Arc::ptr_eq(cur, op))
            .unwrap_or(false);
        if !is_current {
            return false;
        }
        inner.operators.remove(&region_id);
        Self::update_counts(inner);
        metrics.operator_events.inc(op.desc(), "remove");
        metrics.running_operators.set(inner.operators.len() as i64);
        true
    }

    fn bury_operator(&self, op: &Arc<Operator>, reason: Option<&str>) {
        let status = op.status();
        if !status.is_end() {
            tracing::error!(
                region_id = op.region_id(),
                status = status.as_str(),
                operator = %op,
                "burying operator with non-end status"
            );
            hooks::poke("unexpected-operator");
            self.metrics.operator_events.inc(op.desc(), "unexpected");
            op.cancel();
        }

        match op.status() {
            OpStatus::Success => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "operator finish"
                );
                self.metrics.operator_events.inc(op.desc(), "finish");
            }
            OpStatus::Replaced => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "replace old operator"
                );
                self.metrics.operator_events.inc(op.desc(), "replace");
            }
            OpStatus::Expired => {
                tracing::info!(
                    region_id = op.region_id(),
                    lives = ?op.elapsed_time(),
                    operator = %op,
                    "operator expired"
                );
                self.metrics.operator_events.inc(op.desc(), "expire");
            }
            OpStatus::Timeout => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    operator = %op,
                    "operator timeout"
                );
                self.metrics.operator_events.inc(op.desc(), "timeout");
            }
            OpStatus::Canceled => {
                tracing::info!(
                    region_id = op.region_id(),
                    takes = ?op.running_time(),
                    reason = reason.unwrap_or(""),
                    operator = %op,
                    "operator canceled"
                );
                self.metrics.operator_events.inc(op.desc(), "cancel");
            }
            OpStatus::Created | OpStatus::Started => {}
        }

        self.records.put(op);
    }

    /// Status of the region's operator: the running one, or a recently
    /// finished record.
    pub fn get_operator_status(&self, region_id: RegionId) -> Option<OperatorRecord> {
        if let Some(op) = self.get_operator(region_id) {
            return Some(OperatorRecord {
                region_id: op.region_id(),
                desc: op.desc().to_string(),
                brief: op.brief().to_string(),
                kind: op.kind(),
                status: op.status(),
            });
        }
        self.records.get(region_id)
    }

    /// The running operator of a region.
    pub fn get_operator(&self, region_id: RegionId) -> Option<Arc<Operator>> {
        self.inner.read().operators.get(&region_id).cloned()
    }

    /// All running operators.
    pub fn get_operators(&self) -> Vec<Arc<Operator>> {
        self.inner.read().operators.values().cloned().collect()
    }

    /// All waiting operators.
    pub fn get_waiting_operators(&self) -> Vec<Arc<Operator>> {
        self.inner.read().wop.list_operators()
    }

    /// Encode one step into the region's heartbeat response.
    pub fn send_schedule_command(&self, region: &RegionInfo, step: &OpStep, source: &str) {
        tracing::info!(
            region_id = region.id(),
            step = %step,
            source,
            "send schedule command"
        );
        let cmd = match step {
            OpStep::TransferLeader { to_store } => match region.store_peer(*to_store) {
                Some(peer) => RegionCommand::TransferLeader { peer: *peer },
                None => {
                    tracing::error!(
                        region_id = region.id(),
                        store_id = to_store,
                        "transfer leader target peer not found"
                    );
                    return;
                }
            },
            OpStep::AddPeer { to_store, peer_id } | OpStep::AddLightPeer { to_store, peer_id } => {
                if region.store_peer(*to_store).is_some() {
                    // The newly added peer is pending.
                    return;
                }
                RegionCommand::ChangePeer {
                    change_type: ConfChangeType::AddNode,
                    peer: Peer::new(*peer_id, *to_store),
                }
            }
            OpStep::AddLearner { to_store, peer_id }
            | OpStep::AddLightLearner { to_store, peer_id } => {
                if region.store_peer(*to_store).is_some() {
                    // The newly added peer is pending.
                    return;
                }
                RegionCommand::ChangePeer {
                    change_type: ConfChangeType::AddLearnerNode,
                    peer: Peer::learner(*peer_id, *to_store),
                }
            }
            OpStep::PromoteLearner { to_store, peer_id } => RegionCommand::ChangePeer {
                // Reuses the add-voter message with the existing peer id.
                change_type: ConfChangeType::AddNode,
                peer: Peer::new(*peer_id, *to_store),
            },
            OpStep::DemoteFollower { to_store, peer_id } => RegionCommand::ChangePeer {
                // Reuses the add-learner message on the existing voter.
                change_type: ConfChangeType::AddLearnerNode,
                peer: Peer::learner(*peer_id, *to_store),
            },
            OpStep::RemovePeer { from_store } => match region.store_peer(*from_store) {
                Some(peer) => RegionCommand::ChangePeer {
                    change_type: ConfChangeType::RemoveNode,
                    peer: *peer,
                },
                None => {
                    tracing::error!(
                        region_id = region.id(),
                        store_id = from_store,
                        "peer to remove not found"
                    );
                    return;
                }
            },
            OpStep::MergeRegion { target, is_passive } => {
                if *is_passive {
                    // The target region drives; the passive side only waits.
                    return;
                }
                RegionCommand::Merge {
                    target: target.clone(),
                }
            }
            OpStep::SplitRegion {
                policy, keys, opts, ..
            } => RegionCommand::Split {
                policy: *policy,
                keys: keys.clone(),
                opts: *opts,
            },
            OpStep::ChangePeerV2Enter {
                promote_learners,
                demote_voters,
            } => {
                let mut changes = Vec::with_capacity(promote_learners.len() + demote_voters.len());
                for c in promote_learners {
                    changes.push((ConfChangeType::AddNode, Peer::new(c.peer_id, c.store_id)));
                }
                for c in demote_voters {
                    changes.push((
                        ConfChangeType::AddLearnerNode,
                        Peer::learner(c.peer_id, c.store_id),
                    ));
                }
                RegionCommand::ChangePeerV2 { changes }
            }
            OpStep::ChangePeerV2Leave { .. } => RegionCommand::ChangePeerV2 { changes: vec![] },
        };
        self.sink.send_command(region, cmd);
    }

    fn push_history(&self, op: &Arc<Operator>) {
        let mut inner = self.inner.write();
        for h in op.history() {
            inner.histories.push_front(h);
        }
    }

    /// Drop history records older than the retention window.
    pub fn prune_history(&self) {
        let mut inner = self.inner.write();
        while let Some(back) = inner.histories.back() {
            if back.finish_time.elapsed() > HISTORY_KEEP_TIME {
                inner.histories.pop_back();
            } else {
                break;
            }
        }
    }

    /// Step history finished at or after `start`, newest first.
    pub fn get_history(&self, start: Instant) -> Vec<OpHistory> {
        let inner = self.inner.read();
        let mut out = Vec::new();
        for h in &inner.histories {
            if h.finish_time < start {
                break;
            }
            out.push(h.clone());
        }
        out
    }

    fn update_counts(inner: &mut ControllerInner) {
        inner.counts.clear();
        for op in inner.operators.values() {
            *inner.counts.entry(op.kind().0).or_insert(0) += 1;
        }
    }

    /// Number of running operators whose kind intersects `mask`.
    pub fn operator_count(&self, mask: OpKind) -> u64 {
        let inner = self.inner.read();
        inner
            .counts
            .iter()
            .filter(|(kind, _)| OpKind(**kind).contains_any(mask))
            .map(|(_, count)| count)
            .sum()
    }

    /// Influence of the unfinished portion of every live running operator.
    pub fn get_op_influence(&self) -> OpInfluence {
        let mut influence = OpInfluence::new();
        let ops = self.get_operators();
        for op in ops {
            if op.check_timeout() || op.check_success() {
                continue;
            }
            if let Some(region) = self.cluster.get_region(op.region_id()) {
                op.unfinished_influence(&mut influence, &region);
            }
        }
        influence
    }

    /// Total influence of a set of operators.
    pub fn total_influence(cluster: &dyn ClusterInformer, ops: &[Arc<Operator>]) -> OpInfluence {
        let mut influence = OpInfluence::new();
        for op in ops {
            if let Some(region) = cluster.get_region(op.region_id()) {
                op.total_influence(&mut influence, &region);
            }
        }
        influence
    }

    /// Whether any affected store lacks the tokens for the given operators.
    fn exceed_store_limit_locked(
        &self,
        inner: &mut ControllerInner,
        ops: &[Arc<Operator>],
    ) -> bool {
        let influence = Self::total_influence(self.cluster.as_ref(), ops);
        for store_id in influence.store_ids().collect::<Vec<_>>() {
            for typ in StoreLimitType::ALL {
                let cost = influence
                    .get(store_id)
                    .map(|s| s.step_cost(typ))
                    .unwrap_or(0);
                if cost == 0 {
                    continue;
                }
                let limit = self.get_or_create_store_limit_locked(inner, store_id, typ);
                if limit.available() < cost as f64 {
                    return true;
                }
            }
        }
        false
    }

    /// Pull-style availability probe for policy modules: whether one region's
    /// movement of `typ` fits the store's budget right now.
    pub fn store_limit_available(&self, store_id: StoreId, typ: StoreLimitType) -> bool {
        let mut inner = self.inner.write();
        let limit = self.get_or_create_store_limit_locked(&mut inner, store_id, typ);
        limit.available() >= typ.region_influence() as f64
    }

    fn get_or_create_store_limit_locked<'a>(
        &self,
        inner: &'a mut ControllerInner,
        store_id: StoreId,
        typ: StoreLimitType,
    ) -> &'a StoreLimit {
        let rate_per_sec =
            self.cluster.options().store_limit_rate(store_id, typ) / STORE_BALANCE_BASE_TIME;
        let by_type = inner.stores_limit.entry(store_id).or_default();
        let rebuild = match by_type.get(&typ) {
            Some(limit) => (limit.rate() - rate_per_sec).abs() > f64::EPSILON,
            None => true,
        };
        if rebuild {
            tracing::info!(
                store_id,
                limit_type = %typ,
                rate = rate_per_sec,
                "create or update a store limit"
            );
            by_type.insert(typ, StoreLimit::new(rate_per_sec, typ.region_influence()));
        }
        let limit = by_type
            .entry(typ)
            .or_insert_with(|| StoreLimit::new(rate_per_sec, typ.region_influence()));
        limit
    }

    /// Export store-limit gauges for every known store.
    pub fn collect_store_limit_metrics(&self) {
        let stores = self.cluster.get_stores();
        let inner = self.inner.read();
        for store in stores {
            let store_label = store.id().to_string();
            for typ in StoreLimitType::ALL {
                match inner
                    .stores_limit
                    .get(&store.id())
                    .and_then(|m| m.get(&typ))
                {
                    Some(limit) => {
                        self.metrics.store_limit_available.set(
                            &store_label,
                            &typ.to_string(),
                            limit.available() / typ.region_influence() as f64,
                        );
                        self.metrics.store_limit_rate.set(
                            &store_label,
                            &typ.to_string(),
                            limit.rate() * STORE_BALANCE_BASE_TIME,
                        );
                    }
                    None => {
                        // Zero marks an uninitialized limit.
                        self.metrics
                            .store_limit_rate
                            .set(&store_label, &typ.to_string(), 0.0);
                    }
                }
            }
        }
    }
}
