//! The operator model: an immutable plan of steps plus a status machine.

use crate::core::region::RegionInfo;
use crate::schedule::influence::OpInfluence;
use crate::schedule::step::OpStep;
use crate::types::{RegionEpoch, RegionId, StoreId};
use parking_lot::Mutex;
use std::ops::{BitAnd, BitOr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Bitmask classifying an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpKind(pub u32);

impl OpKind {
    /// Initiated by an administrator.
    pub const ADMIN: OpKind = OpKind(1);
    /// Moves leadership.
    pub const LEADER: OpKind = OpKind(1 << 1);
    /// Moves region data.
    pub const REGION: OpKind = OpKind(1 << 2);
    /// Repairs replication.
    pub const REPLICA: OpKind = OpKind(1 << 3);
    /// Splits a region.
    pub const SPLIT: OpKind = OpKind(1 << 4);
    /// Merges two regions.
    pub const MERGE: OpKind = OpKind(1 << 5);
    /// Balances hot load.
    pub const HOT_REGION: OpKind = OpKind(1 << 6);
    /// Scoped to a key range.
    pub const RANGE: OpKind = OpKind(1 << 7);
    /// Every kind bit.
    pub const ALL: OpKind = OpKind(u32::MAX);

    /// Whether any bit of `other` is set in `self`.
    pub fn contains_any(self, other: OpKind) -> bool {
        self.0 & other.0 != 0
    }
}

impl BitOr for OpKind {
    type Output = OpKind;

    fn bitor(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 | rhs.0)
    }
}

impl BitAnd for OpKind {
    type Output = OpKind;

    fn bitand(self, rhs: OpKind) -> OpKind {
        OpKind(self.0 & rhs.0)
    }
}

impl std::fmt::Display for OpKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = [
            (OpKind::ADMIN, "admin"),
            (OpKind::LEADER, "leader"),
            (OpKind::REGION, "region"),
            (OpKind::REPLICA, "replica"),
            (OpKind::SPLIT, "split"),
            (OpKind::MERGE, "merge"),
            (OpKind::HOT_REGION, "hot-region"),
            (OpKind::RANGE, "range"),
        ];
        let mut first = true;
        for (kind, name) in names {
            if self.contains_any(kind) {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", name)?;
                first = false;
            }
        }
        if first {
            write!(f, "none")?;
        }
        Ok(())
    }
}

/// Operator lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    /// Built, not yet admitted to running.
    Created,
    /// Running; steps are being dispatched.
    Started,
    /// Every step completed.
    Success,
    /// Canceled before or during execution.
    Canceled,
    /// Displaced by a higher-priority operator.
    Replaced,
    /// Never started within the allowed window.
    Expired,
    /// Ran past the allowed window.
    Timeout,
}

impl OpStatus {
    /// Whether the status is terminal.
    pub fn is_end(self) -> bool {
        !matches!(self, OpStatus::Created | OpStatus::Started)
    }

    /// Short name for logs.
    pub fn as_str(self) -> &'static str {
        match self {
            OpStatus::Created => "created",
            OpStatus::Started => "started",
            OpStatus::Success => "success",
            OpStatus::Canceled => "canceled",
            OpStatus::Replaced => "replaced",
            OpStatus::Expired => "expired",
            OpStatus::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for OpStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Scheduling priority; a higher level may displace a running operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PriorityLevel {
    /// Opportunistic work.
    Low,
    /// Default.
    Normal,
    /// Repairs and administrator actions.
    High,
}

impl Default for PriorityLevel {
    fn default() -> Self {
        PriorityLevel::Normal
    }
}

/// Running-time cap for leader/administrative operators.
const FAST_OPERATOR_WAIT: Duration = Duration::from_secs(10 * 60);

/// Running-time cap for operators that move data.
const SLOW_OPERATOR_WAIT: Duration = Duration::from_secs(40 * 60);

/// One finished-step record kept in the controller history.
#[derive(Debug, Clone)]
pub struct OpHistory {
    /// When the step finished.
    pub finish_time: Instant,
    /// Store the load left.
    pub from: StoreId,
    /// Store the load landed on.
    pub to: StoreId,
    /// Kind of the owning operator.
    pub kind: OpKind,
}

#[derive(Debug)]
struct StatusTracker {
    status: OpStatus,
    started_at: Option<Instant>,
    ended_at: Option<Instant>,
}

impl StatusTracker {
    fn transition(&mut self, to: OpStatus, now: Instant) -> bool {
        let ok = matches!(
            (self.status, to),
            (OpStatus::Created, OpStatus::Started)
                | (OpStatus::Created, OpStatus::Canceled)
                | (OpStatus::Created, OpStatus::Replaced)
                | (OpStatus::Created, OpStatus::Expired)
                | (OpStatus::Started, OpStatus::Success)
                | (OpStatus::Started, OpStatus::Canceled)
                | (OpStatus::Started, OpStatus::Replaced)
                | (OpStatus::Started, OpStatus::Timeout)
        );
        if !ok {
            return false;
        }
        match to {
            OpStatus::Started => self.started_at = Some(now),
            _ => self.ended_at = Some(now),
        }
        self.status = to;
        true
    }
}

/// An immutable multi-step plan against one region, plus its status machine.
///
/// The step list never changes after construction; all mutability is the
/// status, the step cursor, and per-step finish times.
#[derive(Debug)]
pub struct Operator {
    desc: String,
    brief: String,
    region_id: RegionId,
    region_epoch: RegionEpoch,
    kind: OpKind,
    steps: Vec<OpStep>,
    priority: PriorityLevel,
    created_at: Instant,
    current_step: AtomicUsize,
    step_finished_at: Mutex<Vec<Option<Instant>>>,
    tracker: Mutex<StatusTracker>,
}

impl Operator {
    /// Create an operator from its step plan.
    pub fn new(
        desc: impl Into<String>,
        brief: impl Into<String>,
        region_id: RegionId,
        region_epoch: RegionEpoch,
        kind: OpKind,
        steps: Vec<OpStep>,
    ) -> Self {
        Self {
            desc: desc.into(),
            brief: brief.into(),
            region_id,
            region_epoch,
            kind,
            priority: PriorityLevel::Normal,
            created_at: Instant::now(),
            current_step: AtomicUsize::new(0),
            step_finished_at: Mutex::new(vec![None; steps.len()]),
            steps,
            tracker: Mutex::new(StatusTracker {
                status: OpStatus::Created,
                started_at: None,
                ended_at: None,
            }),
        }
    }

    /// Set the priority level.
    pub fn with_priority(mut self, priority: PriorityLevel) -> Self {
        self.priority = priority;
        self
    }

    /// Short description, used as the metric label.
    pub fn desc(&self) -> &str {
        &self.desc
    }

    /// One-line summary of the plan.
    pub fn brief(&self) -> &str {
        &self.brief
    }

    /// Region the operator acts on.
    pub fn region_id(&self) -> RegionId {
        self.region_id
    }

    /// Epoch snapshot taken at creation.
    pub fn region_epoch(&self) -> RegionEpoch {
        self.region_epoch
    }

    /// Kind bitmask.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// Priority level.
    pub fn priority_level(&self) -> PriorityLevel {
        self.priority
    }

    /// The step plan.
    pub fn steps(&self) -> &[OpStep] {
        &self.steps
    }

    /// Number of steps.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Whether the plan is empty.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Current status.
    pub fn status(&self) -> OpStatus {
        self.tracker.lock().status
    }

    /// Whether the status is terminal.
    pub fn is_end(&self) -> bool {
        self.status().is_end()
    }

    /// Time since creation, stopped at the terminal transition.
    pub fn elapsed_time(&self) -> Duration {
        let tracker = self.tracker.lock();
        tracker
            .ended_at
            .unwrap_or_else(Instant::now)
            .duration_since(self.created_at)
    }

    /// Time between start and the terminal transition.
    pub fn running_time(&self) -> Duration {
        let tracker = self.tracker.lock();
        match tracker.started_at {
            Some(start) => tracker
                .ended_at
                .unwrap_or_else(Instant::now)
                .duration_since(start),
            None => Duration::ZERO,
        }
    }

    /// Transition created -> started.
    pub fn start(&self) -> bool {
        self.tracker
            .lock()
            .transition(OpStatus::Started, Instant::now())
    }

    /// Cancel from any live status.
    pub fn cancel(&self) -> bool {
        self.tracker
            .lock()
            .transition(OpStatus::Canceled, Instant::now())
    }

    /// Mark displaced by a higher-priority operator.
    pub fn replace(&self) -> bool {
        self.tracker
            .lock()
            .transition(OpStatus::Replaced, Instant::now())
    }

    /// Running-time cap for this operator's kind.
    pub fn max_duration(&self) -> Duration {
        if self
            .kind
            .contains_any(OpKind::REGION | OpKind::REPLICA | OpKind::MERGE | OpKind::SPLIT)
        {
            SLOW_OPERATOR_WAIT
        } else {
            FAST_OPERATOR_WAIT
        }
    }

    /// Whether the operator never started within its window; transitions to
    /// expired when so.
    pub fn check_expired(&self) -> bool {
        let mut tracker = self.tracker.lock();
        match tracker.status {
            OpStatus::Expired => true,
            OpStatus::Created => {
                if self.created_at.elapsed() > self.max_duration() {
                    tracker.transition(OpStatus::Expired, Instant::now());
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Whether the operator ran past its window; transitions to timeout when
    /// so.
    pub fn check_timeout(&self) -> bool {
        let mut tracker = self.tracker.lock();
        match tracker.status {
            OpStatus::Timeout => true,
            OpStatus::Started => {
                let start = tracker.started_at.unwrap_or(self.created_at);
                if start.elapsed() > self.max_duration() {
                    tracker.transition(OpStatus::Timeout, Instant::now());
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Whether every step has finished; transitions started -> success when
    /// so.
    pub fn check_success(&self) -> bool {
        let mut tracker = self.tracker.lock();
        match tracker.status {
            OpStatus::Success => true,
            OpStatus::Started => {
                if self.current_step.load(Ordering::Acquire) >= self.steps.len() {
                    tracker.transition(OpStatus::Success, Instant::now());
                    true
                } else {
                    false
                }
            }
            _ => false,
        }
    }

    /// Advance past finished steps and return the next step to dispatch, or
    /// `None` when the operator is done or dead. May transition to success or
    /// timeout as a side effect.
    pub fn check(&self, region: &RegionInfo) -> Option<OpStep> {
        loop {
            let idx = self.current_step.load(Ordering::Acquire);
            if idx >= self.steps.len() {
                break;
            }
            if !self.steps[idx].is_finish(region) {
                break;
            }
            self.step_finished_at.lock()[idx] = Some(Instant::now());
            self.current_step.store(idx + 1, Ordering::Release);
            tracing::info!(
                region_id = self.region_id,
                step = %self.steps[idx],
                "operator step finished"
            );
        }

        if self.check_success() {
            return None;
        }
        if self.check_timeout() {
            return None;
        }
        let idx = self.current_step.load(Ordering::Acquire);
        self.steps.get(idx).cloned()
    }

    /// Conf-version bumps the executed prefix of the plan accounts for.
    pub fn conf_ver_changed(&self, region: &RegionInfo) -> u64 {
        let idx = self.current_step.load(Ordering::Acquire).min(self.steps.len());
        self.steps[..idx]
            .iter()
            .chain(self.steps.get(idx))
            .map(|s| s.conf_ver_changed(region))
            .sum()
    }

    /// Influence of the whole plan.
    pub fn total_influence(&self, inf: &mut OpInfluence, region: &RegionInfo) {
        for step in &self.steps {
            step.influence(inf, region);
        }
    }

    /// Influence of the remaining steps.
    pub fn unfinished_influence(&self, inf: &mut OpInfluence, region: &RegionInfo) {
        let idx = self.current_step.load(Ordering::Acquire);
        for step in &self.steps[idx.min(self.steps.len())..] {
            step.influence(inf, region);
        }
    }

    /// Per-step history records for the finished prefix.
    pub fn history(&self) -> Vec<OpHistory> {
        let finished = self.step_finished_at.lock();
        let mut out = Vec::new();
        for (step, finish) in self.steps.iter().zip(finished.iter()) {
            let Some(finish_time) = *finish else {
                continue;
            };
            let (from, to) = match step {
                OpStep::TransferLeader { to_store } => (0, *to_store),
                OpStep::AddPeer { to_store, .. }
                | OpStep::AddLightPeer { to_store, .. }
                | OpStep::AddLearner { to_store, .. }
                | OpStep::AddLightLearner { to_store, .. }
                | OpStep::PromoteLearner { to_store, .. } => (0, *to_store),
                OpStep::DemoteFollower { to_store, .. } => (*to_store, 0),
                OpStep::RemovePeer { from_store } => (*from_store, 0),
                _ => (0, 0),
            };
            out.push(OpHistory {
                finish_time,
                from,
                to,
                kind: self.kind,
            });
        }
        out
    }
}

impl std::fmt::Display for Operator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (kind: {}, region: {}({}), steps: [",
            self.desc, self.kind, self.region_id, self.region_epoch
        )?;
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", step)?;
        }
        write!(f, "])")
    }
}

/// Plan builders used by the admin surface and tests; policy modules build
/// their candidates the same way.
impl Operator {
    /// Transfer region leadership to `to_store`.
    pub fn transfer_leader(region: &RegionInfo, to_store: StoreId) -> Operator {
        Operator::new(
            "transfer-leader",
            format!("transfer leader of region {} to store {}", region.id(), to_store),
            region.id(),
            region.epoch(),
            OpKind::ADMIN | OpKind::LEADER,
            vec![OpStep::TransferLeader { to_store }],
        )
    }

    /// Move the peer on `from_store` to `to_store`.
    pub fn move_peer(
        region: &RegionInfo,
        from_store: StoreId,
        to_store: StoreId,
        peer_id: u64,
    ) -> Operator {
        let mut steps = vec![OpStep::AddPeer { to_store, peer_id }];
        if region.leader_store_id() == from_store {
            // The leader peer cannot be removed; hand leadership off first.
            steps.push(OpStep::TransferLeader { to_store });
        }
        steps.push(OpStep::RemovePeer { from_store });
        Operator::new(
            "move-peer",
            format!(
                "move peer of region {} from store {} to store {}",
                region.id(),
                from_store,
                to_store
            ),
            region.id(),
            region.epoch(),
            OpKind::ADMIN | OpKind::REGION,
            steps,
        )
    }

    /// Add a voter on `to_store`.
    pub fn add_peer(region: &RegionInfo, to_store: StoreId, peer_id: u64) -> Operator {
        Operator::new(
            "add-peer",
            format!("add peer on store {} for region {}", to_store, region.id()),
            region.id(),
            region.epoch(),
            OpKind::ADMIN | OpKind::REGION,
            vec![OpStep::AddPeer { to_store, peer_id }],
        )
    }

    /// Add a learner on `to_store`.
    pub fn add_learner(region: &RegionInfo, to_store: StoreId, peer_id: u64) -> Operator {
        Operator::new(
            "add-learner",
            format!("add learner on store {} for region {}", to_store, region.id()),
            region.id(),
            region.epoch(),
            OpKind::ADMIN | OpKind::REGION,
            vec![OpStep::AddLearner { to_store, peer_id }],
        )
    }

    /// Remove the peer on `from_store`.
    pub fn remove_peer(region: &RegionInfo, from_store: StoreId) -> Operator {
        Operator::new(
            "remove-peer",
            format!("remove peer on store {} of region {}", from_store, region.id()),
            region.id(),
            region.epoch(),
            OpKind::ADMIN | OpKind::REGION,
            vec![OpStep::RemovePeer { from_store }],
        )
    }

    /// Build the paired merge operators: the active source operator first,
    /// the passive target operator second.
    pub fn merge_pair(source: &RegionInfo, target: &RegionInfo) -> (Operator, Operator) {
        let active = Operator::new(
            "merge-region",
            format!("merge region {} into region {}", source.id(), target.id()),
            source.id(),
            source.epoch(),
            OpKind::ADMIN | OpKind::MERGE,
            vec![OpStep::MergeRegion {
                target: target.meta().clone(),
                is_passive: false,
            }],
        );
        let passive = Operator::new(
            "merge-region",
            format!("region {} waits for merge from region {}", target.id(), source.id()),
            target.id(),
            target.epoch(),
            OpKind::ADMIN | OpKind::MERGE,
            vec![OpStep::MergeRegion {
                target: target.meta().clone(),
                is_passive: true,
            }],
        );
        (active, passive)
    }

    /// Split `region`.
    pub fn split_region(
        region: &RegionInfo,
        policy: crate::core::command::SplitPolicy,
        keys: Vec<bytes::Bytes>,
        opts: crate::core::command::SplitOptions,
        kind: OpKind,
    ) -> Operator {
        Operator::new(
            "split-region",
            format!("split region {}", region.id()),
            region.id(),
            region.epoch(),
            kind | OpKind::SPLIT,
            vec![OpStep::SplitRegion {
                start_key: region.start_key().clone(),
                end_key: region.end_key().clone(),
                policy,
                keys,
                opts,
            }],
        )
    }
}
