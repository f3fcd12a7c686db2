//! Outbound commands piggybacked on region heartbeat responses.

use crate::core::region::RegionInfo;
use crate::types::{FlowKind, Peer, RegionId, RegionMeta};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Configuration-change flavor for a single peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfChangeType {
    /// Add a voter.
    AddNode,
    /// Add a learner.
    AddLearnerNode,
    /// Remove a peer.
    RemoveNode,
}

/// Region split policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitPolicy {
    /// Scan for the exact middle key.
    Scan,
    /// Use approximate statistics to pick the key.
    Approximate,
    /// Split at a load ratio along one dimension.
    Ratio,
}

impl Default for SplitPolicy {
    fn default() -> Self {
        SplitPolicy::Scan
    }
}

/// Extra arguments for ratio splits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SplitOptions {
    /// Load dimension the ratio applies to.
    pub dim_id: u32,
    /// Split position as a fraction of the dimension's total.
    pub ratio: f64,
    /// Flow direction the dimension is measured on.
    pub rw_type: Option<FlowKind>,
}

/// One command for a storage node, encoded into its heartbeat response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionCommand {
    /// Transfer leadership to an existing peer.
    TransferLeader {
        /// Target peer.
        peer: Peer,
    },
    /// Single-peer configuration change.
    ChangePeer {
        /// Change flavor.
        change_type: ConfChangeType,
        /// Affected peer.
        peer: Peer,
    },
    /// Joint-consensus configuration change. An empty change list asks the
    /// node to leave the joint state.
    ChangePeerV2 {
        /// Changes to enter with; empty = leave.
        changes: Vec<(ConfChangeType, Peer)>,
    },
    /// Merge this region into the target.
    Merge {
        /// Region absorbing this one.
        target: RegionMeta,
    },
    /// Split this region.
    Split {
        /// Split policy.
        policy: SplitPolicy,
        /// Explicit split keys, if any.
        keys: Vec<Bytes>,
        /// Ratio-split arguments.
        opts: SplitOptions,
    },
}

/// Delivery seam for outbound commands.
///
/// The embedding server implements this against its heartbeat streams; the
/// send must not block, since it runs on the dispatch path.
pub trait HeartbeatSink: Send + Sync {
    /// Deliver a command for `region`.
    fn send_command(&self, region: &RegionInfo, cmd: RegionCommand);
}

/// Channel-backed sink: commands are queued for the serving layer to drain,
/// dropped with a warning when the queue is full.
#[derive(Debug)]
pub struct ChannelSink {
    tx: mpsc::Sender<(RegionId, RegionCommand)>,
}

impl ChannelSink {
    /// Create a sink and the receiving half with the given queue depth.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<(RegionId, RegionCommand)>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Self { tx }, rx)
    }
}

impl HeartbeatSink for ChannelSink {
    fn send_command(&self, region: &RegionInfo, cmd: RegionCommand) {
        if self.tx.try_send((region.id(), cmd)).is_err() {
            tracing::warn!(region_id = region.id(), "heartbeat command queue full, dropping");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Peer, RegionMeta};

    #[test]
    fn test_channel_sink_delivery_and_overflow() {
        let (sink, mut rx) = ChannelSink::new(1);
        let region = RegionInfo::new(
            RegionMeta {
                id: 9,
                peers: vec![Peer::new(1, 1)],
                ..Default::default()
            },
            None,
        );

        let cmd = RegionCommand::TransferLeader {
            peer: Peer::new(1, 1),
        };
        sink.send_command(&region, cmd.clone());
        // Queue full: second send is dropped, not blocked on.
        sink.send_command(&region, cmd.clone());

        assert_eq!(rx.try_recv().unwrap(), (9, cmd));
        assert!(rx.try_recv().is_err());
    }
}
