//! Operator machinery: the operator model, admission queues, rate limits,
//! and the controller that drives dispatch.

pub mod controller;
pub mod influence;
pub mod operator;
pub mod records;
pub mod step;
pub mod store_limit;
pub mod waiting;

pub use controller::{OperatorController, DISPATCH_FROM_CREATE, DISPATCH_FROM_HEARTBEAT, DISPATCH_FROM_NOTIFIER};
pub use influence::{OpInfluence, StoreInfluence};
pub use operator::{OpKind, OpStatus, Operator, PriorityLevel};
pub use records::{OperatorRecord, OperatorRecords};
pub use step::OpStep;
pub use store_limit::{StoreLimit, StoreLimitType};
pub use waiting::{RandBuckets, WaitingOperatorStatus};
