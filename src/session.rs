//! Per-client session state and the registry that owns it between
//! connections

pub mod inflight;
pub mod registry;
pub mod state;
pub mod subscription;

pub use inflight::{Direction, InFlightMessage, InFlightStage, InFlightStore};
pub use registry::{Claim, SessionRegistry, TakeoverNotice};
pub use state::{Session, NEVER_EXPIRES};
pub use subscription::{Subscription, SubscriptionManager};
