//! Capability subscription and routing table.

mod envelope;
mod table;
mod types;

pub use envelope::{CapabilityEnvelope, EnvelopeError, payload_module, stamp_provider};
pub use table::RoutingTable;
pub use types::{AllowList, ReplyChannel, ReplyError, SubscriptionKey};
