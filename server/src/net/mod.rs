//! Inter-server transport: per-peer fair-queued sends with token-bucket
//! pacing on the main side, and non-blocking TCP links with symmetric-connect
//! tie-breaking on the network executor.

mod fair_queue;
mod link;
mod smq;
mod token_bucket;

pub use fair_queue::FairQueue;
pub use link::NetDriver;
pub use smq::{NetCmd, ServerMessageQueue, SourceTag};
pub use token_bucket::TokenBucket;
