//! Factorio agent bridge
//!
//! Lets many agents drive characters on one or more Factorio servers over
//! the Source RCON channel:
//!
//! - **Commands**: operations are packed into `/sc` batches under the RCON
//!   payload ceiling and sent to the `agent_bridge` remote interface
//! - **Responses**: JSON printed by the mod, reassembled from as many
//!   packets as it takes
//! - **State**: observed player, inventory and entity scans are cached per
//!   server, and multi-tick operations become tickets that resolve against
//!   later observations

pub mod backoff;
pub mod batcher;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod pool;
pub mod rcon;
pub mod reassembler;
pub mod router;
pub mod tracker;
pub mod transport;

pub use backoff::{Backoff, BackoffConfig};
pub use batcher::{Batch, CommandBatcher};
pub use bridge::{AgentBridge, BatchOutcome, Execution, Submission};
pub use cache::{CacheEntry, CachedValue, EntityKey, FreshnessContext, StateCache, Staleness};
pub use config::BridgeConfig;
pub use pool::{ConnectionPool, PoolStats, PooledSession};
pub use rcon::{AuthState, RconPacket, Session};
pub use reassembler::{Ingest, Reassembler};
pub use router::StaticRouter;
pub use tracker::{
    completion, OperationTicket, OperationTracker, Predicate, ResolvedTicket, TicketHandle,
    TicketId, TicketStatus,
};
pub use transport::{BoxedStream, Connector, TcpConnector};
