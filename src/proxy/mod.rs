pub mod orchestrator;
pub mod retry;
pub mod stats;

pub use orchestrator::{ChunkStream, ProxyOrchestrator, ProxyOutcome, StreamEvent};
pub use stats::{ProxyStats, StatsSnapshot};
