/// Clients of the parsing and recommendation services
pub mod backends;
/// Chunk persistence, enrichment and retry queue
pub mod publisher;
/// Push of parsed events to live subscribers
pub mod transport;

pub use backends::{
    AnalysisBackend, HttpAnalysisClient, HttpRecommendationClient, MockAnalysisBackend,
    MockRecommendationBackend, RecommendationBackend,
};
pub use publisher::{ChunkPublisher, RetryReport};
pub use transport::{topic_for, BroadcastTransport, PushTransport, TopicMessage};
