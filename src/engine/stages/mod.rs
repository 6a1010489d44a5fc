//! The three concrete stages of the deliberation workflow (§4.3): a
//! parallel fan-out to the council, anonymized peer ranking of the
//! responses, and a chairman synthesis of the final answer.

pub mod parallel_query;
pub mod peer_ranking;
pub mod synthesis;

pub use parallel_query::{ModelQuery, ParallelQueryConfig, ParallelQueryOutput, ParallelQueryStage};
pub use peer_ranking::{EvaluatorRanking, PeerRankingConfig, PeerRankingOutput, PeerRankingStage};
pub use synthesis::{SynthesisConfig, SynthesisOutput, SynthesisStage};
