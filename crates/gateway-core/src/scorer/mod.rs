//! Component E: the SHGAT scorer — parameter storage plus the attention
//! forward pass and fusion MLP that turn a (graph, intent, candidate) triple
//! into a single relevance score.

pub mod params;
pub mod shgat;
pub mod trainer;

pub use params::{FusionParams, HeadParams, LayerParams, ScorerParams};
pub use shgat::{ScoreOutput, ScorerConfig, ScorerState, ShgatScorer};
pub use trainer::{TrainResult, Trainer};
