pub mod bank;
pub mod engine;
pub mod reconcile;
pub mod root_finder;
pub mod state;

pub use bank::Bank;
pub use engine::{ProcessingEngine, ProcessingStep};
pub use reconcile::reconcile;
pub use root_finder::{find_root, DiameterDistributionSystem, SpeciesCalibration};
pub use state::{LayerState, PrimarySpeciesDetails, ProcessingState, SpeciesRanking};
