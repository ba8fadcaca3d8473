//! Racing local signature computation against signatures produced elsewhere

pub mod coordinator;
pub mod signal;

pub use coordinator::{RaceReport, RaceState, SignatureRaceCoordinator};
pub use signal::{RaceChannel, RaceListener, RaceSignal};
