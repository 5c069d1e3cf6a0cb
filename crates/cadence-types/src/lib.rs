pub mod metrics;
pub mod polling;
pub mod run;
pub mod turn;

pub use metrics::*;
pub use polling::*;
pub use run::*;
pub use turn::*;
