pub mod analysis;
pub mod briefing;
pub mod dataset;
pub mod enums;
pub mod intake;
pub mod run;
pub mod trace;

pub use analysis::*;
pub use briefing::*;
pub use dataset::*;
pub use enums::*;
pub use intake::*;
pub use run::*;
pub use trace::*;
