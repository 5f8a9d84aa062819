mod event;
mod run;
mod template;
mod wire;

pub use event::*;
pub use run::*;
pub use template::*;
pub use wire::*;
