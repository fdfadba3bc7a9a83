pub mod nmsp;
pub mod recordings;

pub use nmsp::*;
pub use recordings::*;
