pub mod loaders;
pub mod points;
pub mod storage;

pub use loaders::*;
pub use points::*;
pub use storage::*;
