pub(crate) mod backend;
mod frame;
pub(crate) mod frontend;

pub use backend::*;
pub use frame::Frame;
pub use frontend::*;
