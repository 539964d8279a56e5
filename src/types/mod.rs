pub mod price;
pub mod screening;
pub mod signals;

pub use price::*;
pub use screening::*;
pub use signals::*;
