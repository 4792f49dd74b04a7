pub mod battery;
pub mod packet;

pub use battery::Battery;
