pub mod inverter;
pub mod packet;

pub use inverter::Inverter;
