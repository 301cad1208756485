pub mod compile;
pub mod cpu;
pub mod frontend;
