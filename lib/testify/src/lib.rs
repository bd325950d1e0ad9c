pub mod temp;
pub mod trace;
pub mod wait;
