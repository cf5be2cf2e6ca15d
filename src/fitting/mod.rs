pub mod circlefit;
pub mod common;
