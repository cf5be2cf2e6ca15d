pub mod error;
pub mod fitstruct;
pub mod preprocessing;
