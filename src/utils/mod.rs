pub(crate) mod constants;
pub mod units;
