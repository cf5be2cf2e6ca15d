/// Reduced Planck constant in J s
pub(crate) const HBAR: f64 = 1.054_571_817e-34;
pub(crate) const MW_TO_W: f64 = 1e-3;
