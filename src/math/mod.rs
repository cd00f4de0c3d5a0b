//! Modular arithmetic, polynomials, NTT, and randomness.

pub mod mod_arith;
pub mod ntt;
pub mod poly;
pub mod rng;

pub use ntt::NttTable;
pub use poly::Polynomial;
