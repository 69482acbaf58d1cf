#[cfg(feature = "axum")]
pub mod axum;

#[cfg(feature = "reqwest")]
pub mod reqwest;
