#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]
pub mod average;
pub mod config;
pub mod forward;
pub mod grid;
pub mod integrand;
pub mod ode;
pub mod rates;

#[path = "../pack/mod.rs"]
pub mod pack;
