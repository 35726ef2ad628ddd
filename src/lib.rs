#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
// #![warn(clippy::cargo)]

pub mod adjust;
pub mod analysis;
pub mod apply;
pub mod calibration;
pub mod config;
pub mod crm;
pub mod drift;
pub mod error;
pub mod math;
pub mod measurement;
pub mod minimisation;
pub mod oxide;
pub mod pivot;
pub mod segments;
pub mod standards;
pub mod store;

pub type Result<T> = ::std::result::Result<T, crate::error::Error>;
