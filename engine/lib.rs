#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod evaluate;
pub mod fold;
pub mod forward;
pub mod loss;
pub mod optim;
pub mod progress;
pub mod risk;
pub mod tables;
pub mod train;

#[path = "../metrics/mod.rs"]
pub mod metrics;
