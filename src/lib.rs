#![recursion_limit = "256"]
//! Unpaired image-to-image translation training (two generators, two
//! discriminators) with optional geometry, sketch and semantic supervision.

pub mod data;
pub mod error;
pub mod logging;
pub mod model;
pub mod training;
pub mod utils;
