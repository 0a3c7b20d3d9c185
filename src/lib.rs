#![doc = include_str!("../README.md")]

pub mod backend;
pub mod dialects;
pub mod frontend;
pub mod matcher;
pub mod utils;

mod core;
pub use self::core::*;

#[macro_use]
extern crate lazy_static;
