//! `mqrpcd`: an in-process demo of the mqrpc stack.

pub mod calculator;
pub mod demo;

pub use demo::{run_demo, DemoReport};
