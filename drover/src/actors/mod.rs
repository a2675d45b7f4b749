//! Actors that ship with the crate.

mod hello_world;

pub use hello_world::{HELLO_WORLD_COUNTER, HelloWorld, HelloWorldPhase};
