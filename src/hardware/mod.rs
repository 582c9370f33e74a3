//! Microscope hardware abstraction.
//!
//! The acquisition engine is written against the capability traits in
//! [`capabilities`]; [`mock`] provides a simulated microscope.

pub mod capabilities;
pub mod mock;

pub use capabilities::Microscope;
pub use mock::{MockCall, MockMicroscope, MockSettings};
