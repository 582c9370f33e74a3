//! Image data types.
pub mod frame;

pub use frame::{Frame, Thumbnail};
