//! Building blocks of the operator console.
//!
//! - [`command`]: operator input parsing
//! - [`wedge`]: keyboard-wedge scanner as a scan source
//! - [`render`]: plain-text output

pub mod command;
pub mod render;
pub mod wedge;
