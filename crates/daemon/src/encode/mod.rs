//! External encoder invocation.

pub mod command;
pub mod manifest;

pub use command::{CommandEncoder, EncodeError, EncodeExit, EncodeIo, EncodeRequest, Encoder};
pub use manifest::{map_exit, EncodeManifest, ExitPolicy, Outcome};
