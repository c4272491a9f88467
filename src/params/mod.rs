//! Self-describing, persistable backend parameters

pub mod codec;
pub mod parameter;
pub mod registry;

pub use parameter::{ParamValue, Parameter};
pub use registry::{Category, CategorySpec, ParamDecl, ParamDiff, ParamRegistry};
