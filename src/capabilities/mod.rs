pub mod builtin;
pub mod registry;

pub use builtin::{register_builtins, EchoCapability, GenerateTextCapability};
pub use registry::{
    Capability, CapabilityContext, CapabilityRegistry, CapabilityResult, FnCapability, TextStream,
};
