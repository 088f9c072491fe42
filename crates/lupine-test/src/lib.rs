//! Test harness for the Lupine GPU layer.
//!
//! Provides a recording fake device, a scriptable presentation target and
//! shader stubs so resource lifetimes and frame synchronization can be
//! checked without a GPU.

pub mod device;
pub mod logging;
pub mod target;

pub use device::{Call, Event, FailPoint, FakeDevice, HandleKind};
pub use logging::init_test_logging;
pub use target::FakeTarget;

use lupine_gpu::pipeline::SPIRV_MAGIC;
use lupine_gpu::ShaderSet;
use thiserror::Error;

/// Failure reported by [`FakeDevice::check`].
#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("Device contract violated: {0:?}")]
    Violations(Vec<String>),
}

/// Minimal SPIR-V word stream; `tag` makes modules distinguishable.
pub fn spirv_stub(tag: u32) -> Vec<u32> {
    vec![SPIRV_MAGIC, 0x0001_0000, 0, tag, 0]
}

/// Vertex and fragment stubs tagged 1 and 2.
pub fn stub_shaders() -> ShaderSet {
    ShaderSet::vertex_fragment(spirv_stub(1), spirv_stub(2))
}
