//! Backend implementations of the HAL.

mod wgpu_backend;

pub use wgpu_backend::WgpuBackend;
