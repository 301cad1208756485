//! Kernels without an accelerator path, running directly on the issuing core.

pub mod pool;
