//! In-memory stand-ins for the host services an exporter depends on.
//!
//! [`MockPagePool`] backs every frame with real bytes, so data written through
//! a [`MockVmArea`] can be observed through a [`MockDevice`] and the other way
//! around. The device keeps its own copy of each mapped span to model a
//! non-coherent cache, which makes missing sync calls visible in tests.

pub use self::{device::*, pool::*, vma::*};

mod device;
mod pool;
mod vma;
