mod counter;
mod gradient_buffer;

pub use counter::LocalAccumulator;
pub use gradient_buffer::GradientBuffer;
