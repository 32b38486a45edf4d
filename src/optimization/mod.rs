mod adam;
mod gradient_descent;
mod gradient_descent_with_momentum;
mod handle;
mod optimizer;

pub use adam::Adam;
pub use gradient_descent::GradientDescent;
pub use gradient_descent_with_momentum::GradientDescentWithMomentum;
pub use handle::OptimizerHandle;
pub use optimizer::Optimizer;

use crate::error::{CoordinatorError, Result};

fn check_len(grad: &[f32], params: &[f32]) -> Result<()> {
    if grad.len() != params.len() {
        return Err(CoordinatorError::SizeMismatch {
            what: "gradient",
            got: grad.len(),
            expected: params.len(),
        });
    }

    Ok(())
}
