use crate::algebra::Tps;

/// Right-hand side of an ODE acting on polynomial states.
///
/// Implementations are pure: the same state and time must give the same
/// derivative, which lets patches be integrated independently.
pub trait VectorField {
    /// Returns the dimension of the state space.
    fn dimension(&self) -> usize;

    /// Evaluates the vector field.
    /// t: current time
    /// x: current state, one series per component
    /// out: buffer to write dx/dt into, already sized to `dimension()`
    fn derivative(&self, t: f64, x: &[Tps], out: &mut [Tps]);
}

impl<F: VectorField + ?Sized> VectorField for &F {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn derivative(&self, t: f64, x: &[Tps], out: &mut [Tps]) {
        (**self).derivative(t, x, out)
    }
}

impl<F: VectorField + ?Sized> VectorField for std::sync::Arc<F> {
    fn dimension(&self) -> usize {
        (**self).dimension()
    }

    fn derivative(&self, t: f64, x: &[Tps], out: &mut [Tps]) {
        (**self).derivative(t, x, out)
    }
}
