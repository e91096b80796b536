use crate::algebra::Tps;
use crate::traits::VectorField;

/// A single-step scheme advancing a polynomial state in place.
pub trait Steppable {
    /// Performs one step of size dt.
    /// t: current time (updated after step)
    /// state: current state (updated after step)
    /// dt: step size
    fn step(&mut self, system: &impl VectorField, t: &mut f64, state: &mut [Tps], dt: f64);
}

/// Resizes stage buffers to the state; their contents are always overwritten.
fn fit(buffer: &mut Vec<Tps>, state: &[Tps]) {
    if buffer.len() != state.len() {
        *buffer = state.to_vec();
    }
}

/// Explicit Euler.
#[derive(Default)]
pub struct Euler {
    k: Vec<Tps>,
}

impl Euler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Steppable for Euler {
    fn step(&mut self, system: &impl VectorField, t: &mut f64, state: &mut [Tps], dt: f64) {
        fit(&mut self.k, state);
        system.derivative(*t, state, &mut self.k);
        for (x, k) in state.iter_mut().zip(&self.k) {
            *x += &(k * dt);
        }
        *t += dt;
    }
}

/// Classical fourth-order Runge-Kutta with Kutta's 3/8 nodes.
#[derive(Default)]
pub struct RK4 {
    k1: Vec<Tps>,
    k2: Vec<Tps>,
    k3: Vec<Tps>,
    k4: Vec<Tps>,
    tmp: Vec<Tps>,
}

impl RK4 {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Steppable for RK4 {
    fn step(&mut self, system: &impl VectorField, t: &mut f64, state: &mut [Tps], dt: f64) {
        for buffer in [
            &mut self.k1,
            &mut self.k2,
            &mut self.k3,
            &mut self.k4,
            &mut self.tmp,
        ] {
            fit(buffer, state);
        }
        let third = 1.0 / 3.0;
        let t0 = *t;

        // k1 = f(t, y)
        system.derivative(t0, state, &mut self.k1);

        // k2 = f(t + dt/3, y + dt*k1/3)
        for i in 0..state.len() {
            self.tmp[i] = &state[i] + &(&self.k1[i] * (dt * third));
        }
        system.derivative(t0 + dt * third, &self.tmp, &mut self.k2);

        // k3 = f(t + 2dt/3, y + dt*(k2 - k1/3))
        for i in 0..state.len() {
            self.tmp[i] = &state[i] + &(&(&self.k2[i] - &(&self.k1[i] * third)) * dt);
        }
        system.derivative(t0 + 2.0 * dt * third, &self.tmp, &mut self.k3);

        // k4 = f(t + dt, y + dt*(k1 - k2 + k3))
        for i in 0..state.len() {
            self.tmp[i] = &state[i] + &(&(&(&self.k1[i] - &self.k2[i]) + &self.k3[i]) * dt);
        }
        system.derivative(t0 + dt, &self.tmp, &mut self.k4);

        // y_next = y + dt/8 * (k1 + 3k2 + 3k3 + k4)
        for i in 0..state.len() {
            let sum = &(&self.k1[i] + &(&(&self.k2[i] + &self.k3[i]) * 3.0)) + &self.k4[i];
            state[i] += &(&sum * (dt / 8.0));
        }

        *t = t0 + dt;
    }
}

// Fehlberg 7(8) tableau.
const RK78_C: [f64; 13] = [
    0.0,
    2.0 / 27.0,
    1.0 / 9.0,
    1.0 / 6.0,
    5.0 / 12.0,
    0.5,
    5.0 / 6.0,
    1.0 / 6.0,
    2.0 / 3.0,
    1.0 / 3.0,
    1.0,
    0.0,
    1.0,
];

const RK78_A: [[f64; 12]; 13] = [
    [0.0; 12],
    [2.0 / 27.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 36.0, 1.0 / 12.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [1.0 / 24.0, 0.0, 1.0 / 8.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [0.05, 0.0, 0.0, 0.25, 0.2, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
    [
        -25.0 / 108.0,
        0.0,
        0.0,
        125.0 / 108.0,
        -65.0 / 27.0,
        125.0 / 54.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
    ],
    [
        31.0 / 300.0,
        0.0,
        0.0,
        0.0,
        61.0 / 225.0,
        -2.0 / 9.0,
        13.0 / 900.0,
        0.0,
        0.0,
        0.0,
        0.0,
        0.0,
    ],
    [
        2.0,
        0.0,
        0.0,
        -53.0 / 6.0,
        704.0 / 45.0,
        -107.0 / 9.0,
        67.0 / 90.0,
        3.0,
        0.0,
        0.0,
        0.0,
        0.0,
    ],
    [
        -91.0 / 108.0,
        0.0,
        0.0,
        23.0 / 108.0,
        -976.0 / 135.0,
        311.0 / 54.0,
        -19.0 / 60.0,
        17.0 / 6.0,
        -1.0 / 12.0,
        0.0,
        0.0,
        0.0,
    ],
    [
        2383.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -301.0 / 82.0,
        2133.0 / 4100.0,
        45.0 / 82.0,
        45.0 / 164.0,
        18.0 / 41.0,
        0.0,
        0.0,
    ],
    [
        3.0 / 205.0,
        0.0,
        0.0,
        0.0,
        0.0,
        -6.0 / 41.0,
        -3.0 / 205.0,
        -3.0 / 41.0,
        3.0 / 41.0,
        6.0 / 41.0,
        0.0,
        0.0,
    ],
    [
        -1777.0 / 4100.0,
        0.0,
        0.0,
        -341.0 / 164.0,
        4496.0 / 1025.0,
        -289.0 / 82.0,
        2193.0 / 4100.0,
        51.0 / 82.0,
        33.0 / 164.0,
        12.0 / 41.0,
        0.0,
        1.0,
    ],
];

/// Eighth-order weights.
const RK78_B: [f64; 13] = [
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    34.0 / 105.0,
    9.0 / 35.0,
    9.0 / 35.0,
    9.0 / 280.0,
    9.0 / 280.0,
    0.0,
    41.0 / 840.0,
    41.0 / 840.0,
];

/// Seventh minus eighth order solution is this factor times
/// `dt * (k1 + k11 - k12 - k13)`.
const RK78_ERROR: f64 = 41.0 / 840.0;

/// Outcome of one embedded 7(8) attempt.
pub struct Rk78Attempt {
    /// Eighth-order solution at `t + dt`.
    pub state: Vec<Tps>,
    /// Max over components of the constant-part gap between both orders.
    pub error: f64,
}

/// Embedded Runge-Kutta-Fehlberg 7(8) kernel.
#[derive(Default)]
pub struct Rk78 {
    k: Vec<Vec<Tps>>,
    tmp: Vec<Tps>,
}

impl Rk78 {
    pub fn new() -> Self {
        Self::default()
    }

    /// Computes a trial step without committing it.
    pub fn attempt(
        &mut self,
        system: &impl VectorField,
        t: f64,
        state: &[Tps],
        dt: f64,
    ) -> Rk78Attempt {
        if self.k.len() != RK78_C.len() {
            self.k = vec![Vec::new(); RK78_C.len()];
        }
        for stage in &mut self.k {
            fit(stage, state);
        }
        fit(&mut self.tmp, state);

        for s in 0..RK78_C.len() {
            for i in 0..state.len() {
                let mut acc = state[i].clone();
                for (j, &a) in RK78_A[s].iter().enumerate().take(s) {
                    if a != 0.0 {
                        acc += &(&self.k[j][i] * (dt * a));
                    }
                }
                self.tmp[i] = acc;
            }
            system.derivative(t + RK78_C[s] * dt, &self.tmp, &mut self.k[s]);
        }

        let mut next = state.to_vec();
        let mut error = 0.0_f64;
        for i in 0..state.len() {
            for (s, &b) in RK78_B.iter().enumerate() {
                if b != 0.0 {
                    next[i] += &(&self.k[s][i] * (dt * b));
                }
            }
            let gap = (self.k[0][i].cons() + self.k[10][i].cons()
                - self.k[11][i].cons()
                - self.k[12][i].cons())
                * RK78_ERROR
                * dt;
            // NaN must survive so the caller can refuse the step.
            error = if gap.is_nan() || error.is_nan() {
                f64::NAN
            } else {
                error.max(gap.abs())
            };
        }

        Rk78Attempt { state: next, error }
    }
}
