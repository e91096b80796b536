//! Truncated multivariate power series.
//!
//! An [`Algebra`] fixes the truncation order and the number of domain
//! variables once per run; every [`Tps`] carries a shared handle to it so the
//! arithmetic operators can stay ordinary `std::ops` implementations.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub, SubAssign};
use std::sync::Arc;

use num_traits::ToPrimitive;

use crate::error::{Result, SplitError};

/// Monomial tables for a given order and variable count.
pub struct Algebra {
    order: usize,
    variables: usize,
    exponents: Vec<Vec<u32>>,
    degrees: Vec<usize>,
    lookup: HashMap<Vec<u32>, usize>,
    /// For monomial `i`: every `(j, k)` with `x^i * x^j = x^k` inside the order.
    products: Vec<Vec<(usize, usize)>>,
}

impl fmt::Debug for Algebra {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Algebra")
            .field("order", &self.order)
            .field("variables", &self.variables)
            .field("monomials", &self.exponents.len())
            .finish()
    }
}

impl Algebra {
    pub fn new(order: usize, variables: usize) -> Result<Arc<Self>> {
        if variables == 0 {
            return Err(SplitError::InvalidSetting(
                "algebra needs at least one variable".to_string(),
            ));
        }
        let order_u32 = order
            .to_u32()
            .ok_or_else(|| SplitError::InvalidSetting(format!("order {order} is too large")))?;

        let mut exponents = Vec::new();
        let mut scratch = vec![0u32; variables];
        for degree in 0..=order_u32 {
            push_monomials(&mut exponents, &mut scratch, 0, degree);
        }

        let degrees: Vec<usize> = exponents
            .iter()
            .map(|e| e.iter().map(|&v| v as usize).sum())
            .collect();
        let lookup: HashMap<Vec<u32>, usize> = exponents
            .iter()
            .enumerate()
            .map(|(idx, e)| (e.clone(), idx))
            .collect();

        let mut products = Vec::with_capacity(exponents.len());
        for (i, ei) in exponents.iter().enumerate() {
            let mut row = Vec::new();
            for (j, ej) in exponents.iter().enumerate() {
                // Monomials are graded, so everything past here overflows the order.
                if degrees[i] + degrees[j] > order {
                    break;
                }
                let sum: Vec<u32> = ei.iter().zip(ej).map(|(a, b)| a + b).collect();
                if let Some(&k) = lookup.get(&sum) {
                    row.push((j, k));
                }
            }
            products.push(row);
        }

        Ok(Arc::new(Self {
            order,
            variables,
            exponents,
            degrees,
            lookup,
            products,
        }))
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn variables(&self) -> usize {
        self.variables
    }

    /// Number of monomials kept by the truncation.
    pub fn len(&self) -> usize {
        self.exponents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exponents.is_empty()
    }

    pub fn zero(self: &Arc<Self>) -> Tps {
        Tps {
            algebra: Arc::clone(self),
            coeffs: vec![0.0; self.len()],
        }
    }

    pub fn constant(self: &Arc<Self>, value: f64) -> Tps {
        let mut out = self.zero();
        out.coeffs[0] = value;
        out
    }

    /// The coordinate function of `axis` (0-based).
    pub fn variable(self: &Arc<Self>, axis: usize) -> Result<Tps> {
        if axis >= self.variables {
            return Err(SplitError::InvalidSetting(format!(
                "axis {axis} outside {} variables",
                self.variables
            )));
        }
        let mut out = self.zero();
        if self.order > 0 {
            out.coeffs[self.unit_index(axis)] = 1.0;
        }
        Ok(out)
    }

    /// `[x_0, x_1, ...]`, the identity map of the normalized domain.
    pub fn identity(self: &Arc<Self>) -> Vec<Tps> {
        (0..self.variables)
            .map(|axis| {
                let mut out = self.zero();
                if self.order > 0 {
                    out.coeffs[self.unit_index(axis)] = 1.0;
                }
                out
            })
            .collect()
    }

    fn unit_index(&self, axis: usize) -> usize {
        // Degree-one monomials follow the constant, highest power of x_0 first.
        1 + axis
    }
}

fn push_monomials(out: &mut Vec<Vec<u32>>, scratch: &mut [u32], axis: usize, remaining: u32) {
    if axis + 1 == scratch.len() {
        scratch[axis] = remaining;
        out.push(scratch.to_vec());
        scratch[axis] = 0;
        return;
    }
    for power in (0..=remaining).rev() {
        scratch[axis] = power;
        push_monomials(out, scratch, axis + 1, remaining - power);
    }
    scratch[axis] = 0;
}

/// A truncated power series over the normalized domain variables.
#[derive(Clone)]
pub struct Tps {
    algebra: Arc<Algebra>,
    coeffs: Vec<f64>,
}

impl Tps {
    pub fn algebra(&self) -> &Arc<Algebra> {
        &self.algebra
    }

    pub fn coefficients(&self) -> &[f64] {
        &self.coeffs
    }

    /// Constant part, i.e. the value at the expansion point.
    pub fn cons(&self) -> f64 {
        self.coeffs[0]
    }

    /// Coefficient of the monomial with the given exponents, zero when the
    /// monomial is truncated away.
    pub fn coefficient(&self, exponents: &[u32]) -> f64 {
        self.algebra
            .lookup
            .get(exponents)
            .map(|&idx| self.coeffs[idx])
            .unwrap_or(0.0)
    }

    pub fn set_coefficient(&mut self, exponents: &[u32], value: f64) -> Result<()> {
        match self.algebra.lookup.get(exponents) {
            Some(&idx) => {
                self.coeffs[idx] = value;
                Ok(())
            }
            None => Err(SplitError::InvalidSetting(format!(
                "monomial {exponents:?} is outside the truncation"
            ))),
        }
    }

    /// Partial derivative with respect to `axis`.
    pub fn deriv(&self, axis: usize) -> Tps {
        let mut out = self.algebra.zero();
        for (idx, exps) in self.algebra.exponents.iter().enumerate() {
            let c = self.coeffs[idx];
            let power = exps.get(axis).copied().unwrap_or(0);
            if c == 0.0 || power == 0 {
                continue;
            }
            let mut lowered = exps.clone();
            lowered[axis] -= 1;
            if let Some(&k) = self.algebra.lookup.get(&lowered) {
                out.coeffs[k] += c * f64::from(power);
            }
        }
        out
    }

    /// Evaluates the polynomial at a point; missing coordinates read as zero.
    pub fn eval(&self, point: &[f64]) -> f64 {
        self.algebra
            .exponents
            .iter()
            .zip(&self.coeffs)
            .filter(|(_, c)| **c != 0.0)
            .map(|(exps, c)| {
                exps.iter().enumerate().fold(*c, |acc, (axis, &power)| {
                    if power == 0 {
                        acc
                    } else {
                        acc * point.get(axis).copied().unwrap_or(0.0).powi(power as i32)
                    }
                })
            })
            .sum()
    }

    /// Substitutes `args[i]` for the `i`-th variable.
    pub fn compose(&self, args: &[Tps]) -> Tps {
        let algebra = &self.algebra;
        let order = algebra.order;

        // powers[axis][p] = args[axis]^p
        let mut powers: Vec<Vec<Tps>> = Vec::with_capacity(algebra.variables);
        for axis in 0..algebra.variables {
            let base = args
                .get(axis)
                .cloned()
                .unwrap_or_else(|| algebra.zero());
            let mut row = Vec::with_capacity(order + 1);
            row.push(algebra.constant(1.0));
            for p in 1..=order {
                let next = &row[p - 1] * &base;
                row.push(next);
            }
            powers.push(row);
        }

        let mut out = algebra.zero();
        for (idx, exps) in algebra.exponents.iter().enumerate() {
            let c = self.coeffs[idx];
            if c == 0.0 {
                continue;
            }
            let mut term = algebra.constant(c);
            for (axis, &power) in exps.iter().enumerate() {
                if power > 0 {
                    term = &term * &powers[axis][power as usize];
                }
            }
            out += &term;
        }
        out
    }

    /// Max-norm of the coefficients grouped by total degree (`axis == None`) or
    /// by the power of a single variable. A NaN coefficient poisons its group.
    pub fn order_norms(&self, axis: Option<usize>) -> Vec<f64> {
        let mut norms = vec![0.0_f64; self.algebra.order + 1];
        for (idx, exps) in self.algebra.exponents.iter().enumerate() {
            let group = match axis {
                None => self.algebra.degrees[idx],
                Some(a) => exps.get(a).copied().unwrap_or(0) as usize,
            };
            let c = self.coeffs[idx];
            if c.is_nan() || norms[group].is_nan() {
                norms[group] = f64::NAN;
            } else {
                norms[group] = norms[group].max(c.abs());
            }
        }
        norms
    }

    /// Size of the terms of degree `target`, extrapolated past the truncation
    /// order by a least-squares fit of `ln(norm)` against degree.
    ///
    /// Only non-zero groups of degree one and above take part in the fit.
    /// Fewer than two such groups estimate zero.
    pub fn estimate_norm(&self, axis: Option<usize>, target: usize) -> f64 {
        let norms = self.order_norms(axis);
        if norms.iter().any(|n| n.is_nan()) {
            return f64::NAN;
        }
        if target < norms.len() {
            return norms[target];
        }

        let samples: Vec<(f64, f64)> = norms
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, n)| **n > 0.0)
            .map(|(degree, n)| (degree as f64, n.ln()))
            .collect();
        if samples.len() < 2 {
            return 0.0;
        }

        let count = samples.len() as f64;
        let mean_x = samples.iter().map(|(x, _)| x).sum::<f64>() / count;
        let mean_y = samples.iter().map(|(_, y)| y).sum::<f64>() / count;
        let sxx: f64 = samples.iter().map(|(x, _)| (x - mean_x).powi(2)).sum();
        let sxy: f64 = samples
            .iter()
            .map(|(x, y)| (x - mean_x) * (y - mean_y))
            .sum();
        let slope = sxy / sxx;
        let intercept = mean_y - slope * mean_x;
        (intercept + slope * target as f64).exp()
    }

    /// Sum of the absolute values of every non-constant coefficient, an upper
    /// bound of `|p(x) - p(0)|` on the unit box.
    pub fn variation_bound(&self) -> f64 {
        self.coeffs.iter().skip(1).map(|c| c.abs()).sum()
    }

    pub fn exp(&self) -> Tps {
        let a0 = self.cons().exp();
        let mut factorial = 1.0;
        let series: Vec<f64> = (0..=self.algebra.order)
            .map(|k| {
                if k > 0 {
                    factorial *= k as f64;
                }
                a0 / factorial
            })
            .collect();
        self.taylor(&series)
    }

    pub fn sin(&self) -> Tps {
        let (s, c) = self.cons().sin_cos();
        self.taylor(&periodic_series(self.algebra.order, [s, c, -s, -c]))
    }

    pub fn cos(&self) -> Tps {
        let (s, c) = self.cons().sin_cos();
        self.taylor(&periodic_series(self.algebra.order, [c, -s, -c, s]))
    }

    /// Real power around a positive constant part.
    pub fn powf(&self, exponent: f64) -> Tps {
        let a0 = self.cons();
        let lead = a0.powf(exponent);
        let mut binomial = 1.0;
        let series: Vec<f64> = (0..=self.algebra.order)
            .map(|k| {
                if k > 0 {
                    binomial *= (exponent - (k - 1) as f64) / k as f64;
                }
                lead * binomial / a0.powi(k as i32)
            })
            .collect();
        self.taylor(&series)
    }

    pub fn powi(&self, exponent: i32) -> Tps {
        if exponent < 0 {
            return self.recip().powi(-exponent);
        }
        let mut out = self.algebra.constant(1.0);
        for _ in 0..exponent {
            out = &out * self;
        }
        out
    }

    pub fn sqrt(&self) -> Tps {
        self.powf(0.5)
    }

    pub fn recip(&self) -> Tps {
        let a0 = self.cons();
        let series: Vec<f64> = (0..=self.algebra.order)
            .map(|k| {
                let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                sign / a0.powi(k as i32 + 1)
            })
            .collect();
        self.taylor(&series)
    }

    /// `f(a0 + d)` from `series[k] = f^(k)(a0) / k!`, with `d` the
    /// non-constant part. Horner on a nilpotent `d` truncates naturally.
    fn taylor(&self, series: &[f64]) -> Tps {
        let mut delta = self.clone();
        delta.coeffs[0] = 0.0;
        let mut out = self.algebra.constant(series[series.len() - 1]);
        for &coeff in series.iter().rev().skip(1) {
            out = &out * &delta;
            out.coeffs[0] += coeff;
        }
        out
    }

    fn zip_with(&self, rhs: &Tps, op: impl Fn(f64, f64) -> f64) -> Tps {
        debug_assert!(Arc::ptr_eq(&self.algebra, &rhs.algebra));
        Tps {
            algebra: Arc::clone(&self.algebra),
            coeffs: self
                .coeffs
                .iter()
                .zip(&rhs.coeffs)
                .map(|(a, b)| op(*a, *b))
                .collect(),
        }
    }

    fn map(&self, op: impl Fn(f64) -> f64) -> Tps {
        Tps {
            algebra: Arc::clone(&self.algebra),
            coeffs: self.coeffs.iter().map(|c| op(*c)).collect(),
        }
    }
}

fn periodic_series(order: usize, cycle: [f64; 4]) -> Vec<f64> {
    let mut factorial = 1.0;
    (0..=order)
        .map(|k| {
            if k > 0 {
                factorial *= k as f64;
            }
            cycle[k % 4] / factorial
        })
        .collect()
}

impl fmt::Debug for Tps {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut terms = f.debug_list();
        for (exps, c) in self.algebra.exponents.iter().zip(&self.coeffs) {
            if *c != 0.0 {
                terms.entry(&(exps, c));
            }
        }
        terms.finish()
    }
}

impl PartialEq for Tps {
    fn eq(&self, other: &Self) -> bool {
        self.coeffs == other.coeffs
    }
}

// --- Series arithmetic ---

impl Add<&Tps> for &Tps {
    type Output = Tps;
    fn add(self, rhs: &Tps) -> Tps {
        self.zip_with(rhs, |a, b| a + b)
    }
}

impl Sub<&Tps> for &Tps {
    type Output = Tps;
    fn sub(self, rhs: &Tps) -> Tps {
        self.zip_with(rhs, |a, b| a - b)
    }
}

impl Mul<&Tps> for &Tps {
    type Output = Tps;
    fn mul(self, rhs: &Tps) -> Tps {
        debug_assert!(Arc::ptr_eq(&self.algebra, &rhs.algebra));
        let mut out = self.algebra.zero();
        for (i, &a) in self.coeffs.iter().enumerate() {
            if a == 0.0 {
                continue;
            }
            for &(j, k) in &self.algebra.products[i] {
                out.coeffs[k] += a * rhs.coeffs[j];
            }
        }
        out
    }
}

impl Div<&Tps> for &Tps {
    type Output = Tps;
    fn div(self, rhs: &Tps) -> Tps {
        self * &rhs.recip()
    }
}

impl Neg for &Tps {
    type Output = Tps;
    fn neg(self) -> Tps {
        self.map(|c| -c)
    }
}

impl Neg for Tps {
    type Output = Tps;
    fn neg(self) -> Tps {
        -&self
    }
}

macro_rules! forward_owned_binop {
    ($trait:ident, $method:ident) => {
        impl $trait<Tps> for Tps {
            type Output = Tps;
            fn $method(self, rhs: Tps) -> Tps {
                (&self).$method(&rhs)
            }
        }

        impl $trait<&Tps> for Tps {
            type Output = Tps;
            fn $method(self, rhs: &Tps) -> Tps {
                (&self).$method(rhs)
            }
        }

        impl $trait<Tps> for &Tps {
            type Output = Tps;
            fn $method(self, rhs: Tps) -> Tps {
                self.$method(&rhs)
            }
        }
    };
}

forward_owned_binop!(Add, add);
forward_owned_binop!(Sub, sub);
forward_owned_binop!(Mul, mul);
forward_owned_binop!(Div, div);

impl AddAssign<&Tps> for Tps {
    fn add_assign(&mut self, rhs: &Tps) {
        for (a, b) in self.coeffs.iter_mut().zip(&rhs.coeffs) {
            *a += *b;
        }
    }
}

impl SubAssign<&Tps> for Tps {
    fn sub_assign(&mut self, rhs: &Tps) {
        for (a, b) in self.coeffs.iter_mut().zip(&rhs.coeffs) {
            *a -= *b;
        }
    }
}

// --- Scalar arithmetic ---

impl Add<f64> for &Tps {
    type Output = Tps;
    fn add(self, rhs: f64) -> Tps {
        let mut out = self.clone();
        out.coeffs[0] += rhs;
        out
    }
}

impl Sub<f64> for &Tps {
    type Output = Tps;
    fn sub(self, rhs: f64) -> Tps {
        self + (-rhs)
    }
}

impl Mul<f64> for &Tps {
    type Output = Tps;
    fn mul(self, rhs: f64) -> Tps {
        self.map(|c| c * rhs)
    }
}

impl Div<f64> for &Tps {
    type Output = Tps;
    fn div(self, rhs: f64) -> Tps {
        self.map(|c| c / rhs)
    }
}

macro_rules! forward_scalar_binop {
    ($trait:ident, $method:ident) => {
        impl $trait<f64> for Tps {
            type Output = Tps;
            fn $method(self, rhs: f64) -> Tps {
                (&self).$method(rhs)
            }
        }
    };
}

forward_scalar_binop!(Add, add);
forward_scalar_binop!(Sub, sub);
forward_scalar_binop!(Mul, mul);
forward_scalar_binop!(Div, div);

impl MulAssign<f64> for Tps {
    fn mul_assign(&mut self, rhs: f64) {
        for c in &mut self.coeffs {
            *c *= rhs;
        }
    }
}

impl Add<&Tps> for f64 {
    type Output = Tps;
    fn add(self, rhs: &Tps) -> Tps {
        rhs + self
    }
}

impl Add<Tps> for f64 {
    type Output = Tps;
    fn add(self, rhs: Tps) -> Tps {
        &rhs + self
    }
}

impl Sub<&Tps> for f64 {
    type Output = Tps;
    fn sub(self, rhs: &Tps) -> Tps {
        &(-rhs) + self
    }
}

impl Sub<Tps> for f64 {
    type Output = Tps;
    fn sub(self, rhs: Tps) -> Tps {
        self - &rhs
    }
}

impl Mul<&Tps> for f64 {
    type Output = Tps;
    fn mul(self, rhs: &Tps) -> Tps {
        rhs * self
    }
}

impl Mul<Tps> for f64 {
    type Output = Tps;
    fn mul(self, rhs: Tps) -> Tps {
        &rhs * self
    }
}
