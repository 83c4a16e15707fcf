/// Arithmetic in GF(2^8) with the AES reduction polynomial x^8 + x^4 + x^3 + x + 1.
///
/// Multiplication is a carry-less shift-and-add loop with no lookup tables,
/// so timing does not depend on secret-indexed memory access.
use std::ops::{Add, Mul};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Gf256(pub(crate) u8);

impl Gf256 {
    pub(crate) const ZERO: Self = Gf256(0);
    pub(crate) const ONE: Self = Gf256(1);

    /// a^254 = a^-1 for every non-zero a. `None` for zero.
    pub(crate) fn inverse(self) -> Option<Self> {
        if self.0 == 0 {
            return None;
        }
        let mut result = Gf256::ONE;
        let mut base = self;
        let mut exp = 254u8;
        while exp > 0 {
            if exp & 1 == 1 {
                result = result * base;
            }
            base = base * base;
            exp >>= 1;
        }
        Some(result)
    }

    /// Horner evaluation of `coeffs[0] + coeffs[1]·x + ...`.
    pub(crate) fn eval_polynomial(coeffs: &[Gf256], x: Gf256) -> Gf256 {
        coeffs
            .iter()
            .rev()
            .fold(Gf256::ZERO, |acc, &c| acc * x + c)
    }

    /// f(0) from distinct non-zero x coordinates:
    /// `Σ y_i · Π_{j≠i} x_j / (x_i + x_j)`.
    pub(crate) fn interpolate_at_zero(points: &[(Gf256, Gf256)]) -> Option<Gf256> {
        let mut acc = Gf256::ZERO;
        for (i, &(xi, yi)) in points.iter().enumerate() {
            let mut num = Gf256::ONE;
            let mut den = Gf256::ONE;
            for (j, &(xj, _)) in points.iter().enumerate() {
                if i != j {
                    num = num * xj;
                    den = den * (xi + xj);
                }
            }
            acc = acc + yi * num * den.inverse()?;
        }
        Some(acc)
    }
}

impl Add for Gf256 {
    type Output = Self;

    #[allow(clippy::suspicious_arithmetic_impl)]
    fn add(self, rhs: Self) -> Self {
        Gf256(self.0 ^ rhs.0)
    }
}

impl Mul for Gf256 {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        let mut a = self.0;
        let mut b = rhs.0;
        let mut product = 0u8;
        for _ in 0..8 {
            // Branch-free conditional add and reduction.
            product ^= a & 0u8.wrapping_sub(b & 1);
            let carry = a >> 7;
            a = (a << 1) ^ (0x1B & 0u8.wrapping_sub(carry));
            b >>= 1;
        }
        Gf256(product)
    }
}
