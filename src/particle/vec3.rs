use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Copy, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64
}

impl fmt::Debug for Vec3 {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

// Operator overloading

// Add two vectors together
impl std::ops::Add for Vec3 {
    type Output = Vec3;
    fn add(self, other: Vec3) -> Vec3 {
        Vec3 {x: self.x + other.x, y: self.y + other.y, z: self.z + other.z}
    }
}

impl std::ops::AddAssign for Vec3 {
    fn add_assign(&mut self, other: Vec3) {
        *self = *self + other;
    }
}

// Subtract one vector from another
impl std::ops::Sub for Vec3 {
    type Output = Vec3;
    fn sub(self, other: Vec3) -> Vec3 {
        Vec3 {x: self.x - other.x, y: self.y - other.y, z: self.z - other.z}
    }
}

// Multiply, i.e. dot, two vectors
impl std::ops::Mul for Vec3 {
    type Output = f64;
    fn mul(self, other: Vec3) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }
}

// Multiply a vector by a scalar
impl std::ops::Mul<f64> for Vec3 {
    type Output = Vec3;
    fn mul(self, other: f64) -> Vec3 {
        Vec3{x: self.x * other, y: self.y * other, z: self.z * other}
    }
}

// Multiply a scalar by a vector
impl std::ops::Mul<Vec3> for f64 {
    type Output = Vec3;
    fn mul(self, other: Vec3) -> Vec3 {
        Vec3{x: self * other.x, y: self * other.y, z: self * other.z}
    }
}

// Negate a vector
impl std::ops::Neg for Vec3 {
    type Output = Vec3;
    fn neg(self) -> Vec3 {
        -1.0 * self
    }
}

// Divide a vector by a scalar
impl std::ops::Div<f64> for Vec3 {
    type Output = Vec3;
    fn div(self, other: f64) -> Vec3 {
        Vec3{x: self.x / other, y: self.y / other, z: self.z / other}
    }
}

// Component along an axis, 0 = x
impl std::ops::Index<usize> for Vec3 {
    type Output = f64;
    fn index(&self, axis: usize) -> &f64 {
        match axis {
            0 => &self.x,
            1 => &self.y,
            2 => &self.z,
            _ => panic!("axis {} out of range for a three-vector", axis),
        }
    }
}

impl std::ops::IndexMut<usize> for Vec3 {
    fn index_mut(&mut self, axis: usize) -> &mut f64 {
        match axis {
            0 => &mut self.x,
            1 => &mut self.y,
            2 => &mut self.z,
            _ => panic!("axis {} out of range for a three-vector", axis),
        }
    }
}

impl Vec3 {
    pub fn new(x: f64, y: f64, z: f64) -> Vec3 {
        Vec3{x: x, y: y, z: z}
    }

    pub fn zero() -> Vec3 {
        Vec3::default()
    }

    /// Applies `f` to each component in turn, passing the axis index.
    pub fn map<F: Fn(usize, f64) -> f64>(self, f: F) -> Vec3 {
        Vec3{x: f(0, self.x), y: f(1, self.y), z: f(2, self.z)}
    }

    pub fn norm_sqr(self) -> f64 {
        self * self
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indexing_matches_fields() {
        let mut v = Vec3::new(1.0, 2.0, 3.0);
        v[2] = -3.0;
        assert_eq!(v[0], v.x);
        assert_eq!(v.z, -3.0);
        assert_eq!(v.map(|i, c| c * i as f64), Vec3::new(0.0, 2.0, -6.0));
    }
}
