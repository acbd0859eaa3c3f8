//! Math types for soundstage

pub use glam::{Quat, Vec3};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose {
    pub position: Vec3,
    pub rotation: Quat,
}

impl Pose {
    pub fn new(position: Vec3, rotation: Quat) -> Self {
        Self { position, rotation }
    }

    pub fn identity() -> Self {
        Self {
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn from_position(position: Vec3) -> Self {
        Self {
            position,
            rotation: Quat::IDENTITY,
        }
    }

    pub fn forward(&self) -> Vec3 {
        self.rotation * (-Vec3::Z)
    }

    pub fn up(&self) -> Vec3 {
        self.rotation * Vec3::Y
    }

    pub fn right(&self) -> Vec3 {
        self.rotation * Vec3::X
    }

    pub fn distance(&self, other: &Self) -> f32 {
        self.position.distance(other.position)
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Axis-aligned box used for zone volumes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: Vec3,
    pub max: Vec3,
}

impl Bounds {
    pub fn new(a: Vec3, b: Vec3) -> Self {
        Self {
            min: a.min(b),
            max: a.max(b),
        }
    }

    /// Box centred on `origin` reaching `extent` along each axis.
    pub fn around(origin: Vec3, extent: Vec3) -> Self {
        let extent = extent.abs();
        Self {
            min: origin - extent,
            max: origin + extent,
        }
    }

    pub fn contains(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn size(&self) -> Vec3 {
        self.max - self.min
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) * 0.5
    }

    pub fn volume(&self) -> f32 {
        let s = self.size();
        s.x * s.y * s.z
    }

    /// A box with zero (or negative) extent on any axis, or non-finite corners.
    pub fn is_degenerate(&self) -> bool {
        let s = self.size();
        !(self.min.is_finite() && self.max.is_finite()) || s.x <= 0.0 || s.y <= 0.0 || s.z <= 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_contains_edges() {
        let b = Bounds::new(Vec3::new(1.0, 1.0, 1.0), Vec3::ZERO);
        assert_eq!(b.min, Vec3::ZERO);
        assert!(b.contains(Vec3::splat(0.5)));
        assert!(b.contains(Vec3::ONE));
        assert!(!b.contains(Vec3::new(1.01, 0.5, 0.5)));
        assert!((b.volume() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_degenerate_bounds() {
        assert!(Bounds::around(Vec3::ZERO, Vec3::new(1.0, 0.0, 1.0)).is_degenerate());
        assert!(Bounds::around(Vec3::ZERO, Vec3::new(f32::NAN, 1.0, 1.0)).is_degenerate());
        assert!(!Bounds::around(Vec3::ZERO, Vec3::ONE).is_degenerate());
    }

    #[test]
    fn test_pose_axes() {
        let pose = Pose::identity();
        assert_eq!(pose.forward(), -Vec3::Z);
        assert_eq!(pose.right(), Vec3::X);
        assert_eq!(pose.up(), Vec3::Y);
    }
}
