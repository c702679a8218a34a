use bytemuck::{Pod, Zeroable};
use glam::Vec2;

/// One simulated particle, laid out exactly as the vertex shader reads it.
///
/// The struct is tightly packed (36 bytes, 4-byte aligned) so the slice of
/// particles can be copied into a vertex buffer byte for byte.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Particle {
    pub position: Vec2,
    pub velocity: Vec2,
    /// RGBA
    pub color: [f32; 4],
    pub radius: f32,
}

impl Particle {
    /// Byte offset of `position` (vertex attribute location 0)
    pub const POSITION_OFFSET: u32 = core::mem::offset_of!(Particle, position) as u32;
    /// Byte offset of `color` (vertex attribute location 1)
    pub const COLOR_OFFSET: u32 = core::mem::offset_of!(Particle, color) as u32;
    /// Byte offset of `velocity` (vertex attribute location 2)
    pub const VELOCITY_OFFSET: u32 = core::mem::offset_of!(Particle, velocity) as u32;
    /// Vertex stride
    pub const STRIDE: u32 = core::mem::size_of::<Particle>() as u32;

    #[inline]
    pub fn new(position: Vec2, velocity: Vec2, color: [f32; 4], radius: f32) -> Self {
        Self {
            position,
            velocity,
            color,
            radius,
        }
    }

    /// Advance the particle by `dt` seconds and bounce it off the walls of `bounds`.
    ///
    /// After the step `position - radius >= 0` and `position + radius <= bounds`
    /// hold on both axes, provided the particle fits inside the bounds at all.
    /// A bounce snaps the particle onto the wall and points its velocity away
    /// from it, so a particle can never get stuck outside.
    #[inline]
    pub fn step(&mut self, dt: f32, bounds: Bounds) {
        self.position += self.velocity * dt;

        if self.position.x - self.radius < 0.0 {
            self.position.x = self.radius;
            self.velocity.x = self.velocity.x.abs();
        } else if self.position.x + self.radius > bounds.width {
            self.position.x = bounds.width - self.radius;
            self.velocity.x = -self.velocity.x.abs();
        }

        if self.position.y - self.radius < 0.0 {
            self.position.y = self.radius;
            self.velocity.y = self.velocity.y.abs();
        } else if self.position.y + self.radius > bounds.height {
            self.position.y = bounds.height - self.radius;
            self.velocity.y = -self.velocity.y.abs();
        }
    }
}

/// Size of the simulation area in pixels
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Bounds {
    pub width: f32,
    pub height: f32,
}

impl Bounds {
    #[inline]
    pub fn new(width: f32, height: f32) -> Self {
        Self { width, height }
    }
}

/// Vertex-stage push constant: framebuffer size in pixels, used by the
/// vertex shader to map particle positions into clip space.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct ViewportPush {
    pub size: [f32; 2],
}
