//! CPU-side particle simulation

use crate::error::{CrateResult, ParticlesError};
use glam::Vec2;
use rand::{rngs::StdRng, Rng, SeedableRng};
use shared::{Bounds, Particle, MAX_DELTA_TIME, PARTICLE_RADIUS, PARTICLE_SPEED};
use tracing::debug;

/// Cap a frame delta to [`MAX_DELTA_TIME`] so a long stall (window drag,
/// breakpoint) does not tunnel particles through the walls.
pub fn clamp_delta(dt: f32) -> f32 {
    dt.min(MAX_DELTA_TIME)
}

/// A set of particles bouncing inside a rectangle.
///
/// The generator used to spawn particles is owned and seeded once, so a run
/// can be reproduced from its seed.
pub struct ParticleSystem {
    particles: Vec<Particle>,
    bounds: Bounds,
    rng: StdRng,
}

impl ParticleSystem {
    /// Spawn `count` particles at random positions with random directions
    pub fn new(count: usize, bounds: Bounds, seed: u64) -> CrateResult<Self> {
        if count == 0 {
            return Err(ParticlesError::InvalidSimulation(
                "particle count must be positive".to_string(),
            ));
        }
        validate_bounds(bounds)?;
        let mut system = Self {
            particles: Vec::with_capacity(count),
            bounds,
            rng: StdRng::seed_from_u64(seed),
        };
        system.spawn(count);
        debug!(count, seed, "spawned particles");
        Ok(system)
    }

    /// Wrap an explicit set of particles
    pub fn from_particles(particles: Vec<Particle>, bounds: Bounds, seed: u64) -> CrateResult<Self> {
        validate_bounds(bounds)?;
        Ok(Self {
            particles,
            bounds,
            rng: StdRng::seed_from_u64(seed),
        })
    }

    fn spawn(&mut self, count: usize) {
        let Bounds { width, height } = self.bounds;
        for _ in 0..count {
            // Keep clear of the exact edges.
            let position = Vec2::new(
                self.rng.gen::<f32>() * (width - 2.0) + 1.0,
                self.rng.gen::<f32>() * (height - 2.0) + 1.0,
            );
            let direction = Vec2::new(
                self.rng.gen::<f32>() * 2.0 - 1.0,
                self.rng.gen::<f32>() * 2.0 - 1.0,
            );
            let velocity = if direction.length() >= 0.01 {
                direction.normalize() * PARTICLE_SPEED
            } else {
                Vec2::new(PARTICLE_SPEED, 0.0)
            };
            let color = [
                self.rng.gen::<f32>() * 0.8 + 0.2,
                self.rng.gen::<f32>() * 0.8 + 0.2,
                self.rng.gen::<f32>() * 0.8 + 0.2,
                1.0,
            ];
            self.particles
                .push(Particle::new(position, velocity, color, PARTICLE_RADIUS));
        }
    }

    /// Advance every particle by `dt` seconds. Non-positive deltas are ignored.
    pub fn update(&mut self, dt: f32) {
        if dt <= 0.0 {
            return;
        }
        let bounds = self.bounds;
        for particle in &mut self.particles {
            particle.step(dt, bounds);
        }
    }

    /// Grow (spawning new particles) or shrink the system
    pub fn set_particle_count(&mut self, count: usize) {
        if count < self.particles.len() {
            self.particles.truncate(count);
        } else {
            let missing = count - self.particles.len();
            self.spawn(missing);
        }
        debug!(count, "changed particle count");
    }

    /// Change the area particles bounce in, e.g. after a window resize.
    /// Particles outside the new area are brought back on the next update.
    pub fn set_bounds(&mut self, bounds: Bounds) -> CrateResult<()> {
        validate_bounds(bounds)?;
        self.bounds = bounds;
        Ok(())
    }

    pub fn particles(&self) -> &[Particle] {
        &self.particles
    }

    pub fn bounds(&self) -> Bounds {
        self.bounds
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }
}

fn validate_bounds(bounds: Bounds) -> CrateResult<()> {
    if bounds.width > 0.0 && bounds.height > 0.0 {
        Ok(())
    } else {
        Err(ParticlesError::InvalidSimulation(format!(
            "bounds must be positive, got {}x{}",
            bounds.width, bounds.height
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inside(p: &Particle, bounds: Bounds) -> bool {
        p.position.x - p.radius >= 0.0
            && p.position.x + p.radius <= bounds.width
            && p.position.y - p.radius >= 0.0
            && p.position.y + p.radius <= bounds.height
    }

    #[test]
    fn three_particle_bounce() {
        let bounds = Bounds::new(100.0, 100.0);
        let particles = vec![
            Particle::new(Vec2::new(0.5, 50.0), Vec2::new(-10.0, 0.0), [1.0; 4], 2.0),
            Particle::new(Vec2::new(50.0, 50.0), Vec2::new(10.0, 0.0), [1.0; 4], 2.0),
            Particle::new(Vec2::new(20.0, 80.0), Vec2::new(0.0, -5.0), [1.0; 4], 2.0),
        ];
        let mut system = ParticleSystem::from_particles(particles, bounds, 0).unwrap();
        system.update(1.0);

        let bounced = system.particles()[0];
        assert_eq!(bounced.position.x, 2.0);
        assert_eq!(bounced.velocity.x, 10.0);
        assert_eq!(system.particles()[1].position, Vec2::new(60.0, 50.0));
        assert_eq!(system.particles()[2].position, Vec2::new(20.0, 75.0));
    }

    #[test]
    fn particles_stay_inside_for_every_clamped_delta() {
        let bounds = Bounds::new(200.0, 120.0);
        for step in 1..=100 {
            let dt = step as f32 * 0.001;
            let mut system = ParticleSystem::new(64, bounds, step as u64).unwrap();
            for _ in 0..20 {
                system.update(dt);
                assert!(system.particles().iter().all(|p| inside(p, bounds)), "dt={dt}");
            }
        }
    }

    #[test]
    fn non_positive_delta_is_ignored() {
        let mut system = ParticleSystem::new(8, Bounds::new(50.0, 50.0), 3).unwrap();
        let before = system.particles().to_vec();
        system.update(0.0);
        system.update(-0.5);
        assert_eq!(system.particles(), before.as_slice());
    }

    #[test]
    fn spawn_rules() {
        let bounds = Bounds::new(300.0, 200.0);
        let system = ParticleSystem::new(500, bounds, 42).unwrap();
        for p in system.particles() {
            assert!((1.0..=299.0).contains(&p.position.x));
            assert!((1.0..=199.0).contains(&p.position.y));
            assert!((p.velocity.length() - PARTICLE_SPEED).abs() < 1e-3);
            assert!(p.color[..3].iter().all(|c| (0.2..=1.0).contains(c)));
            assert_eq!(p.color[3], 1.0);
            assert_eq!(p.radius, PARTICLE_RADIUS);
        }
    }

    #[test]
    fn same_seed_same_particles() {
        let bounds = Bounds::new(100.0, 100.0);
        let a = ParticleSystem::new(16, bounds, 7).unwrap();
        let b = ParticleSystem::new(16, bounds, 7).unwrap();
        let c = ParticleSystem::new(16, bounds, 8).unwrap();
        assert_eq!(a.particles(), b.particles());
        assert_ne!(a.particles(), c.particles());
    }

    #[test]
    fn invalid_parameters_rejected() {
        assert!(ParticleSystem::new(0, Bounds::new(10.0, 10.0), 0).is_err());
        assert!(ParticleSystem::new(5, Bounds::new(0.0, 10.0), 0).is_err());
        assert!(ParticleSystem::new(5, Bounds::new(10.0, -1.0), 0).is_err());
    }

    #[test]
    fn particle_count_can_change() {
        let mut system = ParticleSystem::new(10, Bounds::new(100.0, 100.0), 1).unwrap();
        system.set_particle_count(4);
        assert_eq!(system.len(), 4);
        system.set_particle_count(12);
        assert_eq!(system.len(), 12);
    }

    #[test]
    fn delta_is_capped() {
        assert_eq!(clamp_delta(0.016), 0.016);
        assert_eq!(clamp_delta(0.5), MAX_DELTA_TIME);
    }
}
