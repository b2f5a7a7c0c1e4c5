//! Per-class particle buffers, their locks, and the force/integration step.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use rand::Rng;

use crate::error::{Result, SimError};

// ===================================================================================
// Particle Storage
// ===================================================================================

/// One class's particles in a **Structure of Arrays** layout. Index `i` in
/// every vector belongs to the same particle.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassBuffer {
    pub x: Vec<f32>,
    pub y: Vec<f32>,
    pub vx: Vec<f32>,
    pub vy: Vec<f32>,
}

impl ClassBuffer {
    /// Particles at rest at the given positions.
    pub fn at_rest(positions: &[(f32, f32)]) -> Self {
        let n = positions.len();
        Self {
            x: positions.iter().map(|p| p.0).collect(),
            y: positions.iter().map(|p| p.1).collect(),
            vx: vec![0.0; n],
            vy: vec![0.0; n],
        }
    }

    /// `n` particles placed uniformly in `[0, width) × [0, height)`.
    fn random<R: Rng + ?Sized>(n: usize, width: f32, height: f32, rng: &mut R) -> Self {
        let mut x = Vec::with_capacity(n);
        let mut y = Vec::with_capacity(n);
        for _ in 0..n {
            x.push(rng.random_range(0.0..width));
            y.push(rng.random_range(0.0..height));
        }
        Self {
            x,
            y,
            vx: vec![0.0; n],
            vy: vec![0.0; n],
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    pub fn positions(&self) -> impl Iterator<Item = (f32, f32)> + '_ {
        self.x.iter().copied().zip(self.y.iter().copied())
    }

    fn is_consistent(&self) -> bool {
        let n = self.x.len();
        self.y.len() == n && self.vx.len() == n && self.vy.len() == n
    }
}

// ===================================================================================
// Force and Integration
// ===================================================================================

/// Constants of the force law and the world it runs in.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Physics {
    pub cutoff_radius: f32,
    pub damping: f32,
    pub width: f32,
    pub height: f32,
}

/// Where the moving class reads source positions from.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// The moving class itself, read in place as it is updated.
    SelfClass,
    Other(&'a ClassBuffer),
}

/// Moves every particle of `moving` one step under the pull of `source`.
///
/// Particles are processed in index order. With [`Source::SelfClass`] the
/// buffer is updated in place, so particle `i` feels the already-moved
/// positions of particles `0..i`.
///
/// The caller must hold the locks of both classes for the whole call, which
/// the borrow of `moving` (and of the `Other` buffer) already enforces.
pub fn apply_forces(moving: &mut ClassBuffer, source: Source<'_>, coefficient: f32, physics: &Physics) {
    for i in 0..moving.len() {
        let (px, py) = (moving.x[i], moving.y[i]);
        let (fx, fy) = match source {
            Source::SelfClass => net_force(px, py, &moving.x, &moving.y, coefficient, physics.cutoff_radius),
            Source::Other(src) => net_force(px, py, &src.x, &src.y, coefficient, physics.cutoff_radius),
        };

        let vx = (moving.vx[i] + fx) * physics.damping;
        let vy = (moving.vy[i] + fy) * physics.damping;
        let (x, vx) = reflect_and_wrap(px + vx, vx, physics.width);
        let (y, vy) = reflect_and_wrap(py + vy, vy, physics.height);

        moving.x[i] = x;
        moving.y[i] = y;
        moving.vx[i] = vx;
        moving.vy[i] = vy;
    }
}

/// Sum of `coefficient / d * (dx, dy)` over every source closer than the
/// cutoff. Coincident points (d = 0) contribute nothing.
fn net_force(px: f32, py: f32, xs: &[f32], ys: &[f32], coefficient: f32, cutoff: f32) -> (f32, f32) {
    let mut fx = 0.0;
    let mut fy = 0.0;
    for (&qx, &qy) in xs.iter().zip(ys) {
        let dx = px - qx;
        let dy = py - qy;
        let d = (dx * dx + dy * dy).sqrt();
        if d > 0.0 && d < cutoff {
            let f = coefficient / d;
            fx += f * dx;
            fy += f * dy;
        }
    }
    (fx, fy)
}

/// Leaving `[0, bound]` flips the velocity and teleports the coordinate one
/// `bound` towards the other side. A step longer than the whole bound is
/// folded back in as well.
fn reflect_and_wrap(pos: f32, vel: f32, bound: f32) -> (f32, f32) {
    if (0.0..=bound).contains(&pos) {
        return (pos, vel);
    }
    let mut wrapped = if pos < 0.0 { pos + bound } else { pos - bound };
    if !(0.0..=bound).contains(&wrapped) {
        wrapped = wrapped.rem_euclid(bound);
    }
    (wrapped, -vel)
}

// ===================================================================================
// Field and Locks
// ===================================================================================

struct ClassSlot {
    buffer: Mutex<ClassBuffer>,
    holders: AtomicUsize,
}

/// All classes' particles, one lock per class.
///
/// Locks sit in a fixed arena indexed by class id. Every acquisition goes
/// through [`ClassGuard`], which counts holders so overlapping grants show up
/// in [`ParticleField::exclusion_violations`].
pub struct ParticleField {
    slots: Box<[ClassSlot]>,
    particles_per_class: usize,
    acquisitions: AtomicUsize,
    violations: AtomicUsize,
}

impl ParticleField {
    /// `num_classes` classes of `particles_per_class` particles each, placed
    /// uniformly in the world and at rest.
    pub fn random<R: Rng + ?Sized>(
        num_classes: usize,
        particles_per_class: usize,
        width: f32,
        height: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if !(width.is_finite() && width > 0.0 && height.is_finite() && height > 0.0) {
            return Err(SimError::InvalidConfig(format!(
                "world must have finite positive size, got {width}x{height}"
            )));
        }
        let buffers = (0..num_classes)
            .map(|_| ClassBuffer::random(particles_per_class, width, height, rng))
            .collect();
        Self::from_buffers(buffers)
    }

    /// Takes explicit initial state. Every class must be non-empty and all
    /// classes must have the same particle count.
    pub fn from_buffers(buffers: Vec<ClassBuffer>) -> Result<Self> {
        let Some(first) = buffers.first() else {
            return Err(SimError::InvalidConfig("field needs at least one class".into()));
        };
        let particles_per_class = first.len();
        if particles_per_class == 0 {
            return Err(SimError::InvalidConfig("classes must not be empty".into()));
        }
        for (class, buffer) in buffers.iter().enumerate() {
            if !buffer.is_consistent() {
                return Err(SimError::InvalidConfig(format!(
                    "class {class} has mismatched position/velocity lengths"
                )));
            }
            if buffer.len() != particles_per_class {
                return Err(SimError::InvalidConfig(format!(
                    "class {class} has {} particles, expected {particles_per_class}",
                    buffer.len()
                )));
            }
        }

        let slots = buffers
            .into_iter()
            .map(|buffer| ClassSlot {
                buffer: Mutex::new(buffer),
                holders: AtomicUsize::new(0),
            })
            .collect();

        Ok(Self {
            slots,
            particles_per_class,
            acquisitions: AtomicUsize::new(0),
            violations: AtomicUsize::new(0),
        })
    }

    pub fn num_classes(&self) -> usize {
        self.slots.len()
    }

    pub fn particles_per_class(&self) -> usize {
        self.particles_per_class
    }

    pub fn check_class(&self, class: usize) -> Result<()> {
        if class < self.slots.len() {
            Ok(())
        } else {
            Err(SimError::ClassOutOfRange {
                class,
                num_classes: self.slots.len(),
            })
        }
    }

    /// Exclusive access to one class.
    pub fn lock(&self, class: usize) -> Result<ClassGuard<'_>> {
        self.check_class(class)?;
        Ok(self.acquire(class))
    }

    /// Exclusive access to `target` and, if different, `source`. Locks are
    /// always taken in ascending class order, so two jobs asking for the same
    /// pair in opposite roles cannot deadlock.
    pub fn lock_pair(&self, target: usize, source: usize) -> Result<PairGuard<'_>> {
        self.check_class(target)?;
        self.check_class(source)?;

        if target == source {
            return Ok(PairGuard {
                target: self.acquire(target),
                source: None,
            });
        }

        let (low, high) = if target < source { (target, source) } else { (source, target) };
        let low_guard = self.acquire(low);
        let high_guard = self.acquire(high);
        let (target, source) = if target == low {
            (low_guard, high_guard)
        } else {
            (high_guard, low_guard)
        };
        Ok(PairGuard {
            target,
            source: Some(source),
        })
    }

    /// Copy of one class's current state.
    pub fn snapshot(&self, class: usize) -> Result<ClassBuffer> {
        self.with_class(class, ClassBuffer::clone)
    }

    /// Runs `f` on a class's buffer under its lock.
    pub fn with_class<T>(&self, class: usize, f: impl FnOnce(&ClassBuffer) -> T) -> Result<T> {
        let guard = self.lock(class)?;
        Ok(f(&guard))
    }

    /// Total lock grants since construction.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::Acquire)
    }

    /// Grants that found another holder on the same class. Always zero
    /// unless mutual exclusion is broken.
    pub fn exclusion_violations(&self) -> usize {
        self.violations.load(Ordering::Acquire)
    }

    fn acquire(&self, class: usize) -> ClassGuard<'_> {
        let slot = &self.slots[class];
        let guard = slot.buffer.lock().unwrap_or_else(|poisoned| {
            log::warn!("class {class} lock was poisoned by a faulted job; recovering");
            slot.buffer.clear_poison();
            poisoned.into_inner()
        });

        self.acquisitions.fetch_add(1, Ordering::AcqRel);
        if slot.holders.fetch_add(1, Ordering::AcqRel) != 0 {
            self.violations.fetch_add(1, Ordering::AcqRel);
        }

        ClassGuard {
            class,
            guard,
            holders: &slot.holders,
        }
    }
}

/// Exclusive access to one class's buffer.
pub struct ClassGuard<'a> {
    class: usize,
    guard: MutexGuard<'a, ClassBuffer>,
    holders: &'a AtomicUsize,
}

impl ClassGuard<'_> {
    pub fn class(&self) -> usize {
        self.class
    }
}

impl Deref for ClassGuard<'_> {
    type Target = ClassBuffer;

    fn deref(&self) -> &ClassBuffer {
        &self.guard
    }
}

impl DerefMut for ClassGuard<'_> {
    fn deref_mut(&mut self) -> &mut ClassBuffer {
        &mut self.guard
    }
}

impl Drop for ClassGuard<'_> {
    fn drop(&mut self) {
        // Runs before the MutexGuard field is dropped, so the count never
        // goes to zero while the lock is still held.
        self.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Both locks of an interaction job, held together.
pub struct PairGuard<'a> {
    target: ClassGuard<'a>,
    source: Option<ClassGuard<'a>>,
}

impl PairGuard<'_> {
    pub fn target_class(&self) -> usize {
        self.target.class()
    }

    pub fn source_class(&self) -> usize {
        self.source.as_ref().map_or(self.target.class(), ClassGuard::class)
    }

    /// Moves the target class under the source's pull.
    pub fn apply_forces(&mut self, coefficient: f32, physics: &Physics) {
        match &self.source {
            Some(source) => apply_forces(&mut self.target, Source::Other(&**source), coefficient, physics),
            None => apply_forces(&mut self.target, Source::SelfClass, coefficient, physics),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const PHYSICS: Physics = Physics {
        cutoff_radius: 80.0,
        damping: 0.05,
        width: 1920.0,
        height: 1080.0,
    };

    #[test]
    fn worked_example_first_step() {
        // Two single-particle classes 40 apart on the x axis, coefficient 10.
        let mut a = ClassBuffer::at_rest(&[(100.0, 200.0)]);
        let b = ClassBuffer::at_rest(&[(140.0, 200.0)]);

        apply_forces(&mut a, Source::Other(&b), 10.0, &PHYSICS);

        // F = 10 / 40 = 0.25; v = (0 + F * dx) * 0.05 with dx = -40.
        let expected_vx = (0.0 + 0.25 * -40.0) * 0.05;
        assert!((a.vx[0] - expected_vx).abs() < 1e-4, "vx = {}", a.vx[0]);
        assert!(a.vy[0].abs() < 1e-4);
        assert!((a.x[0] - (100.0 + expected_vx)).abs() < 1e-4);
        assert_eq!(a.y[0], 200.0);
        // The source class is only read.
        assert_eq!(b, ClassBuffer::at_rest(&[(140.0, 200.0)]));
    }

    #[test]
    fn sources_outside_the_cutoff_or_coincident_exert_nothing() {
        let mut a = ClassBuffer::at_rest(&[(500.0, 500.0)]);
        let b = ClassBuffer::at_rest(&[(500.0, 500.0), (580.0, 500.0), (500.0, 700.0)]);
        apply_forces(&mut a, Source::Other(&b), 50.0, &PHYSICS);
        assert_eq!(a, ClassBuffer::at_rest(&[(500.0, 500.0)]));
    }

    #[test]
    fn velocity_is_damped_every_step() {
        let mut a = ClassBuffer::at_rest(&[(500.0, 500.0)]);
        a.vx[0] = 10.0;
        apply_forces(&mut a, Source::SelfClass, 1.0, &PHYSICS);
        assert_eq!(a.vx[0], 10.0 * 0.05);
        assert_eq!(a.x[0], 500.0 + 10.0 * 0.05);
    }

    #[test]
    fn self_interaction_sees_earlier_particles_already_moved() {
        let start = [(100.0, 100.0), (110.0, 100.0), (100.0, 110.0)];
        let mut in_place = ClassBuffer::at_rest(&start);
        apply_forces(&mut in_place, Source::SelfClass, 20.0, &PHYSICS);

        // A simultaneous update would read the untouched buffer instead.
        let frozen = ClassBuffer::at_rest(&start);
        let mut simultaneous = frozen.clone();
        apply_forces(&mut simultaneous, Source::Other(&frozen), 20.0, &PHYSICS);

        // Particle 0 is pushed off both neighbours to (99, 99) either way.
        assert_eq!((in_place.x[0], in_place.y[0]), (99.0, 99.0));
        assert_eq!((simultaneous.x[0], simultaneous.y[0]), (99.0, 99.0));
        assert_ne!(in_place.vy[1], simultaneous.vy[1]);

        // Particle 1 feels particle 0 at its new spot (99, 99).
        let expected_vy = (20.0 / 122.0_f32.sqrt() - 200.0 / 200.0_f32.sqrt()) * 0.05;
        assert!((in_place.vy[1] - expected_vy).abs() < 1e-4, "vy = {}", in_place.vy[1]);
    }

    #[test]
    fn leaving_the_world_reflects_velocity_and_wraps_position() {
        assert_eq!(reflect_and_wrap(-3.0, -5.0, 100.0), (97.0, 5.0));
        assert_eq!(reflect_and_wrap(104.0, 6.0, 100.0), (4.0, -6.0));
        assert_eq!(reflect_and_wrap(100.0, 6.0, 100.0), (100.0, 6.0));
        assert_eq!(reflect_and_wrap(0.0, -1.0, 100.0), (0.0, -1.0));
    }

    #[test]
    fn overshooting_a_whole_bound_still_lands_inside() {
        let (pos, vel) = reflect_and_wrap(-250.0, -300.0, 100.0);
        assert!((0.0..=100.0).contains(&pos), "pos = {pos}");
        assert_eq!(vel, 300.0);

        let (pos, _) = reflect_and_wrap(420.0, 400.0, 100.0);
        assert!((0.0..=100.0).contains(&pos), "pos = {pos}");
    }

    #[test]
    fn strongest_accepted_coefficient_keeps_particles_in_bounds() {
        let mut a = ClassBuffer::at_rest(&[(100.0, 200.0)]);
        let b = ClassBuffer::at_rest(&[(100.0001, 200.0)]);

        apply_forces(&mut a, Source::Other(&b), crate::matrix::MAX_COEFFICIENT, &PHYSICS);

        assert!(a.vx[0].is_finite() && a.vy[0].is_finite());
        assert!((0.0..=PHYSICS.width).contains(&a.x[0]), "x = {}", a.x[0]);
        assert!((0.0..=PHYSICS.height).contains(&a.y[0]), "y = {}", a.y[0]);
    }

    #[test]
    fn random_field_is_in_bounds_and_at_rest() {
        let mut rng = StdRng::seed_from_u64(5);
        let field = ParticleField::random(3, 200, 640.0, 480.0, &mut rng).unwrap();
        assert_eq!(field.num_classes(), 3);
        assert_eq!(field.particles_per_class(), 200);
        for class in 0..3 {
            let buffer = field.snapshot(class).unwrap();
            assert_eq!(buffer.len(), 200);
            assert!(buffer.positions().all(|(x, y)| (0.0..640.0).contains(&x) && (0.0..480.0).contains(&y)));
            assert!(buffer.vx.iter().chain(&buffer.vy).all(|&v| v == 0.0));
        }
    }

    #[test]
    fn unequal_or_empty_classes_are_rejected() {
        let one = ClassBuffer::at_rest(&[(1.0, 1.0)]);
        let two = ClassBuffer::at_rest(&[(1.0, 1.0), (2.0, 2.0)]);
        assert!(ParticleField::from_buffers(vec![one.clone(), two]).is_err());
        assert!(ParticleField::from_buffers(vec![ClassBuffer::at_rest(&[])]).is_err());
        assert!(ParticleField::from_buffers(vec![]).is_err());
        assert!(ParticleField::from_buffers(vec![one]).is_ok());
    }

    #[test]
    fn degenerate_world_sizes_are_rejected() {
        let mut rng = StdRng::seed_from_u64(0);
        for (width, height) in [
            (f32::INFINITY, 10.0),
            (10.0, f32::INFINITY),
            (f32::NAN, 10.0),
            (10.0, 0.0),
            (-5.0, 10.0),
        ] {
            let result = ParticleField::random(1, 3, width, height, &mut rng);
            assert!(
                matches!(result, Err(SimError::InvalidConfig(_))),
                "{width}x{height} was accepted"
            );
        }
    }

    #[test]
    fn lock_poisoned_by_a_panicking_holder_is_recovered() {
        let field = Arc::new(
            ParticleField::from_buffers(vec![ClassBuffer::at_rest(&[(1.0, 2.0), (3.0, 4.0)])])
                .unwrap(),
        );

        let holder = Arc::clone(&field);
        let outcome = std::thread::spawn(move || {
            let mut guard = holder.lock(0).unwrap();
            guard.x[0] = 7.0;
            panic!("job failed mid-update");
        })
        .join();
        assert!(outcome.is_err());

        // The interrupted update stays; the buffer itself is still whole.
        let recovered = field.snapshot(0).unwrap();
        assert_eq!(recovered.len(), 2);
        assert!(recovered.is_consistent());
        assert_eq!(recovered.positions().collect::<Vec<_>>(), vec![(7.0, 2.0), (3.0, 4.0)]);

        // Poison is cleared, and the unwinding guard released its hold.
        let _again = field.lock(0).unwrap();
        assert_eq!(field.exclusion_violations(), 0);
        assert_eq!(field.acquisitions(), 3);
    }

    #[test]
    fn out_of_range_classes_are_rejected() {
        let field = ParticleField::from_buffers(vec![ClassBuffer::at_rest(&[(1.0, 1.0)])]).unwrap();
        assert!(matches!(
            field.lock_pair(0, 1),
            Err(SimError::ClassOutOfRange { class: 1, num_classes: 1 })
        ));
        assert!(field.lock(3).is_err());
    }

    #[test]
    fn pair_guard_keeps_roles_regardless_of_lock_order() {
        let field = ParticleField::from_buffers(vec![
            ClassBuffer::at_rest(&[(10.0, 10.0)]),
            ClassBuffer::at_rest(&[(20.0, 10.0)]),
        ])
        .unwrap();

        let guard = field.lock_pair(1, 0).unwrap();
        assert_eq!(guard.target_class(), 1);
        assert_eq!(guard.source_class(), 0);
        drop(guard);

        let guard = field.lock_pair(0, 0).unwrap();
        assert_eq!(guard.source_class(), 0);
        drop(guard);

        assert_eq!(field.acquisitions(), 3);
        assert_eq!(field.exclusion_violations(), 0);
    }
}
