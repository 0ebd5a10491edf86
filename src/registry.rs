//! Fixed-size, index-addressed registry of per-port servos.
//!
//! A servo's "parent" (whatever owns it, e.g. a drive base that needs to
//! hear about a child stalling) is expressed as an index into the registry
//! rather than a pointer, so nothing here can dangle or alias. The registry
//! itself is an owning, fixed-capacity array indexed by [`PortId`] in place
//! of a global, statically-allocated array per platform.
//!
//! A registry is generic over one concrete `Servo<C, M, T>` instantiation,
//! matching how a real board wires up: every port of a given physical motor
//! family shares the same clock/driver/tacho types. A board with more than
//! one motor family (e.g. EV3's large *and* medium motors) composes two
//! registries, one per family, rather than needing a single one to erase
//! the type — consistent with "no allocation, no trait objects" for the
//! control loop.

use crate::error::{Error, Result};
use crate::servo::Servo;

/// Identifies one physical I/O port. Hubs expose a small, fixed number of
/// motor-capable ports (4-8 on every Pybricks-supported hub), well within
/// `u8`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, defmt::Format)]
pub struct PortId(pub u8);

/// A fixed-capacity, owning collection of up to `N` servos, indexed by
/// [`PortId`]. Ports without a registered servo are simply absent — there
/// is no null/placeholder entry to accidentally dereference.
pub struct Registry<C, M, T, const N: usize> {
    slots: [Option<(PortId, Servo<C, M, T>)>; N],
}

impl<C, M, T, const N: usize> Registry<C, M, T, N> {
    pub fn new() -> Self {
        Registry {
            slots: core::array::from_fn(|_| None),
        }
    }

    /// Registers `servo` under `port`, evicting (and returning) whatever was
    /// previously registered there. Fails with [`Error::InvalidArg`] if the
    /// registry is full and `port` isn't already occupied.
    pub fn insert(&mut self, port: PortId, servo: Servo<C, M, T>) -> Result<Option<Servo<C, M, T>>> {
        if let Some(slot) = self.slots.iter_mut().find(|s| matches!(s, Some((p, _)) if *p == port)) {
            let (_, old) = slot.take().unwrap();
            *slot = Some((port, servo));
            return Ok(Some(old));
        }
        match self.slots.iter_mut().find(|s| s.is_none()) {
            Some(slot) => {
                *slot = Some((port, servo));
                Ok(None)
            }
            None => Err(Error::InvalidArg),
        }
    }

    /// Removes and returns the servo at `port`, if any — used when a servo's
    /// cable is disconnected or its observer irrecoverably diverges and the
    /// caller wants to drop it rather than re-`setup()` in place.
    pub fn remove(&mut self, port: PortId) -> Option<Servo<C, M, T>> {
        let slot = self.slots.iter_mut().find(|s| matches!(s, Some((p, _)) if *p == port))?;
        slot.take().map(|(_, servo)| servo)
    }

    pub fn get(&self, port: PortId) -> Option<&Servo<C, M, T>> {
        self.slots.iter().find_map(|s| match s {
            Some((p, servo)) if *p == port => Some(servo),
            _ => None,
        })
    }

    pub fn get_mut(&mut self, port: PortId) -> Option<&mut Servo<C, M, T>> {
        self.slots.iter_mut().find_map(|s| match s {
            Some((p, servo)) if *p == port => Some(servo),
            _ => None,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterates occupied slots in ascending [`PortId`] order. Within one
    /// control tick, all servos must be updated in port order, which only
    /// holds if callers drive `update()` through this iterator rather than
    /// some other traversal.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (PortId, &mut Servo<C, M, T>)> {
        let mut entries: heapless::Vec<usize, N> = heapless::Vec::new();
        for (i, s) in self.slots.iter().enumerate() {
            if s.is_some() {
                let _ = entries.push(i);
            }
        }
        entries.sort_unstable_by_key(|&i| self.slots[i].as_ref().unwrap().0 .0);
        entries.into_iter().map(move |i| {
            // SAFETY-free: split_at_mut-free indexing is impossible to express
            // ergonomically over a sparse `[Option<_>; N]` with one mutable
            // borrow per step, so we re-borrow `self.slots` fresh on each
            // yielded index instead of holding an iterator over the array.
            let slot = &mut self.slots[i];
            let (port, servo) = slot.as_mut().unwrap();
            (*port, servo)
        })
    }
}

impl<C, M, T, const N: usize> Default for Registry<C, M, T, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::angle::Angle;
    use crate::devices::DeviceTypeId;
    use crate::error::Result as CrateResult;
    use crate::hal::{Clock, MotorDriver, Tacho};
    use crate::servo::ServoSetup;
    use core::cell::Cell;

    struct FakeClock {
        now: Cell<u32>,
    }
    impl Clock for FakeClock {
        fn now_ticks(&self) -> u32 {
            self.now.get()
        }
    }
    struct FakeDriver;
    impl MotorDriver for FakeDriver {
        fn coast(&mut self) -> CrateResult<()> {
            Ok(())
        }
        fn set_duty(&mut self, _ppm: i32) -> CrateResult<()> {
            Ok(())
        }
    }
    struct FakeTacho;
    impl Tacho for FakeTacho {
        fn get_angle(&self) -> CrateResult<Angle> {
            Ok(Angle::ZERO)
        }
        fn reset_angle(&mut self, angle: Angle, _to_abs: bool) -> CrateResult<Angle> {
            Ok(angle)
        }
    }

    fn make_servo() -> Servo<FakeClock, FakeDriver, FakeTacho> {
        Servo::setup(
            FakeClock { now: Cell::new(0) },
            FakeDriver,
            FakeTacho,
            ServoSetup {
                device_type: DeviceTypeId::LargeMotor,
                gear_ratio: 1,
                precision_profile: 50,
                precision_profile_reduced: 50,
                reverse: false,
            },
        )
        .unwrap()
    }

    #[test]
    fn insert_then_get_round_trips() {
        let mut reg: Registry<FakeClock, FakeDriver, FakeTacho, 4> = Registry::new();
        reg.insert(PortId(2), make_servo()).unwrap();
        assert!(reg.get(PortId(2)).is_some());
        assert!(reg.get(PortId(0)).is_none());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn full_registry_rejects_new_port() {
        let mut reg: Registry<FakeClock, FakeDriver, FakeTacho, 1> = Registry::new();
        reg.insert(PortId(0), make_servo()).unwrap();
        assert_eq!(reg.insert(PortId(1), make_servo()).err(), Some(Error::InvalidArg));
    }

    #[test]
    fn reinserting_same_port_evicts_previous_servo() {
        let mut reg: Registry<FakeClock, FakeDriver, FakeTacho, 1> = Registry::new();
        reg.insert(PortId(0), make_servo()).unwrap();
        let evicted = reg.insert(PortId(0), make_servo()).unwrap();
        assert!(evicted.is_some());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn remove_drops_the_slot() {
        let mut reg: Registry<FakeClock, FakeDriver, FakeTacho, 2> = Registry::new();
        reg.insert(PortId(0), make_servo()).unwrap();
        assert!(reg.remove(PortId(0)).is_some());
        assert!(reg.remove(PortId(0)).is_none());
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn iter_mut_visits_ports_in_ascending_order() {
        let mut reg: Registry<FakeClock, FakeDriver, FakeTacho, 4> = Registry::new();
        reg.insert(PortId(3), make_servo()).unwrap();
        reg.insert(PortId(1), make_servo()).unwrap();
        reg.insert(PortId(2), make_servo()).unwrap();
        let order: heapless::Vec<u8, 4> = reg.iter_mut().map(|(p, _)| p.0).collect();
        assert_eq!(order.as_slice(), &[1, 2, 3]);
    }
}
