use crate::models::ExecutorResources;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("insufficient resources available")]
pub struct InsufficientResources;

/// Capacity held on behalf of one container.
///
/// Deliberately neither `Clone` nor `Copy`: the only way to give capacity
/// back is to hand the token to [`ResourcePool::release`], which consumes it.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "dropping a reservation leaks pool capacity"]
pub struct Reservation {
    memory_mb: i64,
    disk_mb: i64,
}

impl Reservation {
    pub fn memory_mb(&self) -> i64 {
        self.memory_mb
    }

    pub fn disk_mb(&self) -> i64 {
        self.disk_mb
    }
}

#[derive(Debug)]
pub struct ResourcePool {
    total: ExecutorResources,
    remaining: ExecutorResources,
}

impl ResourcePool {
    pub fn new(total: ExecutorResources) -> Self {
        Self {
            total,
            remaining: total,
        }
    }

    /// Takes `memory_mb`, `disk_mb` and one container slot, or nothing at all.
    pub fn reserve(&mut self, memory_mb: i64, disk_mb: i64) -> Result<Reservation, InsufficientResources> {
        if memory_mb < 0 || disk_mb < 0 {
            return Err(InsufficientResources);
        }
        if memory_mb > self.remaining.memory_mb
            || disk_mb > self.remaining.disk_mb
            || self.remaining.containers < 1
        {
            return Err(InsufficientResources);
        }

        self.remaining.memory_mb -= memory_mb;
        self.remaining.disk_mb -= disk_mb;
        self.remaining.containers -= 1;

        Ok(Reservation { memory_mb, disk_mb })
    }

    pub fn release(&mut self, reservation: Reservation) {
        self.remaining.memory_mb += reservation.memory_mb;
        self.remaining.disk_mb += reservation.disk_mb;
        self.remaining.containers += 1;
    }

    pub fn remaining(&self) -> ExecutorResources {
        self.remaining
    }

    pub fn total(&self) -> ExecutorResources {
        self.total
    }
}
