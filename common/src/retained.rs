use std::sync::{Arc, Mutex};

use crate::types::RetainedBootMemory;

/// A small memory region that survives warm resets and is lost on power-off.
pub trait RetainedRegion {
    fn load(&self) -> RetainedBootMemory;
    fn store(&mut self, value: RetainedBootMemory);
}

/// Heap-backed region for tests and simulations. Clones share the same cell,
/// so a test can keep one clone to inspect the region or to "survive" a
/// simulated warm reset; `power_cycle` zeroes it.
#[derive(Clone, Default)]
pub struct SharedRetained {
    cell: Arc<Mutex<RetainedBootMemory>>,
}

impl SharedRetained {
    pub fn new(initial: RetainedBootMemory) -> Self {
        Self {
            cell: Arc::new(Mutex::new(initial)),
        }
    }

    pub fn power_cycle(&self) {
        if let Ok(mut cell) = self.cell.lock() {
            *cell = RetainedBootMemory::default();
        }
    }
}

impl RetainedRegion for SharedRetained {
    fn load(&self) -> RetainedBootMemory {
        self.cell.lock().map(|cell| *cell).unwrap_or_default()
    }

    fn store(&mut self, value: RetainedBootMemory) {
        if let Ok(mut cell) = self.cell.lock() {
            *cell = value;
        }
    }
}
