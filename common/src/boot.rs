//! Boot classification and rapid hard-reboot accounting.
//!
//! Warm resets are detected through a sentinel in retained memory and only
//! bump a volatile counter. Hard boots update the durable count in the boot
//! namespace; enough of them without an intervening stable period yields
//! [`BootAction::FactoryReset`].

use log::{info, warn};

use crate::{
    config::{BootConfig, RETAINED_MAGIC},
    retained::RetainedRegion,
    storage::KeyValueStore,
    types::{BootAction, BootState, ResetKind, RetainedBootMemory},
};

pub struct BootClassifier {
    config: BootConfig,
    store: Box<dyn KeyValueStore>,
    retained: Box<dyn RetainedRegion>,

    boot_ms: u64,
    window_cleared: bool,
    last_reset: Option<ResetKind>,
}

impl BootClassifier {
    pub fn new(
        config: BootConfig,
        store: Box<dyn KeyValueStore>,
        retained: Box<dyn RetainedRegion>,
    ) -> Self {
        Self {
            config,
            store,
            retained,
            boot_ms: 0,
            window_cleared: false,
            last_reset: None,
        }
    }

    pub fn last_reset(&self) -> Option<ResetKind> {
        self.last_reset
    }

    pub fn window_cleared(&self) -> bool {
        self.window_cleared
    }

    pub fn soft_boot_count(&self) -> u8 {
        self.retained.load().soft_boot_count
    }

    pub fn state(&self) -> BootState {
        let defaults = BootState::default();
        BootState {
            hard_count: self
                .store
                .u8_or(&self.config.key_hard_count, defaults.hard_count),
            stable: self.store.bool_or(&self.config.key_stable, defaults.stable),
        }
    }

    /// Classifies the current startup. Call exactly once, before anything else
    /// consumes boot state.
    pub fn begin(&mut self, now_ms: u64) -> BootAction {
        self.boot_ms = now_ms;
        self.window_cleared = false;

        let mut retained = self.retained.load();

        if retained.magic == RETAINED_MAGIC {
            retained.soft_boot_count = retained.soft_boot_count.wrapping_add(1);
            self.retained.store(retained);
            self.last_reset = Some(ResetKind::Soft);
            info!(
                "boot: soft reset detected, soft_boot_count={}",
                retained.soft_boot_count
            );
            return BootAction::None;
        }

        self.retained.store(RetainedBootMemory {
            magic: RETAINED_MAGIC,
            soft_boot_count: 0,
        });
        self.last_reset = Some(ResetKind::Hard);

        let threshold = self.config.hard_boots_to_force_factory_reset;
        let previous = self.state();
        let mut hard_count = previous.hard_count;

        if previous.stable {
            hard_count = 1;
            self.write_stable(false);
            self.write_hard_count(hard_count);
        } else if hard_count < threshold {
            hard_count += 1;
            self.write_hard_count(hard_count);
        }

        info!(
            "boot: hard boot detected, hard_count={hard_count} (was stable={})",
            previous.stable
        );

        if hard_count >= threshold {
            warn!("boot: {hard_count} rapid hard reboots, requesting factory reset");
            return BootAction::FactoryReset;
        }

        BootAction::None
    }

    /// Poll repeatedly. Once the device has been up for `stable_after_ms`, the
    /// rapid-reboot window is cleared, at most once per boot.
    pub fn tick(&mut self, now_ms: u64) {
        if self.window_cleared {
            return;
        }

        if now_ms.saturating_sub(self.boot_ms) < self.config.stable_after_ms {
            return;
        }

        self.clear_window();
        info!("boot: uptime stable, rapid reboot window cleared");
    }

    pub fn reset_window(&mut self) {
        self.clear_window();
        info!("boot: rapid reboot window reset");
    }

    fn clear_window(&mut self) {
        self.write_hard_count(0);
        self.write_stable(true);

        let mut retained = self.retained.load();
        retained.soft_boot_count = 0;
        self.retained.store(retained);

        self.window_cleared = true;
    }

    fn write_hard_count(&mut self, value: u8) {
        if let Err(err) = self.store.put_u8(&self.config.key_hard_count, value) {
            warn!("boot: failed to persist hard count {value}: {err}");
        }
    }

    fn write_stable(&mut self, value: bool) {
        if let Err(err) = self.store.put_bool(&self.config.key_stable, value) {
            warn!("boot: failed to persist stable flag {value}: {err}");
        }
    }
}
