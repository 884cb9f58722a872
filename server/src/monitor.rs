//! Power and storage monitors.
//!
//! Both are thin observables: an external probe pushes state in, the
//! scheduler and crawler read it out, and changes raise a signal so a
//! parked indexer re-evaluates its gates. The mount tree answers
//! longest-prefix questions about removable media.

use fossick_core::config::Config;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::{Mutex, RwLock};
use tracing::info;

// ---------------------------------------------------------------------------
// Power
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PowerState {
    pub on_battery: bool,
    pub on_low_battery: bool,
    pub battery_percentage: f64,
}

/// Observable battery state fed by the platform probe.
#[derive(Default)]
pub struct PowerMonitor {
    state: RwLock<PowerState>,
    listeners: Mutex<Vec<Sender<PowerState>>>,
}

impl PowerMonitor {
    pub fn state(&self) -> PowerState {
        *self.state.read().unwrap()
    }

    /// Push a new state from the probe, notifying listeners on change.
    pub fn set_state(&self, state: PowerState) {
        let changed = {
            let mut current = self.state.write().unwrap();
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            info!(
                on_battery = state.on_battery,
                low = state.on_low_battery,
                pct = state.battery_percentage,
                "power state changed"
            );
            self.listeners.lock().unwrap().retain(|tx| tx.send(state).is_ok());
        }
    }

    pub fn subscribe(&self) -> Receiver<PowerState> {
        let (tx, rx) = channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    /// Whether the current state gates indexing under this config.
    pub fn should_pause(&self, config: &Config) -> bool {
        let state = self.state();
        (state.on_battery && config.indexing.disable_indexing_on_battery)
            || state.on_low_battery
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MountPoint {
    pub mount_point: PathBuf,
    /// Volume identifier from the platform probe.
    pub udi: String,
    pub removable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MountEvent {
    Added { udi: String, mount_point: PathBuf },
    Removed { udi: String, mount_point: PathBuf },
}

/// Tree of mount points keyed by path; lookups are longest-prefix.
#[derive(Default)]
pub struct MountTree {
    mounts: RwLock<Vec<MountPoint>>,
    listeners: Mutex<Vec<Sender<MountEvent>>>,
}

impl MountTree {
    pub fn subscribe(&self) -> Receiver<MountEvent> {
        let (tx, rx) = channel();
        self.listeners.lock().unwrap().push(tx);
        rx
    }

    fn emit(&self, event: MountEvent) {
        self.listeners.lock().unwrap().retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn add_mount(&self, mount: MountPoint) {
        let event = MountEvent::Added {
            udi: mount.udi.clone(),
            mount_point: mount.mount_point.clone(),
        };
        {
            let mut mounts = self.mounts.write().unwrap();
            mounts.retain(|m| m.mount_point != mount.mount_point);
            mounts.push(mount);
        }
        self.emit(event);
    }

    pub fn remove_mount(&self, udi: &str) {
        let removed = {
            let mut mounts = self.mounts.write().unwrap();
            let removed: Vec<MountPoint> =
                mounts.iter().filter(|m| m.udi == udi).cloned().collect();
            mounts.retain(|m| m.udi != udi);
            removed
        };
        for m in removed {
            self.emit(MountEvent::Removed { udi: m.udi, mount_point: m.mount_point });
        }
    }

    pub fn list_mounted_roots(&self) -> Vec<PathBuf> {
        self.mounts.read().unwrap().iter().map(|m| m.mount_point.clone()).collect()
    }

    pub fn list_removable_roots(&self) -> Vec<PathBuf> {
        self.mounts
            .read()
            .unwrap()
            .iter()
            .filter(|m| m.removable)
            .map(|m| m.mount_point.clone())
            .collect()
    }

    /// Longest-prefix match for a path.
    fn best_match(&self, path: &Path) -> Option<MountPoint> {
        self.mounts
            .read()
            .unwrap()
            .iter()
            .filter(|m| path.starts_with(&m.mount_point))
            .max_by_key(|m| m.mount_point.components().count())
            .cloned()
    }

    /// `(is_removable, mount_point, available)` for a path.
    pub fn path_is_on_removable(&self, path: &Path) -> (bool, Option<PathBuf>, bool) {
        match self.best_match(path) {
            Some(m) => (m.removable, Some(m.mount_point), true),
            None => (false, None, false),
        }
    }

    pub fn volume_udi_for(&self, path: &Path) -> Option<String> {
        self.best_match(path).map(|m| m.udi)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_pause_follows_config() {
        let monitor = PowerMonitor::default();
        let mut config = Config::default();
        config.indexing.disable_indexing_on_battery = true;

        assert!(!monitor.should_pause(&config));
        monitor.set_state(PowerState { on_battery: true, ..Default::default() });
        assert!(monitor.should_pause(&config));

        config.indexing.disable_indexing_on_battery = false;
        assert!(!monitor.should_pause(&config));

        // Low battery always pauses
        monitor.set_state(PowerState {
            on_battery: true,
            on_low_battery: true,
            battery_percentage: 4.0,
        });
        assert!(monitor.should_pause(&config));
    }

    #[test]
    fn power_change_notifies_subscribers() {
        let monitor = PowerMonitor::default();
        let rx = monitor.subscribe();
        monitor.set_state(PowerState { on_battery: true, ..Default::default() });
        assert!(rx.try_recv().unwrap().on_battery);
        // No change, no event
        monitor.set_state(PowerState { on_battery: true, ..Default::default() });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn longest_prefix_wins() {
        let tree = MountTree::default();
        tree.add_mount(MountPoint {
            mount_point: "/media".into(),
            udi: "udi-media".into(),
            removable: false,
        });
        tree.add_mount(MountPoint {
            mount_point: "/media/usb".into(),
            udi: "udi-usb".into(),
            removable: true,
        });

        let (removable, mp, available) = tree.path_is_on_removable(Path::new("/media/usb/doc.txt"));
        assert!(removable);
        assert!(available);
        assert_eq!(mp.unwrap(), PathBuf::from("/media/usb"));
        assert_eq!(tree.volume_udi_for(Path::new("/media/other")).unwrap(), "udi-media");
    }

    #[test]
    fn mount_events_round_trip() {
        let tree = MountTree::default();
        let rx = tree.subscribe();
        tree.add_mount(MountPoint {
            mount_point: "/media/usb".into(),
            udi: "u1".into(),
            removable: true,
        });
        tree.remove_mount("u1");

        assert_eq!(
            rx.try_recv().unwrap(),
            MountEvent::Added { udi: "u1".into(), mount_point: "/media/usb".into() }
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            MountEvent::Removed { udi: "u1".into(), mount_point: "/media/usb".into() }
        );
        assert!(tree.list_removable_roots().is_empty());
    }
}
