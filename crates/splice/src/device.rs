//! Process-wide device selection.
//!
//! Compilations hold a [`CompilationGuard`] for their whole duration; while any
//! guard is alive the selected device cannot change.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, OnceLock};

use thiserror::Error;

use crate::config::Device;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    #[error("cannot switch to {requested} while {in_flight} compilation(s) target {current}")]
    CompilationInFlight {
        requested: String,
        current: String,
        in_flight: usize,
    },
}

struct DeviceState {
    selected: Mutex<Device>,
    in_flight: AtomicUsize,
}

static STATE: OnceLock<DeviceState> = OnceLock::new();

fn state() -> &'static DeviceState {
    STATE.get_or_init(|| DeviceState {
        selected: Mutex::new(Device::default()),
        in_flight: AtomicUsize::new(0),
    })
}

pub fn current_device() -> Device {
    state()
        .selected
        .lock()
        .expect("device state poisoned")
        .clone()
}

/// Selects the device later compilations target.
pub fn select_device(device: Device) -> Result<(), DeviceError> {
    let state = state();
    let mut selected = state.selected.lock().expect("device state poisoned");
    if *selected == device {
        return Ok(());
    }
    let in_flight = state.in_flight.load(Ordering::SeqCst);
    if in_flight > 0 {
        return Err(DeviceError::CompilationInFlight {
            requested: device.to_string(),
            current: selected.to_string(),
            in_flight,
        });
    }
    tracing::debug!(device = %device, "selected device");
    *selected = device;
    Ok(())
}

/// Marks a compilation as running on the currently selected device.
#[derive(Debug)]
pub struct CompilationGuard {
    device: Device,
}

impl CompilationGuard {
    /// Switches to `device` if needed, then pins it until the guard drops.
    pub fn acquire(device: &Device) -> Result<Self, DeviceError> {
        let state = state();
        let mut selected = state.selected.lock().expect("device state poisoned");
        if *selected != *device {
            let in_flight = state.in_flight.load(Ordering::SeqCst);
            if in_flight > 0 {
                return Err(DeviceError::CompilationInFlight {
                    requested: device.to_string(),
                    current: selected.to_string(),
                    in_flight,
                });
            }
            *selected = device.clone();
        }
        state.in_flight.fetch_add(1, Ordering::SeqCst);
        Ok(Self {
            device: device.clone(),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}

impl Drop for CompilationGuard {
    fn drop(&mut self) {
        state().in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_pins_device_until_dropped() {
        let gpu1 = Device::gpu(1);
        let guard = CompilationGuard::acquire(&gpu1).expect("acquire");
        assert_eq!(current_device(), gpu1);

        let err = select_device(Device::gpu(2)).expect_err("switch while compiling");
        assert!(matches!(err, DeviceError::CompilationInFlight { .. }));
        select_device(gpu1.clone()).expect("reselecting the same device is fine");

        drop(guard);
        select_device(Device::default()).expect("switch after compilation");
    }
}
