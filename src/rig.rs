//! Resolving the devices that make up the rig.
//!
//! The rig needs exactly one joystick controller and, when configured, one
//! encoder interface. Both are picked out of the discovered devices by name,
//! form factor and optionally serial number. A missing device is fatal: there
//! is no degraded mode.

use crate::device_client::{DeviceClient, DeviceId};

use log::{debug, info, warn};
use std::fmt;
use thiserror::Error;

/// Errors building a [Rig].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RigError {
    /// None of the discovered devices matches the query.
    #[error("device not found: {query} (discovered: {discovered:?})")]
    DeviceNotFound {
        /// What was looked for
        query: DeviceQuery,
        /// Every device that was discovered
        discovered: Vec<DeviceId>,
    },
}

/// Which device to pick out of the discovered ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceQuery {
    /// Firmware name
    pub name: String,
    /// Board form factor
    pub form_factor: String,
    /// Serial number, when several boards of the same kind are attached
    pub serial_number: Option<u32>,
}

impl DeviceQuery {
    /// A query for any board with this name and form factor.
    pub fn new(name: &str, form_factor: &str) -> Self {
        Self {
            name: name.to_owned(),
            form_factor: form_factor.to_owned(),
            serial_number: None,
        }
    }

    /// Narrows the query to one serial number.
    pub fn serial_number(self, serial_number: Option<u32>) -> Self {
        Self {
            serial_number,
            ..self
        }
    }

    /// Whether `id` satisfies the query.
    pub fn matches(&self, id: &DeviceId) -> bool {
        id.name == self.name
            && id.form_factor == self.form_factor
            && self.serial_number.map_or(true, |sn| sn == id.serial_number)
    }

    /// The joystick controller, `mouse_joystick_controller` on a `5x3` board.
    pub fn joystick_controller() -> Self {
        Self::new("mouse_joystick_controller", "5x3")
    }

    /// The encoder interface, `encoder_interface_simple` on a `3x2` board.
    pub fn encoder_interface() -> Self {
        Self::new("encoder_interface_simple", "3x2")
    }
}

impl fmt::Display for DeviceQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.form_factor)?;
        if let Some(sn) = self.serial_number {
            write!(f, " #{sn}")?;
        }
        Ok(())
    }
}

/// The devices the rig is built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RigConfig {
    /// The controller that runs assays
    pub joystick_controller: DeviceQuery,
    /// The encoder, when the rig has one
    pub encoder_interface: Option<DeviceQuery>,
}

impl Default for RigConfig {
    fn default() -> Self {
        Self {
            joystick_controller: DeviceQuery::joystick_controller(),
            encoder_interface: None,
        }
    }
}

/// Handles to every device the rig needs.
#[derive(Debug)]
pub struct Rig<D> {
    joystick_controller: D,
    encoder_interface: Option<D>,
}

impl<D: DeviceClient> Rig<D> {
    /// Picks the configured devices out of `devices`. Devices that are not
    /// needed are dropped, which closes their ports.
    pub fn resolve(devices: Vec<D>, config: &RigConfig) -> Result<Self, RigError> {
        let discovered: Vec<DeviceId> = devices.iter().map(|d| d.device_id().clone()).collect();
        let mut devices: Vec<Option<D>> = devices.into_iter().map(Some).collect();

        let joystick_controller =
            take_device(&mut devices, &config.joystick_controller, &discovered)?;
        let encoder_interface = match &config.encoder_interface {
            Some(query) => Some(take_device(&mut devices, query, &discovered)?),
            None => None,
        };

        let unused = devices.iter().flatten().count();
        if unused > 0 {
            debug!("Releasing {} devices the rig does not use", unused);
        }

        Ok(Self {
            joystick_controller,
            encoder_interface,
        })
    }

    /// The controller that runs assays.
    pub fn joystick_controller(&mut self) -> &mut D {
        &mut self.joystick_controller
    }

    /// The encoder, if the rig was configured with one.
    pub fn encoder_interface(&mut self) -> Option<&mut D> {
        self.encoder_interface.as_mut()
    }

    /// Splits the rig into its controller and encoder.
    pub fn into_parts(self) -> (D, Option<D>) {
        (self.joystick_controller, self.encoder_interface)
    }
}

fn take_device<D: DeviceClient>(
    devices: &mut [Option<D>],
    query: &DeviceQuery,
    discovered: &[DeviceId],
) -> Result<D, RigError> {
    let mut matching = devices
        .iter_mut()
        .filter(|slot| slot.as_ref().is_some_and(|d| query.matches(d.device_id())));

    let device = matching
        .next()
        .and_then(Option::take)
        .ok_or_else(|| RigError::DeviceNotFound {
            query: query.clone(),
            discovered: discovered.to_vec(),
        })?;

    if matching.next().is_some() {
        warn!(
            "Several devices match {}, using {}; pass a serial number to choose",
            query,
            device.device_id()
        );
    }
    info!("Resolved {} to {}", query, device.device_id());
    Ok(device)
}
