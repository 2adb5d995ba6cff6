//! Device discovery and session setup
//!
//! Finds a GN3S by VID/PID, opens it and brings it into the streaming
//! configuration: configuration 1, interface 2 claimed, alternate setting 0.

use crate::error::{DriverError, Result};
use protocol::{RX_ALT_SETTING, RX_CONFIGURATION, RX_INTERFACE, UsbId};
use rusb::{Context, Device, DeviceHandle, UsbContext};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Which device to use when several share the same VID/PID
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceSelection {
    First,
    /// Last in enumeration order
    #[default]
    Last,
    /// Zero-based position among matching devices
    Index(usize),
}

impl fmt::Display for DeviceSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSelection::First => write!(f, "first"),
            DeviceSelection::Last => write!(f, "last"),
            DeviceSelection::Index(n) => write!(f, "index {}", n),
        }
    }
}

/// Pick one of `count` matching devices
pub fn select_match(count: usize, selection: DeviceSelection) -> Option<usize> {
    if count == 0 {
        return None;
    }
    match selection {
        DeviceSelection::First => Some(0),
        DeviceSelection::Last => Some(count - 1),
        DeviceSelection::Index(n) if n < count => Some(n),
        DeviceSelection::Index(_) => None,
    }
}

/// Scan the bus once for devices matching `id` and pick one
pub fn find_device<T: UsbContext>(
    context: &T,
    id: UsbId,
    selection: DeviceSelection,
) -> Result<Option<Device<T>>> {
    let mut matches = Vec::new();
    for device in context.devices()?.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(d) => d,
            Err(e) => {
                debug!(
                    "Skipping device {:03}:{:03}: {}",
                    device.bus_number(),
                    device.address(),
                    e
                );
                continue;
            }
        };
        if descriptor.vendor_id() == id.vendor_id && descriptor.product_id() == id.product_id {
            matches.push(device);
        }
    }

    if matches.len() > 1 {
        debug!(
            "{} devices match {}, selecting {}",
            matches.len(),
            id,
            selection
        );
    }

    Ok(select_match(matches.len(), selection).map(|i| matches.swap_remove(i)))
}

/// Summary of an attached device, as shown by `--list-devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSummary {
    pub id: UsbId,
    pub bus_number: u8,
    pub device_address: u8,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

impl DeviceSummary {
    /// Whether this is a GN3S, programmed or not
    pub fn is_gn3s(&self) -> bool {
        self.id == protocol::GN3S_ID || self.id == protocol::FX2_UNPROGRAMMED_ID
    }
}

impl fmt::Display for DeviceSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Bus {:03} Device {:03}: ID {}",
            self.bus_number, self.device_address, self.id
        )?;
        if let Some(manufacturer) = &self.manufacturer {
            write!(f, " {}", manufacturer)?;
        }
        if let Some(product) = &self.product {
            write!(f, " {}", product)?;
        }
        if let Some(serial) = &self.serial_number {
            write!(f, " (serial {})", serial)?;
        }
        Ok(())
    }
}

/// List every attached device
///
/// String descriptors are read when the device can be opened.
pub fn list_devices<T: UsbContext>(context: &T) -> Result<Vec<DeviceSummary>> {
    let mut summaries = Vec::new();
    for device in context.devices()?.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };

        let (manufacturer, product, serial_number) = match device.open() {
            Ok(handle) => (
                descriptor
                    .manufacturer_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                descriptor
                    .product_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
                descriptor
                    .serial_number_string_index()
                    .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok()),
            ),
            Err(_) => (None, None, None),
        };

        summaries.push(DeviceSummary {
            id: UsbId::new(descriptor.vendor_id(), descriptor.product_id()),
            bus_number: device.bus_number(),
            device_address: device.address(),
            manufacturer,
            product,
            serial_number,
        });
    }
    Ok(summaries)
}

/// An opened GN3S with its streaming interface claimed
pub struct DeviceSession {
    handle: Arc<DeviceHandle<Context>>,
    interface: u8,
    kernel_driver_detached: bool,
    closed: bool,
}

impl DeviceSession {
    /// Open `device` and prepare it for streaming
    ///
    /// On any failure the interface is released (if claimed) and the handle
    /// is closed before the error is returned.
    pub fn configure(device: &Device<Context>) -> Result<Self> {
        let handle = device
            .open()
            .map_err(|source| DriverError::Configure {
                step: "open device",
                source,
            })?;

        debug!(
            "Opened device {:03}:{:03}",
            device.bus_number(),
            device.address()
        );

        handle
            .set_active_configuration(RX_CONFIGURATION)
            .map_err(|source| DriverError::Configure {
                step: "set configuration 1",
                source,
            })?;

        let kernel_driver_detached = detach_kernel_driver(&handle, RX_INTERFACE);

        claim_interface(&handle, RX_INTERFACE, kernel_driver_detached).map_err(|source| {
            DriverError::Configure {
                step: "claim interface 2",
                source,
            }
        })?;

        if let Err(source) = handle.set_alternate_setting(RX_INTERFACE, RX_ALT_SETTING) {
            release_interface(&handle, RX_INTERFACE, kernel_driver_detached);
            return Err(DriverError::Configure {
                step: "select alternate setting 0",
                source,
            });
        }

        info!(
            "Configured device {:03}:{:03} for streaming",
            device.bus_number(),
            device.address()
        );

        Ok(Self {
            handle: Arc::new(handle),
            interface: RX_INTERFACE,
            kernel_driver_detached,
            closed: false,
        })
    }

    /// Shared handle for control requests and the transfer pool
    pub fn handle(&self) -> &Arc<DeviceHandle<Context>> {
        &self.handle
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Release the interface and give it back to the kernel driver
    ///
    /// The handle itself closes when its last reference drops.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        release_interface(&*self.handle, self.interface, self.kernel_driver_detached);
        debug!("Closed device session");
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("interface", &self.interface)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Interface ownership calls used while claiming and releasing
///
/// Implemented for `rusb::DeviceHandle`; tests use a recording fake.
pub trait InterfaceControl {
    fn claim_interface(&self, interface: u8) -> rusb::Result<()>;
    fn release_interface(&self, interface: u8) -> rusb::Result<()>;
    fn attach_kernel_driver(&self, interface: u8) -> rusb::Result<()>;
}

impl<T: UsbContext> InterfaceControl for DeviceHandle<T> {
    fn claim_interface(&self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::claim_interface(self, interface)
    }

    fn release_interface(&self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::release_interface(self, interface)
    }

    fn attach_kernel_driver(&self, interface: u8) -> rusb::Result<()> {
        DeviceHandle::attach_kernel_driver(self, interface)
    }
}

/// Claim `interface`, handing it back to the kernel driver on failure
fn claim_interface<H: InterfaceControl + ?Sized>(
    handle: &H,
    interface: u8,
    kernel_driver_detached: bool,
) -> rusb::Result<()> {
    handle.claim_interface(interface).inspect_err(|_| {
        if kernel_driver_detached {
            reattach_kernel_driver(handle, interface);
        }
    })
}

/// Release `interface` and reattach the kernel driver if it was detached
fn release_interface<H: InterfaceControl + ?Sized>(
    handle: &H,
    interface: u8,
    kernel_driver_detached: bool,
) {
    if let Err(e) = handle.release_interface(interface) {
        warn!("Failed to release interface {}: {}", interface, e);
    }
    if kernel_driver_detached {
        reattach_kernel_driver(handle, interface);
    }
}

fn reattach_kernel_driver<H: InterfaceControl + ?Sized>(handle: &H, interface: u8) {
    if let Err(e) = handle.attach_kernel_driver(interface) {
        debug!(
            "Could not reattach kernel driver to interface {}: {}",
            interface, e
        );
    }
}

/// Detach a kernel driver bound to `interface`; returns whether one was detached
fn detach_kernel_driver<T: UsbContext>(handle: &DeviceHandle<T>, interface: u8) -> bool {
    match handle.kernel_driver_active(interface) {
        Ok(true) => match handle.detach_kernel_driver(interface) {
            Ok(()) => {
                debug!("Detached kernel driver from interface {}", interface);
                true
            }
            Err(e) => {
                // Claiming will most likely fail next
                warn!(
                    "Failed to detach kernel driver from interface {}: {}",
                    interface, e
                );
                false
            }
        },
        Ok(false) => false,
        Err(e) => {
            debug!(
                "Could not check kernel driver status for interface {}: {}",
                interface, e
            );
            false
        }
    }
}
