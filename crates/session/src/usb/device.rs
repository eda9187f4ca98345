//! rusb-backed transport
//!
//! Finds a device by selector, claims its interface and exposes the endpoint
//! pair as a [`Transport`].

use crate::error::TransportError;
use crate::usb::transfers::{map_rusb_error, read_announced, read_in, write_out};
use crate::usb::transport::{Connector, Transport};
use common::{BusPath, DeviceSelector, DeviceSummary, InTransfer, UsbEndpoints};
use protocol::RawPacket;
use rusb::{Context, Device, DeviceDescriptor, DeviceHandle, UsbContext};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Claimed interface on an open device
pub struct UsbTransport {
    handle: RwLock<Option<DeviceHandle<Context>>>,
    endpoints: UsbEndpoints,
    path: BusPath,
    /// Kernel driver was detached on open and is reattached on close
    detached_kernel_driver: bool,
    disconnected: AtomicBool,
}

impl UsbTransport {
    /// Open the device and claim the configured interface.
    ///
    /// Detaches an active kernel driver first where the platform supports it.
    pub fn open(device: &Device<Context>, endpoints: UsbEndpoints) -> Result<Self, TransportError> {
        let path = BusPath {
            bus: device.bus_number(),
            address: device.address(),
        };

        let mut handle = device.open().map_err(|e| {
            warn!("Failed to open device {}: {}", path, e);
            map_rusb_error(e)
        })?;
        debug!("Opened device {}", path);

        let interface = endpoints.interface;
        let mut detached_kernel_driver = false;
        match handle.kernel_driver_active(interface) {
            Ok(true) => {
                debug!("Detaching kernel driver from interface {}", interface);
                match handle.detach_kernel_driver(interface) {
                    Ok(()) => detached_kernel_driver = true,
                    Err(e) => warn!(
                        "Failed to detach kernel driver from interface {}: {}",
                        interface, e
                    ),
                }
            }
            Ok(false) => {
                debug!("No kernel driver active on interface {}", interface);
            }
            Err(e) => {
                debug!(
                    "Could not check kernel driver status for interface {}: {}",
                    interface, e
                );
            }
        }

        if let Err(e) = handle.claim_interface(interface) {
            warn!("Failed to claim interface {} on {}: {}", interface, path, e);
            if detached_kernel_driver {
                let _ = handle.attach_kernel_driver(interface);
            }
            return Err(map_rusb_error(e));
        }
        info!(
            "Claimed interface {} on {} (OUT {:#04x}, IN {:#04x} {:?})",
            interface, path, endpoints.out_endpoint, endpoints.in_endpoint, endpoints.in_transfer
        );

        Ok(Self {
            handle: RwLock::new(Some(handle)),
            endpoints,
            path,
            detached_kernel_driver,
            disconnected: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> BusPath {
        self.path
    }

    fn note_error(&self, err: &TransportError) {
        if matches!(err, TransportError::Disconnected) {
            self.disconnected.store(true, Ordering::Release);
        }
    }
}

impl Transport for UsbTransport {
    fn write_bulk(&self, data: &[u8], timeout: Duration) -> Result<usize, TransportError> {
        let guard = self
            .handle
            .read()
            .map_err(|_| TransportError::Io("transport lock poisoned".into()))?;
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;

        write_out(handle, &self.endpoints, data, timeout).inspect_err(|e| self.note_error(e))
    }

    fn read_bulk(&self, max_len: usize, timeout: Duration) -> Result<RawPacket, TransportError> {
        let guard = self
            .handle
            .read()
            .map_err(|_| TransportError::Io("transport lock poisoned".into()))?;
        let handle = guard.as_ref().ok_or(TransportError::Closed)?;

        let data = match self.endpoints.in_transfer {
            InTransfer::Announced => read_announced(handle, &self.endpoints, timeout),
            InTransfer::Bulk | InTransfer::Interrupt => {
                let mut buffer = vec![0u8; max_len];
                read_in(handle, &self.endpoints, &mut buffer, timeout).map(|len| {
                    buffer.truncate(len);
                    buffer
                })
            }
        }
        .inspect_err(|e| self.note_error(e))?;
        Ok(RawPacket::inbound(data))
    }

    fn close(&self) {
        let mut guard = self.handle.write().unwrap_or_else(|e| e.into_inner());
        if let Some(mut handle) = guard.take() {
            let interface = self.endpoints.interface;
            if let Err(e) = handle.release_interface(interface) {
                debug!("Failed to release interface {}: {}", interface, e);
            }

            if self.detached_kernel_driver {
                if let Err(e) = handle.attach_kernel_driver(interface) {
                    debug!(
                        "Could not reattach kernel driver to interface {}: {}",
                        interface, e
                    );
                }
            }

            info!("Closed device {}", self.path);
        }
    }

    fn is_disconnected(&self) -> bool {
        self.disconnected.load(Ordering::Acquire)
    }
}

impl Drop for UsbTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Connector that opens real devices through libusb
pub struct RusbConnector {
    context: Context,
    endpoints: UsbEndpoints,
}

impl RusbConnector {
    pub fn new(endpoints: UsbEndpoints) -> Result<Self, TransportError> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context, endpoints })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }
}

impl Connector for RusbConnector {
    fn open(&self, selector: &DeviceSelector) -> Result<Arc<dyn Transport>, TransportError> {
        let device = find_device(&self.context, selector)?;
        let transport = UsbTransport::open(&device, self.endpoints)?;
        Ok(Arc::new(transport))
    }
}

/// Find the first enumerated device matching `selector`.
///
/// Devices are filtered by vendor/product id, then bus path, then serial
/// number; the serial check opens the device briefly to read its string
/// descriptor.
pub fn find_device(
    context: &Context,
    selector: &DeviceSelector,
) -> Result<Device<Context>, TransportError> {
    let devices = context.devices().map_err(map_rusb_error)?;

    for device in devices.iter() {
        let descriptor = match device.device_descriptor() {
            Ok(descriptor) => descriptor,
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

        if !selector.matches_ids(descriptor.vendor_id(), descriptor.product_id()) {
            continue;
        }
        if !selector.matches_path(device.bus_number(), device.address()) {
            continue;
        }
        if selector.serial.is_some() {
            let serial = device
                .open()
                .ok()
                .and_then(|handle| read_serial(&handle, &descriptor));
            if !selector.matches_serial(serial.as_deref()) {
                continue;
            }
        }

        info!(
            "Found device {} at {:03}:{:03}",
            selector,
            device.bus_number(),
            device.address()
        );
        return Ok(device);
    }

    debug!("No device matches {}", selector);
    Err(TransportError::NotFound)
}

/// Enumerate every attached device
pub fn list_devices(context: &Context) -> Result<Vec<DeviceSummary>, TransportError> {
    let devices = context.devices().map_err(map_rusb_error)?;
    let mut summaries = Vec::new();

    for device in devices.iter() {
        let Ok(descriptor) = device.device_descriptor() else {
            continue;
        };

        let (manufacturer, product, serial_number) = match device.open() {
            Ok(handle) => read_strings(&handle, &descriptor),
            Err(_) => (None, None, None),
        };

        summaries.push(DeviceSummary {
            vendor_id: descriptor.vendor_id(),
            product_id: descriptor.product_id(),
            path: BusPath {
                bus: device.bus_number(),
                address: device.address(),
            },
            manufacturer,
            product,
            serial_number,
        });
    }

    debug!("Enumerated {} devices", summaries.len());
    Ok(summaries)
}

fn read_serial(handle: &DeviceHandle<Context>, descriptor: &DeviceDescriptor) -> Option<String> {
    descriptor
        .serial_number_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok())
}

fn read_strings(
    handle: &DeviceHandle<Context>,
    descriptor: &DeviceDescriptor,
) -> (Option<String>, Option<String>, Option<String>) {
    let manufacturer = descriptor
        .manufacturer_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    let product = descriptor
        .product_string_index()
        .and_then(|idx| handle.read_string_descriptor_ascii(idx).ok());

    (manufacturer, product, read_serial(handle, descriptor))
}
