//! Camera discovery.
//!
//! Walks the bus for interfaces matching the UVC control pattern
//! (class VIDEO, subclass 1, protocol 0), harvests the class-specific
//! descriptors, and assembles the [`DeviceDescription`] the engine needs
//! plus an opened, claimed handle.

use anyhow::{Context as AnyhowContext, Result};
use openstill_engine::{DeviceDescription, UnitIds};
use openstill_uvc_protocol::{
    decode_endpoint_packet_size, parse_control_interface, parse_streaming_interface,
};
use rusb::{Context, Device, TransferType, UsbContext};
use tracing::{debug, info, warn};

use crate::usb::RusbHostController;

const USB_CLASS_VIDEO: u8 = 0x0e;
const UVC_SUBCLASS_CONTROL: u8 = 0x01;

/// One camera ready for engine probe.
pub struct DiscoveredCamera {
    pub controller: RusbHostController,
    pub description: DeviceDescription,
}

impl std::fmt::Debug for DiscoveredCamera {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredCamera")
            .field("vendor_id", &self.description.vendor_id)
            .field("product_id", &self.description.product_id)
            .finish()
    }
}

/// Scan the bus and return every camera that advertises still capture.
pub fn discover(context: &Context) -> Result<Vec<DiscoveredCamera>> {
    let mut found = Vec::new();
    for device in context.devices().context("listing usb devices")?.iter() {
        match inspect_device(&device) {
            Ok(Some(camera)) => found.push(camera),
            Ok(None) => {}
            Err(err) => {
                // Enumeration keeps going; one broken device must not
                // hide the others.
                debug!(
                    bus = device.bus_number(),
                    address = device.address(),
                    error = %err,
                    "skipping device"
                );
            }
        }
    }
    info!(cameras = found.len(), "discovery finished");
    Ok(found)
}

fn inspect_device(device: &Device<Context>) -> Result<Option<DiscoveredCamera>> {
    let descriptor = device.device_descriptor().context("device descriptor")?;
    let config = match device.active_config_descriptor() {
        Ok(config) => config,
        Err(rusb::Error::NotFound) => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    // Find the UVC control interface.
    let mut control = None;
    for interface in config.interfaces() {
        for alt in interface.descriptors() {
            if alt.class_code() == USB_CLASS_VIDEO
                && alt.sub_class_code() == UVC_SUBCLASS_CONTROL
                && alt.protocol_code() == 0
            {
                control = Some(alt);
                break;
            }
        }
        if control.is_some() {
            break;
        }
    }
    let Some(control) = control else {
        return Ok(None);
    };

    let control_interface = control.interface_number();
    let layout = parse_control_interface(control.extra());
    debug!(
        vendor = format_args!("{:04x}", descriptor.vendor_id()),
        product = format_args!("{:04x}", descriptor.product_id()),
        control_interface,
        ?layout,
        "uvc control interface"
    );

    // Optional status interrupt endpoint on the control interface.
    let status_endpoint = control.endpoint_descriptors().find_map(|ep| {
        let is_interrupt_in = ep.transfer_type() == TransferType::Interrupt
            && ep.direction() == rusb::Direction::In;
        (is_interrupt_in && ep.max_packet_size() >= 8 && ep.interval() != 0)
            .then(|| ep.address())
    });

    // Walk the streaming interfaces named by the VC header.
    let mut stream = None;
    for &intf_num in &layout.streaming_interfaces {
        let Some(interface) = config
            .interfaces()
            .find(|i| i.number() == intf_num)
        else {
            continue;
        };

        let mut alts = interface.descriptors();
        let Some(first_alt) = alts.next() else {
            continue;
        };
        let streaming = parse_streaming_interface(first_alt.extra());
        let Some(endpoint_address) = streaming.endpoint_address else {
            continue;
        };
        if streaming.frame_sizes.is_empty() {
            warn!(interface = intf_num, "input stream without still frame sizes");
            continue;
        }

        // Pick the alternate with the largest per-interval payload;
        // isochronous wins ties.
        let mut best: Option<(u32, u8, bool)> = None;
        for alt in interface.descriptors() {
            for ep in alt.endpoint_descriptors() {
                if ep.address() != endpoint_address {
                    continue;
                }
                let psize = decode_endpoint_packet_size(ep.max_packet_size());
                let bulk = match ep.transfer_type() {
                    TransferType::Isochronous => false,
                    TransferType::Bulk => true,
                    _ => continue,
                };
                let better = match best {
                    None => true,
                    Some((best_psize, _, best_bulk)) => {
                        psize > best_psize || (psize == best_psize && best_bulk && !bulk)
                    }
                };
                if better {
                    best = Some((psize, alt.setting_number(), bulk));
                }
            }
        }
        let Some((max_packet_size, max_bandwidth_alt, use_bulk)) = best else {
            continue;
        };

        stream = Some((
            intf_num,
            endpoint_address,
            streaming,
            max_packet_size,
            max_bandwidth_alt,
            use_bulk,
        ));
        break;
    }

    let Some((streaming_interface, endpoint_address, streaming, max_packet_size, max_bandwidth_alt, use_bulk)) =
        stream
    else {
        // A control interface without a usable input stream (output
        // terminals, no still support) is not a capture device.
        return Ok(None);
    };

    let description = DeviceDescription {
        vendor_id: descriptor.vendor_id(),
        product_id: descriptor.product_id(),
        control_interface,
        streaming_interface,
        endpoint_address,
        status_endpoint,
        max_bandwidth_alt,
        use_bulk,
        max_packet_size,
        units: UnitIds {
            camera_terminal: layout.camera_terminal.unwrap_or_default(),
            processing_unit: layout.processing_unit.unwrap_or_default(),
            extension_unit: layout.extension_unit.unwrap_or_default(),
        },
        initial_frame_index: streaming.preferred_index,
        frame_sizes: streaming.frame_sizes,
    };

    let handle = device.open().context("opening device")?;
    handle.set_auto_detach_kernel_driver(true).ok();
    handle
        .claim_interface(control_interface)
        .context("claiming control interface")?;
    handle
        .claim_interface(streaming_interface)
        .context("claiming streaming interface")?;

    info!(
        vendor = format_args!("{:04x}", description.vendor_id),
        product = format_args!("{:04x}", description.product_id),
        sizes = description.frame_sizes.len(),
        bulk = use_bulk,
        "camera discovered"
    );

    Ok(Some(DiscoveredCamera {
        controller: RusbHostController::new(handle, endpoint_address, status_endpoint, use_bulk),
        description,
    }))
}
