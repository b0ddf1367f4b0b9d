//! Finding an RNDIS control interface and its CDC data partner.
//!
//! Two strategies are offered. [`match_device`] looks at every
//! configuration of a whole device, which is how tethering phones are
//! usually bound. [`match_interface`] starts from a single interface the
//! host stack already picked. Both accept exactly the same pairs.

use log::debug;

use crate::usb::{ConfigurationDescriptor, InterfaceClass, InterfaceDescriptor};

/// Flavours of RNDIS control interface, keyed by (class, subclass, protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    /// Wireless controller / RF / RNDIS, used by stock Android.
    Android,
    /// Communications / vendor / vendor, used by the Linux RNDIS gadget.
    LinuxGadget,
    /// Miscellaneous / RNDIS over Ethernet / RNDIS.
    MiscRndis,
}

impl ControlKind {
    pub const ALL: [ControlKind; 3] = [
        ControlKind::Android,
        ControlKind::LinuxGadget,
        ControlKind::MiscRndis,
    ];

    pub const fn triple(self) -> (u8, u8, u8) {
        match self {
            ControlKind::Android => (InterfaceClass::WirelessController.code(), 1, 3),
            ControlKind::LinuxGadget => (InterfaceClass::Communications.code(), 2, 0xff),
            ControlKind::MiscRndis => (InterfaceClass::Miscellaneous.code(), 4, 1),
        }
    }

    pub fn classify(desc: &InterfaceDescriptor) -> Option<ControlKind> {
        let triple = desc.triple();
        Self::ALL.into_iter().find(|kind| kind.triple() == triple)
    }
}

pub fn is_cdc_data(desc: &InterfaceDescriptor) -> bool {
    desc.class == InterfaceClass::CdcData.code()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterfaceMatch {
    pub configuration_value: u8,
    pub control_interface: u8,
    pub data_interface: u8,
    pub kind: ControlKind,
}

/// Accepts `control` if it is an RNDIS control interface and `config`
/// holds a CDC data interface numbered directly after it.
pub fn match_interface(
    config: &ConfigurationDescriptor,
    control: &InterfaceDescriptor,
) -> Option<InterfaceMatch> {
    let kind = ControlKind::classify(control)?;
    let data_number = control.number.checked_add(1)?;

    match config.interface(data_number) {
        Some(data) if is_cdc_data(&data.descriptor) => Some(InterfaceMatch {
            configuration_value: config.value,
            control_interface: control.number,
            data_interface: data_number,
            kind,
        }),
        _ => {
            debug!(
                "match: {:?} control at {} has no CDC data interface at {}",
                kind, control.number, data_number
            );
            None
        }
    }
}

/// Scans every configuration for the first acceptable control/data pair.
pub fn match_device(configs: &[ConfigurationDescriptor]) -> Option<InterfaceMatch> {
    configs.iter().find_map(|config| {
        config
            .interfaces
            .iter()
            .find_map(|entry| match_interface(config, &entry.descriptor))
    })
}
