//! Device model registry, mirroring the teacher's `Model::from_name`
//! lookup table but resolving to a boxed [`DeviceDriver`] instead of a
//! bare enum discriminant.

pub mod hem_7361t;

use crate::driver::DeviceDriver;
use hem_7361t::Hem7361t;

/// Supported OMRON device models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceModel {
    Hem7361T,
}

impl DeviceModel {
    /// Resolve a model from the device's advertised GATT name, as read
    /// from device-info during discovery. Falls back to `None` for
    /// anything not yet supported.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim() {
            "HEM-7361T" | "M7 Intelli IT" => Some(DeviceModel::Hem7361T),
            _ => None,
        }
    }

    pub fn driver(&self) -> Box<dyn DeviceDriver> {
        match self {
            DeviceModel::Hem7361T => Box::new(Hem7361t::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DeviceModel::Hem7361T => "HEM-7361T",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_name_recognizes_known_aliases() {
        assert_eq!(DeviceModel::from_name("HEM-7361T"), Some(DeviceModel::Hem7361T));
        assert_eq!(DeviceModel::from_name("M7 Intelli IT"), Some(DeviceModel::Hem7361T));
        assert_eq!(DeviceModel::from_name("Some Other Monitor"), None);
    }
}
