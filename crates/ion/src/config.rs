use alloc::{borrow::ToOwned as _, string::String};

use dmabuf::log::LogLevel;

/// Registration parameters of an [`IonDevice`](crate::IonDevice).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IonConfig {
    /// Name of the device node, used as the log prefix.
    pub device_name: String,
    /// Name of the device class the node is registered under.
    pub class_name: String,
    /// Most verbose level that is logged once the device is up.
    pub log_level: LogLevel,
}

impl Default for IonConfig {
    fn default() -> Self {
        Self {
            device_name: "ion".to_owned(),
            class_name: "ion_class".to_owned(),
            log_level: LogLevel::Info,
        }
    }
}

impl IonConfig {
    #[must_use]
    pub fn with_device_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.device_name);
        self
    }

    #[must_use]
    pub fn with_class_name(mut self, name: &str) -> Self {
        name.clone_into(&mut self.class_name);
        self
    }

    #[must_use]
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }
}
