//! Named driver instances.
//!
//! Hosts that run several cameras look drivers up by port name. The registry
//! is an explicit object owned by the host; there is no global table.

use std::collections::HashMap;

use crate::driver::DriverHandle;
use crate::error::{AppResult, DriverError};

/// Running drivers keyed by port name.
#[derive(Debug, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, DriverHandle>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its port name. Names are unique.
    pub fn register(&mut self, handle: DriverHandle) -> AppResult<()> {
        let name = handle.port_name().to_string();
        if self.drivers.contains_key(&name) {
            return Err(DriverError::DuplicateDriver(name));
        }
        tracing::debug!(port = %name, "driver registered");
        self.drivers.insert(name, handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> AppResult<&DriverHandle> {
        self.drivers
            .get(name)
            .ok_or_else(|| DriverError::DriverNotFound(name.to_string()))
    }

    pub fn remove(&mut self, name: &str) -> AppResult<DriverHandle> {
        self.drivers
            .remove(name)
            .ok_or_else(|| DriverError::DriverNotFound(name.to_string()))
    }

    /// Registered port names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DriverConfig;
    use crate::driver::PcoDriver;
    use crate::image::Image;
    use crate::mock::MockCamera;
    use crate::pipeline::Outputs;
    use std::sync::Arc;

    fn driver(port: &str) -> PcoDriver {
        let mut config = DriverConfig::default();
        config.driver.port_name = port.to_string();
        PcoDriver::spawn(
            &config,
            Arc::new(MockCamera::small(8, 4)),
            Outputs::new(|_: Image| {}),
        )
        .unwrap()
    }

    #[test]
    fn register_and_look_up() {
        let a = driver("PCO1");
        let b = driver("PCO2");
        let mut registry = DriverRegistry::new();
        registry.register(a.handle()).unwrap();
        registry.register(b.handle()).unwrap();

        assert_eq!(registry.names(), vec!["PCO1", "PCO2"]);
        assert_eq!(registry.get("PCO2").unwrap().port_name(), "PCO2");
        assert!(matches!(
            registry.get("PCO3"),
            Err(DriverError::DriverNotFound(ref name)) if name == "PCO3"
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let a = driver("PCO1");
        let mut registry = DriverRegistry::new();
        registry.register(a.handle()).unwrap();
        let err = registry.register(a.handle()).unwrap_err();
        assert!(matches!(err, DriverError::DuplicateDriver(ref name) if name == "PCO1"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn remove_forgets_the_driver() {
        let a = driver("PCO1");
        let mut registry = DriverRegistry::new();
        registry.register(a.handle()).unwrap();
        registry.remove("PCO1").unwrap();
        assert!(registry.is_empty());
        assert!(registry.remove("PCO1").is_err());
    }
}
