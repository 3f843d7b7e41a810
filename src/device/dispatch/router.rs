use std::{collections::HashMap, sync::Arc};

use crate::{
    commons::{error::Error, SignerResult},
    device::DeviceProvider,
    tokens::DeviceKind,
};

/// Routes device requests to the driver registered for a device kind.
///
/// Drivers are registered once at startup. A token whose device kind has
/// no registered driver stays in the registry but every device operation
/// on it fails with DeviceUnavailable.
#[derive(Debug, Default)]
pub struct DeviceRouter {
    providers: HashMap<DeviceKind, Arc<DeviceProvider>>,
}

impl DeviceRouter {
    pub fn build(providers: Vec<DeviceProvider>) -> SignerResult<Self> {
        let mut router = DeviceRouter::default();
        for provider in providers {
            router.register(provider)?;
        }
        Ok(router)
    }

    pub fn register(&mut self, provider: DeviceProvider) -> SignerResult<()> {
        let kind = provider.kind();
        if self.providers.contains_key(&kind) {
            return Err(Error::conflict(format!("A driver for device kind '{}' is already registered", kind)));
        }
        debug!("Registered driver for device kind '{}'", kind);
        self.providers.insert(kind, Arc::new(provider));
        Ok(())
    }

    pub fn get(&self, kind: &DeviceKind) -> SignerResult<Arc<DeviceProvider>> {
        self.providers
            .get(kind)
            .cloned()
            .ok_or_else(|| Error::DeviceKindUnknown(kind.to_string()))
    }

    /// All registered drivers, in device kind order.
    pub fn providers(&self) -> Vec<Arc<DeviceProvider>> {
        let mut kinds: Vec<_> = self.providers.keys().collect();
        kinds.sort();
        kinds.into_iter().filter_map(|k| self.providers.get(k).cloned()).collect()
    }
}

//------------ Tests ---------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use crate::{
        commons::error::ErrorKind,
        device::drivers::mock::{MockDriver, MockDriverCallCounts},
    };

    fn mock(kind: &str) -> DeviceProvider {
        let kind = DeviceKind::HardwareModule(kind.to_string());
        DeviceProvider::Mock(MockDriver::new(kind, Arc::new(MockDriverCallCounts::new())))
    }

    #[test]
    fn routes_by_kind() {
        let router = DeviceRouter::build(vec![mock("b"), mock("a")]).unwrap();

        let a = DeviceKind::HardwareModule("a".to_string());
        assert_eq!(router.get(&a).unwrap().kind(), a);

        let kinds: Vec<_> = router.providers().iter().map(|p| p.kind().to_string()).collect();
        assert_eq!(kinds, vec!["a", "b"]);
    }

    #[test]
    fn unknown_kind_is_unavailable() {
        let router = DeviceRouter::build(vec![mock("a")]).unwrap();
        let err = router.get(&DeviceKind::SoftKeystore).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DeviceUnavailable);
    }

    #[test]
    fn duplicate_kind_rejected() {
        let err = DeviceRouter::build(vec![mock("a"), mock("a")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }
}
