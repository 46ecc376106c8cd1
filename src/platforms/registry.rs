//! Platform registry
//!
//! In-memory registry mapping platform slugs to their service
//! implementations. A missing platform is a unit-level error at pickup,
//! never a process crash.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::platforms::IntegrationService;
use crate::platforms::sample::SampleService;

/// Error type for registry operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("platform '{platform}' is not registered")]
    PlatformNotFound { platform: String },
}

/// Global platform registry instance
static REGISTRY: OnceLock<Arc<RwLock<Registry>>> = OnceLock::new();

/// Registry of platform services keyed by slug
#[derive(Clone, Default)]
pub struct Registry {
    services: HashMap<String, Arc<dyn IntegrationService>>,
}

impl Registry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self {
            services: HashMap::new(),
        }
    }

    /// Get the global registry instance
    pub fn global() -> &'static Arc<RwLock<Registry>> {
        REGISTRY.get_or_init(|| Arc::new(RwLock::new(Self::new())))
    }

    /// Initialize the global registry with the built-in platforms
    pub fn initialize() {
        let registry = Self::global();
        let mut reg = registry.write().unwrap();

        reg.register(Arc::new(SampleService::new()));
    }

    /// Register a platform service under its slug
    pub fn register(&mut self, service: Arc<dyn IntegrationService>) {
        self.services
            .insert(service.platform().to_string(), service);
    }

    /// Get a service by platform slug
    pub fn get(&self, platform: &str) -> Result<Arc<dyn IntegrationService>, RegistryError> {
        self.services
            .get(platform)
            .cloned()
            .ok_or_else(|| RegistryError::PlatformNotFound {
                platform: platform.to_string(),
            })
    }

    /// Registered platform slugs, sorted for stable ordering
    pub fn platforms(&self) -> Vec<String> {
        let mut platforms: Vec<_> = self.services.keys().cloned().collect();
        platforms.sort();
        platforms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::StreamContext;
    use crate::error::HandlerError;
    use async_trait::async_trait;

    struct TestService;

    #[async_trait]
    impl IntegrationService for TestService {
        fn platform(&self) -> &str {
            "test-platform"
        }

        async fn process_stream(&self, _ctx: &StreamContext) -> Result<(), HandlerError> {
            Ok(())
        }
    }

    #[test]
    fn unknown_platform_is_an_error() {
        let registry = Registry::new();

        let result = registry.get("unknown");
        assert!(result.is_err());
        if let Err(RegistryError::PlatformNotFound { platform }) = result {
            assert_eq!(platform, "unknown");
        } else {
            panic!("expected PlatformNotFound error");
        }
    }

    #[test]
    fn registered_platform_resolves() {
        let mut registry = Registry::new();
        registry.register(Arc::new(TestService));

        let service = registry.get("test-platform");
        assert!(service.is_ok());
        assert_eq!(service.unwrap().platform(), "test-platform");
    }

    #[test]
    fn platforms_list_is_sorted() {
        let mut registry = Registry::new();
        registry.register(Arc::new(SampleService::new()));
        registry.register(Arc::new(TestService));

        let platforms = registry.platforms();
        let mut sorted = platforms.clone();
        sorted.sort();
        assert_eq!(platforms, sorted);
        assert!(platforms.contains(&"test-platform".to_string()));
    }

    #[test]
    fn initialize_registers_sample_platform() {
        Registry::initialize();

        let registry = Registry::global();
        let reg = registry.read().unwrap();
        assert!(reg.get(crate::platforms::SAMPLE_PLATFORM).is_ok());
    }
}
