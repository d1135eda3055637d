//! Component registry: maps component type names to grabber factories.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use tracing::{debug, info};

use crate::config::{Attributes, GrabberConfig};
use crate::device::V4L2Backend;
use crate::grabber::FrameGrabber;
use crate::lifecycle::UploadGate;
use crate::mock::{SyntheticBackend, SyntheticCamera};
use crate::traits::{GrabberError, Result};

/// Type name of the V4L2 frame grabber.
pub const V4L2_COMPONENT: &str = "V4L2FrameGrabber";
/// Type name of the synthetic frame grabber.
pub const SYNTHETIC_COMPONENT: &str = "SyntheticFrameGrabber";

/// Frame rate of the synthetic component's generator.
const SYNTHETIC_FPS: f64 = 30.0;

/// Services the hosting application offers to components.
#[derive(Clone, Default)]
pub struct HostContext {
    /// Readiness of GPU upload, if the host has one.
    pub upload_gate: Option<Arc<dyn UploadGate>>,
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext")
            .field("upload_gate", &self.upload_gate.is_some())
            .finish()
    }
}

/// Builds a grabber instance from its name and configuration.
pub type ComponentFactory =
    Box<dyn Fn(&str, &GrabberConfig, &HostContext) -> Result<FrameGrabber> + Send + Sync>;

/// Name to factory mapping.
#[derive(Default)]
pub struct ComponentRegistry {
    factories: BTreeMap<String, ComponentFactory>,
}

impl std::fmt::Debug for ComponentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.factories.keys()).finish()
    }
}

impl ComponentRegistry {
    /// An empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in grabbers.
    #[must_use]
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(
            V4L2_COMPONENT,
            Box::new(|name: &str, config: &GrabberConfig, host: &HostContext| {
                FrameGrabber::new(name, config.clone(), &V4L2Backend::new(), host.upload_gate.clone())
            }),
        );
        registry.register(
            SYNTHETIC_COMPONENT,
            Box::new(|name: &str, config: &GrabberConfig, host: &HostContext| {
                let backend = SyntheticBackend::new()
                    .with_camera(SyntheticCamera::new("Synthetic Camera", "synthetic:0"))
                    .with_generator(SYNTHETIC_FPS);
                FrameGrabber::new(name, config.clone(), &backend, host.upload_gate.clone())
            }),
        );
        registry
    }

    /// Register `factory` as `type_name`, replacing any previous entry.
    pub fn register(&mut self, type_name: &str, factory: ComponentFactory) {
        if self.factories.insert(type_name.to_owned(), factory).is_some() {
            debug!(type_name, "component factory replaced");
        } else {
            debug!(type_name, "component factory registered");
        }
    }

    /// Whether `type_name` is registered.
    pub fn contains(&self, type_name: &str) -> bool {
        self.factories.contains_key(type_name)
    }

    /// Registered type names, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Parse `attributes` and build a `type_name` instance called
    /// `instance_name`.
    pub fn create(
        &self,
        type_name: &str,
        instance_name: &str,
        attributes: &Attributes,
        host: &HostContext,
    ) -> Result<FrameGrabber> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| GrabberError::UnknownComponent(type_name.to_owned()))?;
        let config = GrabberConfig::from_attributes(attributes)?;
        info!(type_name, instance_name, "creating component");
        factory(instance_name, &config, host)
    }

    /// Remove every factory.
    pub fn teardown(&mut self) {
        let count = self.factories.len();
        self.factories.clear();
        info!(count, "component registry torn down");
    }
}

static GLOBAL: OnceLock<Mutex<ComponentRegistry>> = OnceLock::new();

/// The process-wide registry, populated with the built-in grabbers on first
/// use.
pub fn global() -> &'static Mutex<ComponentRegistry> {
    GLOBAL.get_or_init(|| Mutex::new(ComponentRegistry::with_builtin()))
}

/// Tear the process-wide registry down.
pub fn shutdown() {
    if let Some(registry) = GLOBAL.get() {
        registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .teardown();
    }
}
