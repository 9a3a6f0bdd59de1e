use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::api::middleware::AppError;
use crate::services::database::{mask_credentials, DriverCatalog, SqlDriver};

struct Registration {
    driver: Arc<dyn SqlDriver>,
    refs: usize,
}

struct BrokerInner {
    catalog: DriverCatalog,
    registrations: Mutex<HashMap<String, Registration>>,
}

impl BrokerInner {
    fn registrations(&self) -> MutexGuard<'_, HashMap<String, Registration>> {
        // A panic while holding the lock cannot leave a count half-updated
        self.registrations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release(&self, name: &str) -> Result<(), AppError> {
        let mut registrations = self.registrations();
        let remaining = match registrations.get_mut(name) {
            Some(registration) => {
                registration.refs -= 1;
                registration.refs
            }
            None => {
                return Err(AppError::ResourceRelease(format!(
                    "driver `{}` is not registered",
                    name
                )))
            }
        };

        if remaining == 0 {
            registrations.remove(name);
            tracing::debug!("Deregistered driver `{}`", name);
        } else {
            tracing::debug!("Released driver `{}` ({} still in use)", name, remaining);
        }
        Ok(())
    }
}

/// Process-wide driver table with reference-counted registration.
///
/// The first `acquire` of a driver instantiates and registers it; later
/// acquisitions share the registration. The driver is deregistered when the
/// last handle is released, so one request can never tear down a driver that a
/// concurrent request is still using.
#[derive(Clone)]
pub struct DriverBroker {
    inner: Arc<BrokerInner>,
}

impl DriverBroker {
    pub fn new(catalog: DriverCatalog) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                catalog,
                registrations: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn catalog(&self) -> &DriverCatalog {
        &self.inner.catalog
    }

    /// Register (or share) the driver named by `driver_id` for use against `url`
    pub fn acquire(&self, driver_id: &str, url: &str) -> Result<DriverHandle, AppError> {
        let catalog = &self.inner.catalog;
        let name = catalog
            .resolve(driver_id)
            .map_err(|e| AppError::DriverLoad {
                driver: driver_id.to_string(),
                reason: e.to_string(),
            })?
            .to_string();

        let mut registrations = self.inner.registrations();
        let driver = match registrations.get_mut(&name) {
            Some(registration) => {
                registration.refs += 1;
                Arc::clone(&registration.driver)
            }
            None => {
                let driver = catalog.instantiate(driver_id).map_err(|e| AppError::DriverLoad {
                    driver: driver_id.to_string(),
                    reason: e.to_string(),
                })?;
                tracing::debug!("Registered driver `{}`", name);
                registrations.insert(
                    name.clone(),
                    Registration {
                        driver: Arc::clone(&driver),
                        refs: 1,
                    },
                );
                driver
            }
        };
        drop(registrations);

        let handle = DriverHandle {
            name,
            driver,
            broker: Arc::clone(&self.inner),
            released: false,
        };

        if !handle.driver.accepts_url(url) {
            // Dropping the handle gives the registration back
            return Err(AppError::DriverUnavailable {
                url: mask_credentials(url),
                reason: format!("driver `{}` does not accept this url", handle.name),
            });
        }

        Ok(handle)
    }

    /// Give a handle back. Equivalent to dropping it, but reports inconsistencies.
    pub fn release(&self, mut handle: DriverHandle) -> Result<(), AppError> {
        handle.release_once()
    }

    /// Number of live handles for a canonical driver name
    pub fn registration_count(&self, name: &str) -> usize {
        self.inner
            .registrations()
            .get(name)
            .map_or(0, |registration| registration.refs)
    }

    /// Canonical names of currently registered drivers, sorted
    pub fn registered_drivers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.registrations().keys().cloned().collect();
        names.sort();
        names
    }
}

/// A counted use of a registered driver. Released explicitly through
/// [`DriverBroker::release`] or on drop.
pub struct DriverHandle {
    name: String,
    driver: Arc<dyn SqlDriver>,
    broker: Arc<BrokerInner>,
    released: bool,
}

impl DriverHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &dyn SqlDriver {
        self.driver.as_ref()
    }

    fn release_once(&mut self) -> Result<(), AppError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.broker.release(&self.name)
    }
}

impl Drop for DriverHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_once() {
            tracing::warn!("{}", e);
        }
    }
}

impl std::fmt::Debug for DriverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverHandle")
            .field("name", &self.name)
            .field("released", &self.released)
            .finish()
    }
}
