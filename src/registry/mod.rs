//! Queue registry: the object the host application holds on to.
//!
//! Built once at startup from explicit registrations and discovered
//! manifests, then shared by reference with producers and worker pools.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::info;
use serde_json::Value;
use tokio::sync::Notify;

use crate::discovery::{self, DiscoveryOptions};
use crate::errors::{BullpenError, Result};
use crate::handler::{HostContext, JobHandler};
use crate::hooks::Hooks;
use crate::job::{Job, JobId, JobOptions};
use crate::queue::Queue;
use crate::store::JobStore;
use crate::utils::validate_queue_name;

/// A queue to create at build time
#[derive(Debug, Clone)]
struct QueueDefinition {
    name: String,
    /// Explicit catalog key; `None` binds the handler registered under the queue name, if any
    handler: Option<String>,
    defaults: JobOptions,
}

pub struct Registry {
    queues: BTreeMap<String, Arc<Queue>>,
    store: Arc<dyn JobStore>,
    hooks: Hooks,
    host: Option<HostContext>,
    notify: Arc<Notify>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    pub fn queue(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Queue names in sorted order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn hooks(&self) -> &Hooks {
        &self.hooks
    }

    pub fn host(&self) -> Option<HostContext> {
        self.host.clone()
    }

    pub(crate) fn notifier(&self) -> Arc<Notify> {
        self.notify.clone()
    }

    /// Enqueue on a named queue
    pub async fn enqueue(&self, queue: &str, payload: Value, options: Option<JobOptions>) -> Result<JobId> {
        self.queue(queue)
            .ok_or_else(|| BullpenError::InvalidArgument(format!("unknown queue {}", queue)))?
            .enqueue(payload, options)
            .await
    }

    /// Close every queue; used on process shutdown
    pub fn close_all(&self) {
        for queue in self.queues.values() {
            queue.close();
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("queues", &self.queues.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[derive(Default)]
pub struct RegistryBuilder {
    store: Option<Arc<dyn JobStore>>,
    hooks: Hooks,
    host: Option<HostContext>,
    catalog: HashMap<String, Arc<dyn JobHandler>>,
    definitions: Vec<QueueDefinition>,
    discovery: Vec<(PathBuf, DiscoveryOptions)>,
    errors: Vec<BullpenError>,
}

impl RegistryBuilder {
    /// Job store shared by all queues
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Host value handed to every handler through `JobContext::host`
    pub fn host<T: Any + Send + Sync>(mut self, host: T) -> Self {
        self.host = Some(Arc::new(host));
        self
    }

    /// Add a handler to the catalog manifests bind against
    pub fn handler(mut self, key: &str, handler: Arc<dyn JobHandler>) -> Self {
        if self.catalog.insert(key.to_string(), handler).is_some() {
            self.errors.push(BullpenError::DuplicateHandler(key.to_string()));
        }
        self
    }

    /// Define a queue with its handler
    pub fn queue(self, name: &str, handler: Arc<dyn JobHandler>) -> Self {
        self.queue_with_options(name, handler, JobOptions::default())
    }

    /// Define a queue with its handler and job defaults
    pub fn queue_with_options(self, name: &str, handler: Arc<dyn JobHandler>, defaults: JobOptions) -> Self {
        let mut builder = self.handler(name, handler);
        builder.definitions.push(QueueDefinition {
            name: name.to_string(),
            handler: Some(name.to_string()),
            defaults,
        });
        builder
    }

    /// Define a queue that only accepts jobs; it never dispatches
    pub fn producer_queue(mut self, name: &str, defaults: JobOptions) -> Self {
        self.definitions.push(QueueDefinition {
            name: name.to_string(),
            handler: None,
            defaults,
        });
        self
    }

    /// Add the queues described by manifests found below `root`
    pub fn discover<P: AsRef<Path>>(mut self, root: P, options: DiscoveryOptions) -> Self {
        self.discovery.push((root.as_ref().to_path_buf(), options));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &BullpenError) + Send + Sync + 'static,
    {
        self.hooks.set_on_error(hook);
        self
    }

    pub fn on_job_failed<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &Job, &BullpenError) + Send + Sync + 'static,
    {
        self.hooks.set_on_job_failed(hook);
        self
    }

    /// Create every queue. Configuration errors fail here, before any job runs.
    pub fn build(self) -> Result<Registry> {
        let RegistryBuilder {
            store,
            hooks,
            host,
            catalog,
            mut definitions,
            discovery,
            errors,
        } = self;

        if let Some(err) = errors.into_iter().next() {
            return Err(err);
        }
        let store = store.ok_or_else(|| BullpenError::ConfigError("no job store configured".to_string()))?;

        for (root, options) in &discovery {
            for manifest in discovery::discover(root, options)? {
                definitions.push(QueueDefinition {
                    name: manifest.name,
                    handler: manifest.handler,
                    defaults: manifest.defaults,
                });
            }
        }

        let notify = Arc::new(Notify::new());
        let mut queues = BTreeMap::new();

        for definition in definitions {
            validate_queue_name(&definition.name)?;
            if queues.contains_key(&definition.name) {
                return Err(BullpenError::DuplicateQueue(definition.name));
            }

            let handler = match &definition.handler {
                Some(key) => Some(catalog.get(key).cloned().ok_or_else(|| BullpenError::UnknownHandler {
                    queue: definition.name.clone(),
                    handler: key.clone(),
                })?),
                None => catalog.get(&definition.name).cloned(),
            };

            let mut queue = Queue::with_notify(&definition.name, store.clone(), definition.defaults, notify.clone())?;
            match handler {
                Some(handler) => queue = queue.with_handler(handler),
                None => info!("Queue {} has no handler and will not dispatch", definition.name),
            }

            info!("Registered queue {}", definition.name);
            queues.insert(definition.name, Arc::new(queue));
        }

        Ok(Registry {
            queues,
            store,
            hooks,
            host,
            notify,
        })
    }
}
