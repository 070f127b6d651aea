//! # Data manager
//!
//! Per-observation-domain worker group. On creation it instantiates one
//! storage plugin per catalogue entry applicable to its ODID and spawns a
//! thread per plugin; every worker owns a private cursor on the manager's
//! shared queue, so each sink sees every message. Messages are written with
//! a reference count equal to the worker count and reclaimed once the
//! slowest sink releases them.
//!
//! ODID-pinned plugins take precedence: when any catalogue entry is pinned
//! to this ODID, unpinned entries are skipped. A plugin whose
//! initialisation fails is logged and omitted; a manager that ends up with
//! no plugins at all is not created.

use crate::plugins::StoragePlugin;
use crate::ring_buffer::{ReadCursor, RingBuffer};
use crate::template_manager::TemplateManager;
use crate::CollectorError;

use log::{info, warn};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Catalogue entry describing one configured storage sink.
#[derive(Clone)]
pub struct StorageDescriptor {
    pub id: u32,
    pub name: String,
    /// Pin to a single observation domain; `None` accepts all.
    pub odid_filter: Option<u32>,
    /// Force the output manager into single-data-manager mode.
    pub require_single_manager: bool,
    pub factory: Arc<dyn Fn() -> Result<Box<dyn StoragePlugin>, CollectorError> + Send + Sync>,
}

impl std::fmt::Debug for StorageDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageDescriptor")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("odid_filter", &self.odid_filter)
            .field("require_single_manager", &self.require_single_manager)
            .finish()
    }
}

struct StorageWorker {
    descriptor_id: u32,
    name: String,
    handle: JoinHandle<Box<dyn StoragePlugin>>,
}

/// The worker group of one ODID.
pub struct DataManager {
    odid: u32,
    /// Active sources feeding this ODID; maintained by the output manager.
    pub references: u32,
    store_queue: Arc<RingBuffer>,
    templates: Arc<TemplateManager>,
    workers: Vec<StorageWorker>,
}

impl DataManager {
    /// Create the manager and start one worker per applicable catalogue
    /// entry. Returns `None` when no plugin could be started.
    pub fn create(
        odid: u32,
        catalogue: &[StorageDescriptor],
        templates: Arc<TemplateManager>,
        ring_size: usize,
    ) -> Option<DataManager> {
        let store_queue = match RingBuffer::new(ring_size) {
            Ok(q) => q,
            Err(e) => {
                warn!("[{odid}] unable to create the data manager queue: {e}");
                return None;
            }
        };

        let mut manager = DataManager {
            odid,
            references: 0,
            store_queue,
            templates,
            workers: Vec::new(),
        };

        let pinned_here = catalogue
            .iter()
            .any(|d| d.odid_filter == Some(odid));

        for descriptor in catalogue {
            let applicable = match descriptor.odid_filter {
                Some(filter) => filter == odid,
                None => !pinned_here,
            };
            if applicable {
                manager.start_plugin(descriptor);
            }
        }

        if manager.workers.is_empty() {
            warn!("[{odid}] no storage plugin started for the data manager");
            return None;
        }
        Some(manager)
    }

    pub fn odid(&self) -> u32 {
        self.odid
    }

    pub fn plugin_count(&self) -> usize {
        self.workers.len()
    }

    pub fn queue_depth(&self) -> (usize, usize) {
        (self.store_queue.len(), self.store_queue.capacity())
    }

    /// Enqueue a message for every storage worker.
    pub fn dispatch(&self, msg: Arc<crate::message::IpfixMessage>) -> Result<(), CollectorError> {
        self.store_queue.write(Some(msg), self.workers.len())
    }

    fn start_plugin(&mut self, descriptor: &StorageDescriptor) {
        match (descriptor.factory)() {
            Ok(plugin) => self.spawn_worker(descriptor.id, descriptor.name.clone(), plugin),
            Err(e) => {
                warn!(
                    "[{}] initiating storage plugin {} failed: {e}",
                    self.odid, descriptor.name
                );
            }
        }
    }

    fn spawn_worker(&mut self, descriptor_id: u32, name: String, mut plugin: Box<dyn StoragePlugin>) {
        let queue = Arc::clone(&self.store_queue);
        let templates = Arc::clone(&self.templates);
        let odid = self.odid;
        let thread_name = format!("out:{name} {odid}");
        let worker_name = name.clone();

        let handle = thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let mut cursor = ReadCursor::new();
                loop {
                    let msg = queue.read(&mut cursor);
                    let Some(msg) = msg else {
                        info!("[{odid}] no more data for storage plugin {worker_name}");
                        queue.release(&mut cursor).ok();
                        break;
                    };

                    if let Err(e) = plugin.store(&msg, &templates) {
                        warn!("[{odid}] storage plugin {worker_name} failed to store: {e}");
                    }
                    queue.release(&mut cursor).ok();

                    // Idle queue: give the plugin a chance to flush.
                    if queue.is_empty() {
                        if let Err(e) = plugin.store_now() {
                            warn!("[{odid}] storage plugin {worker_name} flush failed: {e}");
                        }
                    }
                }
                plugin
            });

        match handle {
            Ok(handle) => self.workers.push(StorageWorker {
                descriptor_id,
                name,
                handle,
            }),
            Err(e) => warn!("[{}] unable to create storage plugin thread: {e}", self.odid),
        }
    }

    /// Drain the queue and park every worker, returning the plugin states.
    /// The queue is empty afterwards, so restarted workers attach cleanly.
    fn stop_workers(&mut self) -> Vec<(u32, String, Box<dyn StoragePlugin>)> {
        if self.workers.is_empty() {
            return Vec::new();
        }
        if self
            .store_queue
            .write(None, self.workers.len())
            .is_err()
        {
            warn!("[{}] unable to write storage shutdown sentinel", self.odid);
        }

        let mut parked = Vec::new();
        for worker in self.workers.drain(..) {
            match worker.handle.join() {
                Ok(plugin) => parked.push((worker.descriptor_id, worker.name, plugin)),
                Err(_) => warn!("storage worker {} panicked", worker.name),
            }
        }
        parked
    }

    /// Add one plugin at runtime. Workers are cycled so that in-flight
    /// messages (written with the old reference count) drain first.
    pub fn add_plugin(&mut self, descriptor: &StorageDescriptor) {
        let parked = self.stop_workers();
        for (id, name, plugin) in parked {
            self.spawn_worker(id, name, plugin);
        }
        self.start_plugin(descriptor);
    }

    /// Remove the plugin started from descriptor `id`, closing its state.
    pub fn remove_plugin(&mut self, id: u32) {
        let parked = self.stop_workers();
        for (desc_id, name, mut plugin) in parked {
            if desc_id == id {
                plugin.close();
            } else {
                self.spawn_worker(desc_id, name, plugin);
            }
        }
    }

    /// Terminate every worker and close the plugins.
    pub fn close(mut self) {
        for (_, _, mut plugin) in self.stop_workers() {
            plugin.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputInfo, SourceStatus, Transport};
    use crate::message::IpfixMessage;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct CountingSink(Arc<AtomicU64>);

    impl StoragePlugin for CountingSink {
        fn store(
            &mut self,
            msg: &IpfixMessage,
            _templates: &TemplateManager,
        ) -> Result<(), CollectorError> {
            self.0
                .fetch_add(u64::from(msg.data_records_count.max(1)), Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor(id: u32, odid_filter: Option<u32>, counter: Arc<AtomicU64>) -> StorageDescriptor {
        StorageDescriptor {
            id,
            name: format!("sink-{id}"),
            odid_filter,
            require_single_manager: false,
            factory: Arc::new(move || Ok(Box::new(CountingSink(Arc::clone(&counter))) as Box<dyn StoragePlugin>)),
        }
    }

    fn message() -> Arc<IpfixMessage> {
        let info = Arc::new(InputInfo::network(
            Transport::Udp,
            "127.0.0.1:4739".parse().unwrap(),
        ));
        Arc::new(IpfixMessage::source_event(info, SourceStatus::Opened))
    }

    #[test]
    fn every_worker_sees_every_message() {
        let tm = Arc::new(TemplateManager::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let catalogue = vec![
            descriptor(1, None, Arc::clone(&a)),
            descriptor(2, None, Arc::clone(&b)),
        ];

        let dm = DataManager::create(5, &catalogue, tm, 16).unwrap();
        assert_eq!(dm.plugin_count(), 2);
        for _ in 0..4 {
            dm.dispatch(message()).unwrap();
        }
        dm.close();

        assert_eq!(a.load(Ordering::SeqCst), 4);
        assert_eq!(b.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn odid_pinned_plugins_shadow_unpinned_ones() {
        let tm = Arc::new(TemplateManager::new());
        let pinned = Arc::new(AtomicU64::new(0));
        let agnostic = Arc::new(AtomicU64::new(0));
        let catalogue = vec![
            descriptor(1, Some(5), Arc::clone(&pinned)),
            descriptor(2, None, Arc::clone(&agnostic)),
        ];

        let dm = DataManager::create(5, &catalogue, tm, 16).unwrap();
        assert_eq!(dm.plugin_count(), 1);
        dm.dispatch(message()).unwrap();
        dm.close();

        assert_eq!(pinned.load(Ordering::SeqCst), 1);
        assert_eq!(agnostic.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn mismatched_pin_prevents_creation() {
        let tm = Arc::new(TemplateManager::new());
        let counter = Arc::new(AtomicU64::new(0));
        let catalogue = vec![descriptor(1, Some(9), counter)];
        assert!(DataManager::create(5, &catalogue, tm, 16).is_none());
    }

    #[test]
    fn plugins_can_come_and_go_at_runtime() {
        let tm = Arc::new(TemplateManager::new());
        let a = Arc::new(AtomicU64::new(0));
        let b = Arc::new(AtomicU64::new(0));
        let catalogue = vec![descriptor(1, None, Arc::clone(&a))];

        let mut dm = DataManager::create(5, &catalogue, tm, 16).unwrap();
        dm.dispatch(message()).unwrap();

        dm.add_plugin(&descriptor(2, None, Arc::clone(&b)));
        assert_eq!(dm.plugin_count(), 2);
        dm.dispatch(message()).unwrap();

        dm.remove_plugin(1);
        assert_eq!(dm.plugin_count(), 1);
        dm.dispatch(message()).unwrap();
        dm.close();

        assert_eq!(a.load(Ordering::SeqCst), 2);
        assert_eq!(b.load(Ordering::SeqCst), 2);
    }
}
