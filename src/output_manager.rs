//! # Output manager
//!
//! Dispatcher between the pipeline and the per-ODID data managers. The
//! worker thread reads messages from its input queue, resolves the message
//! ODID to a data manager (creating one on first sight from the storage
//! catalogue), tracks source lifecycles and forwards data messages into the
//! manager's queue with a reference count matching its worker pool.
//!
//! The input queue can be swapped at a reconfiguration boundary: the new
//! queue is staged, a sentinel is written to the old queue, and the worker
//! switches over when it drains to the sentinel, so no message is lost.
//!
//! When any configured storage plugin requires it, the manager runs in
//! single-data-manager mode: every ODID shares one manager keyed 0 and new
//! ODIDs do not spawn new managers.

use crate::data_manager::{DataManager, StorageDescriptor};
use crate::input::{InputInfo, SourceStatus};
use crate::message::IpfixMessage;
use crate::ring_buffer::{ReadCursor, RingBuffer};
use crate::stats::{QueueDirectory, StatsReporter, StatsSettings};
use crate::template_manager::TemplateManager;
use crate::CollectorError;

use log::{debug, info, warn};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};

/// Upper bound of configured storage plugins.
pub const MAX_STORAGE_PLUGINS: usize = 32;

struct Shared {
    templates: Arc<TemplateManager>,
    ring_size: usize,
    in_queue: Mutex<Arc<RingBuffer>>,
    staged_in: Mutex<Option<Arc<RingBuffer>>>,
    swap_cond: Condvar,
    catalogue: Mutex<Vec<StorageDescriptor>>,
    managers: Mutex<Vec<DataManager>>,
    input_infos: Arc<Mutex<Vec<Arc<InputInfo>>>>,
    single_manager: AtomicBool,
    running: AtomicBool,
}

impl Shared {
    fn route_odid(&self, odid: u32) -> u32 {
        if self.single_manager.load(Ordering::Relaxed) {
            0
        } else {
            odid
        }
    }

    fn remember_input(&self, info: &Arc<InputInfo>) {
        let mut infos = self.input_infos.lock().unwrap();
        if !infos.iter().any(|known| Arc::ptr_eq(known, info)) {
            infos.push(Arc::clone(info));
        }
    }

    /// Route one message; the caller releases the input-queue slot.
    fn route(&self, msg: Arc<IpfixMessage>) {
        self.remember_input(&msg.input_info);

        let odid = msg.odid();
        let route_odid = self.route_odid(odid);
        let mut managers = self.managers.lock().unwrap();

        let index = match managers.iter().position(|dm| dm.odid() == route_odid) {
            Some(index) => index,
            None => {
                let catalogue = self.catalogue.lock().unwrap();
                if catalogue.is_empty() {
                    warn!("[{odid}] no storage plugins configured; skipping data");
                    return;
                }
                match DataManager::create(
                    route_odid,
                    &catalogue,
                    Arc::clone(&self.templates),
                    self.ring_size,
                ) {
                    Some(dm) => {
                        info!("[{route_odid}] data manager created");
                        managers.push(dm);
                        managers.len() - 1
                    }
                    None => {
                        warn!("[{odid}] unable to create data manager; skipping data");
                        return;
                    }
                }
            }
        };

        match msg.source_status {
            SourceStatus::New => {
                debug!("[{odid}] new source");
                managers[index].references += 1;
            }
            SourceStatus::Closed => {
                debug!("[{odid}] closed source");
                managers[index].references = managers[index].references.saturating_sub(1);
                if managers[index].references == 0 {
                    debug!("[{odid}] no sources left; releasing templates");
                    let dm = managers.swap_remove(index);
                    dm.close();
                    self.templates.remove_all_for_odid(odid);
                }
                return;
            }
            SourceStatus::Opened => {}
        }

        if let Err(e) = managers[index].dispatch(msg) {
            warn!("[{odid}] unable to write into data manager queue; skipping data ({e})");
        }
    }

    fn worker_loop(&self) {
        let mut cursor = ReadCursor::new();
        loop {
            let queue = Arc::clone(&self.in_queue.lock().unwrap());
            let msg = queue.read(&mut cursor);

            let Some(msg) = msg else {
                queue.release(&mut cursor).ok();
                let mut staged = self.staged_in.lock().unwrap();
                if let Some(new_queue) = staged.take() {
                    *self.in_queue.lock().unwrap() = new_queue;
                    cursor = ReadCursor::new();
                    self.swap_cond.notify_all();
                    continue;
                }
                break;
            };

            self.route(msg);
            queue.release(&mut cursor).ok();
        }
        info!("closing output manager thread");
    }
}

/// Cloneable control surface used by the configurator and the statistics
/// reporter.
#[derive(Clone)]
pub struct OutputManagerHandle {
    shared: Arc<Shared>,
}

impl OutputManagerHandle {
    pub fn in_queue(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.shared.in_queue.lock().unwrap())
    }

    /// Swap the input queue at a reconfiguration boundary. Blocks until the
    /// worker has drained the old queue and switched over.
    pub fn set_in_queue(&self, queue: Arc<RingBuffer>) -> Result<(), CollectorError> {
        {
            let current = self.shared.in_queue.lock().unwrap();
            if Arc::ptr_eq(&current, &queue) {
                return Ok(());
            }
        }

        if !self.shared.running.load(Ordering::SeqCst) {
            *self.shared.in_queue.lock().unwrap() = queue;
            return Ok(());
        }

        let mut staged = self.shared.staged_in.lock().unwrap();
        *staged = Some(Arc::clone(&queue));
        self.in_queue().write(None, 1)?;
        while staged.is_some() {
            staged = self.shared.swap_cond.wait(staged).unwrap();
        }
        Ok(())
    }

    /// Register a storage plugin and install it into existing data
    /// managers according to its ODID pin.
    pub fn add_storage(&self, descriptor: StorageDescriptor) -> Result<(), CollectorError> {
        {
            let mut catalogue = self.shared.catalogue.lock().unwrap();
            if catalogue.len() >= MAX_STORAGE_PLUGINS {
                return Err(CollectorError::ConfigInvalid(format!(
                    "storage plugin catalogue full ({MAX_STORAGE_PLUGINS})"
                )));
            }
            catalogue.push(descriptor.clone());
        }

        let mut managers = self.shared.managers.lock().unwrap();
        match descriptor.odid_filter {
            Some(odid) => {
                if let Some(dm) = managers.iter_mut().find(|dm| dm.odid() == odid) {
                    dm.add_plugin(&descriptor);
                }
            }
            None => {
                for dm in managers.iter_mut() {
                    dm.add_plugin(&descriptor);
                }
            }
        }
        Ok(())
    }

    /// Unregister storage plugin `id` and stop its instances everywhere.
    pub fn remove_storage(&self, id: u32) {
        let Some(descriptor) = ({
            let mut catalogue = self.shared.catalogue.lock().unwrap();
            catalogue
                .iter()
                .position(|d| d.id == id)
                .map(|index| catalogue.swap_remove(index))
        }) else {
            return;
        };

        let mut managers = self.shared.managers.lock().unwrap();
        match descriptor.odid_filter {
            Some(odid) => {
                if let Some(dm) = managers.iter_mut().find(|dm| dm.odid() == odid) {
                    dm.remove_plugin(id);
                }
            }
            None => {
                for dm in managers.iter_mut() {
                    dm.remove_plugin(id);
                }
            }
        }
        managers.retain(|dm| dm.plugin_count() > 0);
    }

    /// Switch between single- and multiple-data-manager mode; a mode change
    /// tears down every current data manager.
    pub fn set_single_manager(&self, single: bool) {
        let was = self.shared.single_manager.swap(single, Ordering::SeqCst);
        if was != single {
            info!(
                "switching to {} data manager mode",
                if single { "single" } else { "per-ODID" }
            );
            let mut managers = self.shared.managers.lock().unwrap();
            for dm in managers.drain(..) {
                dm.close();
            }
        }
    }

    pub fn single_manager(&self) -> bool {
        self.shared.single_manager.load(Ordering::Relaxed)
    }

    /// Sources seen by the dispatcher, for the statistics reporter.
    pub fn input_infos(&self) -> Arc<Mutex<Vec<Arc<InputInfo>>>> {
        Arc::clone(&self.shared.input_infos)
    }

    /// Data-manager queue depths `(odid, len, capacity)`.
    pub fn data_manager_depths(&self) -> Vec<(u32, usize, usize)> {
        self.shared
            .managers
            .lock()
            .unwrap()
            .iter()
            .map(|dm| {
                let (len, capacity) = dm.queue_depth();
                (dm.odid(), len, capacity)
            })
            .collect()
    }

    /// Number of live data managers, for tests and diagnostics.
    pub fn data_manager_count(&self) -> usize {
        self.shared.managers.lock().unwrap().len()
    }
}

/// The dispatcher itself; owned by the collector main.
pub struct OutputManager {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
    stats: Option<StatsReporter>,
}

impl OutputManager {
    pub fn new(
        templates: Arc<TemplateManager>,
        in_queue: Arc<RingBuffer>,
        ring_size: usize,
    ) -> OutputManager {
        OutputManager {
            shared: Arc::new(Shared {
                templates,
                ring_size,
                in_queue: Mutex::new(in_queue),
                staged_in: Mutex::new(None),
                swap_cond: Condvar::new(),
                catalogue: Mutex::new(Vec::new()),
                managers: Mutex::new(Vec::new()),
                input_infos: Arc::new(Mutex::new(Vec::new())),
                single_manager: AtomicBool::new(false),
                running: AtomicBool::new(false),
            }),
            worker: None,
            stats: None,
        }
    }

    pub fn handle(&self) -> OutputManagerHandle {
        OutputManagerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Start the dispatcher thread and, when configured, the statistics
    /// reporter.
    pub fn start(
        &mut self,
        stats: Option<StatsSettings>,
        queues: Arc<QueueDirectory>,
    ) -> Result<(), CollectorError> {
        let shared = Arc::clone(&self.shared);
        let worker = thread::Builder::new()
            .name("output manager".to_string())
            .spawn(move || shared.worker_loop())
            .map_err(|e| CollectorError::Fatal(format!("cannot spawn output manager: {e}")))?;
        self.worker = Some(worker);
        self.shared.running.store(true, Ordering::SeqCst);

        if let Some(settings) = stats.filter(|s| s.interval > 0) {
            let handle = self.handle();
            self.stats = Some(StatsReporter::spawn(
                settings,
                Arc::clone(&self.shared.input_infos),
                queues,
                Box::new(move || handle.data_manager_depths()),
            ));
        }
        Ok(())
    }

    /// Orderly shutdown: terminate the dispatcher with a sentinel, stop the
    /// statistics reporter and close every data manager.
    pub fn close(mut self) -> Result<(), CollectorError> {
        if let Some(worker) = self.worker.take() {
            let queue = self.handle().in_queue();
            queue.write(None, 1)?;
            worker
                .join()
                .map_err(|_| CollectorError::Fatal("output manager panicked".to_string()))?;
        }
        self.shared.running.store(false, Ordering::SeqCst);

        if let Some(stats) = self.stats.take() {
            stats.stop();
        }

        let mut managers = self.shared.managers.lock().unwrap();
        for dm in managers.drain(..) {
            dm.close();
        }
        Ok(())
    }
}
