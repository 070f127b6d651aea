//! # Configurator
//!
//! Applies a declarative pipeline description to the live process. On
//! reload it diffs the desired plugin lists against the running ones by
//! instance name and configuration equivalence: unchanged entries keep
//! running, changed entries are removed and re-added, and an intermediate
//! plugin whose position changed counts as removed-then-added so the chain
//! order always matches the document.
//!
//! Intermediate removal never loses messages: the stage is stopped, its
//! output queue drained, and only then is the downstream consumer rewired
//! to the stage's former input queue.

use crate::intermediate::IntermediateStage;
use crate::output_manager::OutputManagerHandle;
use crate::plugins;
use crate::preprocessor::Preprocessor;
use crate::ring_buffer::RingBuffer;
use crate::stats::QueueDirectory;
use crate::CollectorError;

use log::{info, warn};
use serde::Deserialize;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::JoinHandle;

/// One plugin instance in the startup document. `name` is the diff key;
/// `plugin` selects the registry factory; `options` is the plugin-private
/// blob, compared structurally on reload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PluginSpec {
    pub name: String,
    pub plugin: String,
    #[serde(default)]
    pub odid: Option<u32>,
    #[serde(default)]
    pub options: serde_yaml::Value,
}

/// The parsed startup document: ordered plugin lists per section, plus the
/// optional statistics-file target.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StartupConfig {
    #[serde(default)]
    pub inputs: Vec<PluginSpec>,
    #[serde(default)]
    pub intermediates: Vec<PluginSpec>,
    #[serde(default)]
    pub storages: Vec<PluginSpec>,
    #[serde(default)]
    pub statistics_file: Option<PathBuf>,
}

impl StartupConfig {
    pub fn from_file(path: &std::path::Path) -> Result<StartupConfig, CollectorError> {
        let text = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| CollectorError::ConfigInvalid(format!("{}: {e}", path.display())))
    }
}

struct RunningInput {
    spec: PluginSpec,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

struct RunningInter {
    spec: PluginSpec,
    stage: IntermediateStage,
}

struct RunningStorage {
    spec: PluginSpec,
    id: u32,
}

enum Section {
    Input,
    Inter,
    Storage,
}

/// The live pipeline mutator.
pub struct Configurator {
    startup_path: Option<PathBuf>,
    ring_size: usize,
    preprocessor: Arc<Mutex<Preprocessor>>,
    preprocessor_queue: Arc<RingBuffer>,
    output: OutputManagerHandle,
    queues: Arc<QueueDirectory>,
    terminating: Arc<AtomicBool>,
    /// Input threads hold this for reading around each packet; reload takes
    /// it for writing, quiescing ingest while the graph mutates.
    gate: Arc<RwLock<()>>,
    inputs: Vec<Option<RunningInput>>,
    inters: Vec<Option<RunningInter>>,
    storages: Vec<Option<RunningStorage>>,
    next_storage_id: u32,
}

impl Configurator {
    pub fn new(
        startup_path: Option<PathBuf>,
        ring_size: usize,
        preprocessor: Arc<Mutex<Preprocessor>>,
        output: OutputManagerHandle,
        queues: Arc<QueueDirectory>,
        terminating: Arc<AtomicBool>,
    ) -> Configurator {
        let preprocessor_queue = preprocessor.lock().unwrap().output_queue();
        Configurator {
            startup_path,
            ring_size,
            preprocessor,
            preprocessor_queue,
            output,
            queues,
            terminating,
            gate: Arc::new(RwLock::new(())),
            inputs: Vec::new(),
            inters: Vec::new(),
            storages: Vec::new(),
            next_storage_id: 0,
        }
    }

    /// Re-read the startup file and apply it. The live pipeline is left
    /// unchanged when the file cannot be parsed.
    pub fn reconf(&mut self) -> Result<(), CollectorError> {
        let Some(path) = self.startup_path.clone() else {
            return Err(CollectorError::ConfigInvalid(
                "no startup configuration path".to_string(),
            ));
        };
        let desired = StartupConfig::from_file(&path)?;
        self.apply(&desired)
    }

    /// Diff `desired` against the running pipeline and mutate the graph.
    pub fn apply(&mut self, desired: &StartupConfig) -> Result<(), CollectorError> {
        // Quiesce ingest: waits for in-flight packets to clear the
        // preprocessor, then blocks input threads at the gate.
        let gate = Arc::clone(&self.gate);
        let _quiesced = gate.write().unwrap();

        self.process_section(&desired.inputs, Section::Input);
        self.process_section(&desired.intermediates, Section::Inter);
        self.process_section(&desired.storages, Section::Storage);

        // Single-data-manager mode follows the surviving storage set.
        let single = self
            .storages
            .iter()
            .flatten()
            .any(|s| plugins::storage_requires_single_manager(&s.spec.plugin).unwrap_or(false));
        self.output.set_single_manager(single);

        self.refresh_queue_directory();
        Ok(())
    }

    fn process_section(&mut self, desired: &[PluginSpec], section: Section) {
        let mut new_specs: Vec<Option<PluginSpec>> = desired.iter().cloned().map(Some).collect();
        let old_len = match section {
            Section::Input => self.inputs.len(),
            Section::Inter => self.inters.len(),
            Section::Storage => self.storages.len(),
        };

        for i in 0..old_len {
            let Some(old_spec) = self.spec_at(&section, i) else {
                continue;
            };

            let mut found = false;
            for (j, slot) in new_specs.iter_mut().enumerate() {
                let Some(new_spec) = slot else { continue };
                if new_spec.name != old_spec.name {
                    continue;
                }

                if *new_spec == old_spec {
                    if matches!(section, Section::Inter) && i != j {
                        // Same stage, new position: rebuild it there.
                        self.remove_plugin(&section, i);
                    } else {
                        *slot = None;
                    }
                } else {
                    self.remove_plugin(&section, i);
                }
                found = true;
                break;
            }

            if !found {
                self.remove_plugin(&section, i);
            }
        }

        for (j, slot) in new_specs.into_iter().enumerate() {
            if let Some(spec) = slot {
                if let Err(e) = self.add_plugin(&section, spec, j) {
                    warn!("unable to start plugin at position {j}: {e}");
                }
            }
        }
    }

    fn spec_at(&self, section: &Section, index: usize) -> Option<PluginSpec> {
        match section {
            Section::Input => self.inputs.get(index)?.as_ref().map(|p| p.spec.clone()),
            Section::Inter => self.inters.get(index)?.as_ref().map(|p| p.spec.clone()),
            Section::Storage => self.storages.get(index)?.as_ref().map(|p| p.spec.clone()),
        }
    }

    fn remove_plugin(&mut self, section: &Section, index: usize) {
        match section {
            Section::Input => self.remove_input(index),
            Section::Inter => self.remove_inter(index),
            Section::Storage => self.remove_storage(index),
        }
    }

    fn add_plugin(
        &mut self,
        section: &Section,
        spec: PluginSpec,
        index: usize,
    ) -> Result<(), CollectorError> {
        match section {
            Section::Input => self.add_input(spec, index),
            Section::Inter => self.add_inter(spec, index),
            Section::Storage => self.add_storage(spec, index),
        }
    }

    fn slot<T>(list: &mut Vec<Option<T>>, index: usize) -> &mut Option<T> {
        if list.len() <= index {
            list.resize_with(index + 1, || None);
        }
        &mut list[index]
    }

    fn remove_input(&mut self, index: usize) {
        let Some(running) = self.inputs[index].take() else {
            return;
        };
        info!("closing input plugin {} ({})", index, running.spec.name);
        running.stop.store(true, Ordering::SeqCst);
        if running.thread.join().is_err() {
            warn!("input plugin {} panicked", running.spec.name);
        }
    }

    fn add_input(&mut self, spec: PluginSpec, index: usize) -> Result<(), CollectorError> {
        info!("opening input plugin: {}", spec.name);
        let plugin = plugins::create_input(&spec.plugin, &spec.options).map_err(|e| {
            CollectorError::PluginInitFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            }
        })?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let preprocessor = Arc::clone(&self.preprocessor);
            let gate = Arc::clone(&self.gate);
            let stop = Arc::clone(&stop);
            let terminating = Arc::clone(&self.terminating);
            let name = spec.name.clone();
            std::thread::Builder::new()
                .name(format!("in:{name}"))
                .spawn(move || input_loop(plugin, preprocessor, gate, stop, terminating, name))
                .map_err(|e| CollectorError::Fatal(format!("cannot spawn input thread: {e}")))?
        };

        *Self::slot(&mut self.inputs, index) = Some(RunningInput {
            spec,
            stop,
            thread,
        });
        Ok(())
    }

    /// First running stage after `index`, if any.
    fn next_running_inter(&mut self, index: usize) -> Option<&mut RunningInter> {
        self.inters
            .iter_mut()
            .skip(index + 1)
            .flatten()
            .next()
    }

    fn prev_out_queue(&self, index: usize) -> Arc<RingBuffer> {
        self.inters[..index.min(self.inters.len())]
            .iter()
            .rev()
            .flatten()
            .next()
            .map(|p| p.stage.out_queue())
            .unwrap_or_else(|| Arc::clone(&self.preprocessor_queue))
    }

    fn remove_inter(&mut self, index: usize) {
        let Some(mut running) = self.inters[index].take() else {
            return;
        };
        info!("closing intermediate plugin {} ({})", index, running.spec.name);

        if let Err(e) = running.stage.stop() {
            warn!("unable to stop stage {}: {e}", running.spec.name);
        }
        let in_queue = running.stage.in_queue();
        let out_queue = running.stage.out_queue();

        // Let the downstream consumer finish the stage's output first.
        out_queue.wait_empty();

        let rewired = match self.next_running_inter(index) {
            Some(next) => next.stage.change_in_queue(in_queue),
            None => self.output.set_in_queue(in_queue),
        };
        if let Err(e) = rewired {
            warn!("rewiring after removal of {} failed: {e}", running.spec.name);
        }

        if let Err(e) = running.stage.close() {
            warn!("closing stage {} failed: {e}", running.spec.name);
        }
        drop(out_queue);
    }

    fn add_inter(&mut self, spec: PluginSpec, index: usize) -> Result<(), CollectorError> {
        info!("opening intermediate plugin: {}", spec.name);
        let plugin = plugins::create_intermediate(&spec.plugin, &spec.options).map_err(|e| {
            CollectorError::PluginInitFailed {
                name: spec.name.clone(),
                reason: e.to_string(),
            }
        })?;

        let out_queue = RingBuffer::new(self.ring_size)?;
        let in_queue = self.prev_out_queue(index);

        // Patch the downstream consumer to read from the new stage.
        let backup = match self.next_running_inter(index) {
            Some(next) => {
                let backup = next.stage.in_queue();
                next.stage.change_in_queue(Arc::clone(&out_queue))?;
                Some(backup)
            }
            None => {
                let backup = self.output.in_queue();
                self.output.set_in_queue(Arc::clone(&out_queue))?;
                Some(backup)
            }
        };

        let mut stage =
            IntermediateStage::new(spec.name.clone(), plugin, in_queue, Arc::clone(&out_queue));
        if let Err(e) = stage.start() {
            // Restore the previous wiring.
            if let Some(backup) = backup {
                match self.next_running_inter(index) {
                    Some(next) => next.stage.change_in_queue(backup)?,
                    None => self.output.set_in_queue(backup)?,
                }
            }
            return Err(e);
        }

        *Self::slot(&mut self.inters, index) = Some(RunningInter { spec, stage });
        Ok(())
    }

    fn remove_storage(&mut self, index: usize) {
        let Some(running) = self.storages[index].take() else {
            return;
        };
        info!("closing storage plugin {} ({})", index, running.spec.name);
        self.output.remove_storage(running.id);
    }

    fn add_storage(&mut self, spec: PluginSpec, index: usize) -> Result<(), CollectorError> {
        info!("opening storage plugin: {}", spec.name);
        let factory = plugins::storage_factory(&spec.plugin, &spec.options)?;
        let require_single = plugins::storage_requires_single_manager(&spec.plugin)?;

        let id = self.next_storage_id;
        self.next_storage_id += 1;

        self.output.add_storage(crate::data_manager::StorageDescriptor {
            id,
            name: spec.name.clone(),
            odid_filter: spec.odid,
            require_single_manager: require_single,
            factory,
        })?;

        *Self::slot(&mut self.storages, index) = Some(RunningStorage { spec, id });
        Ok(())
    }

    fn refresh_queue_directory(&self) {
        let mut entries = vec![(
            "preprocessor output".to_string(),
            Arc::clone(&self.preprocessor_queue),
        )];
        for running in self.inters.iter().flatten() {
            entries.push((
                format!("stage {} output", running.stage.name()),
                running.stage.out_queue(),
            ));
        }
        self.queues.set(entries);
    }

    /// Running stage names in chain order, for tests and diagnostics.
    pub fn stage_names(&self) -> Vec<String> {
        self.inters
            .iter()
            .flatten()
            .map(|p| p.stage.name().to_string())
            .collect()
    }

    /// Orderly teardown of inputs and stages; pending messages drain into
    /// the output manager, which the caller closes afterwards.
    pub fn shutdown(mut self) {
        for index in 0..self.inputs.len() {
            self.remove_input(index);
        }
        for running in self.inters.iter_mut().flatten() {
            if let Err(e) = running.stage.stop() {
                warn!("unable to stop stage {}: {e}", running.spec.name);
            }
        }
        for running in std::mem::take(&mut self.inters).into_iter().flatten() {
            if let Err(e) = running.stage.close() {
                warn!("closing stage {} failed: {e}", running.spec.name);
            }
        }
    }
}

fn input_loop(
    mut plugin: Box<dyn plugins::InputPlugin>,
    preprocessor: Arc<Mutex<Preprocessor>>,
    gate: Arc<RwLock<()>>,
    stop: Arc<AtomicBool>,
    terminating: Arc<AtomicBool>,
    name: String,
) {
    use crate::input::{PacketRead, SourceStatus};

    loop {
        if stop.load(Ordering::SeqCst) || terminating.load(Ordering::SeqCst) {
            break;
        }

        let _ingest = gate.read().unwrap();
        match plugin.get_packet() {
            Ok(PacketRead::Packet { buf, info, status }) => {
                if let Err(e) = preprocessor
                    .lock()
                    .unwrap()
                    .process_packet(buf, info, status)
                {
                    warn!("input {name}: dropped packet: {e}");
                }
            }
            Ok(PacketRead::SourceClosed(info)) => {
                preprocessor
                    .lock()
                    .unwrap()
                    .process_packet(Vec::new(), info, SourceStatus::Closed)
                    .ok();
            }
            Ok(PacketRead::Interrupted) => continue,
            Ok(PacketRead::EndOfInput) => {
                info!("input {name}: end of input; initiating shutdown");
                terminating.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => {
                warn!("input {name}: could not get data: {e}");
            }
        }
    }
    plugin.close();
}
