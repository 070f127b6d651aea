//! # Intermediate stage runtime
//!
//! Each configured intermediate plugin runs on a dedicated worker thread:
//! read one message from the input queue, release the queue slot (ownership
//! of the shared message passes to the plugin), invoke the plugin, which
//! must either pass the message downstream or drop it. A `None` sentinel
//! terminates the worker.
//!
//! Reconfiguration rewires stages by stopping a worker (sentinel + join),
//! switching its input queue and restarting it; the plugin state survives
//! across the restart. Writers are quiescent during reconfiguration, so the
//! sentinel is always the last slot the stopping worker observes.

use crate::message::IpfixMessage;
use crate::plugins::IntermediatePlugin;
use crate::ring_buffer::{ReadCursor, RingBuffer};
use crate::CollectorError;

use log::{debug, warn};

use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Callbacks the runtime hands to a plugin's `process_message`. A plugin
/// must call exactly one of [`StageHandle::pass_message`] or
/// [`StageHandle::drop_message`] per input message and never touches the
/// queues directly.
pub struct StageHandle {
    out_queue: Arc<RingBuffer>,
}

impl StageHandle {
    /// Handle writing into `out_queue`, for driving a plugin without a
    /// worker thread (tests, embedders).
    pub fn for_queue(out_queue: Arc<RingBuffer>) -> StageHandle {
        StageHandle { out_queue }
    }

    /// Forward `msg` to the next stage.
    pub fn pass_message(&self, msg: Arc<IpfixMessage>) -> Result<(), CollectorError> {
        self.out_queue.write(Some(msg), 1)
    }

    /// Discard `msg`; the backing allocation is freed once the last
    /// reference is gone.
    pub fn drop_message(&self, msg: Arc<IpfixMessage>) {
        drop(msg);
    }
}

/// One running (or stopped) pipeline stage.
pub struct IntermediateStage {
    name: String,
    in_queue: Arc<RingBuffer>,
    out_queue: Arc<RingBuffer>,
    worker: Option<JoinHandle<Box<dyn IntermediatePlugin>>>,
    idle_plugin: Option<Box<dyn IntermediatePlugin>>,
}

impl IntermediateStage {
    /// Create a stopped stage; call [`IntermediateStage::start`] to run it.
    pub fn new(
        name: impl Into<String>,
        plugin: Box<dyn IntermediatePlugin>,
        in_queue: Arc<RingBuffer>,
        out_queue: Arc<RingBuffer>,
    ) -> Self {
        IntermediateStage {
            name: name.into(),
            in_queue,
            out_queue,
            worker: None,
            idle_plugin: Some(plugin),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn in_queue(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.in_queue)
    }

    pub fn out_queue(&self) -> Arc<RingBuffer> {
        Arc::clone(&self.out_queue)
    }

    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// Spawn the worker thread.
    pub fn start(&mut self) -> Result<(), CollectorError> {
        let plugin = self.idle_plugin.take().ok_or_else(|| {
            CollectorError::Fatal(format!("stage {} started twice", self.name))
        })?;
        let in_queue = Arc::clone(&self.in_queue);
        let handle = StageHandle {
            out_queue: Arc::clone(&self.out_queue),
        };
        let name = self.name.clone();

        let worker = thread::Builder::new()
            .name(format!("med:{name}"))
            .spawn(move || stage_loop(name, plugin, in_queue, handle))
            .map_err(|e| CollectorError::Fatal(format!("cannot spawn stage thread: {e}")))?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Terminate the worker: enqueue a sentinel on the input queue, join,
    /// and keep the plugin state for a later restart.
    pub fn stop(&mut self) -> Result<(), CollectorError> {
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        self.in_queue.write(None, 1)?;
        let plugin = worker
            .join()
            .map_err(|_| CollectorError::Fatal(format!("stage {} panicked", self.name)))?;
        self.idle_plugin = Some(plugin);
        Ok(())
    }

    /// Rewire the stage to read from `in_queue`, restarting the worker if
    /// it was running.
    pub fn change_in_queue(&mut self, in_queue: Arc<RingBuffer>) -> Result<(), CollectorError> {
        let was_running = self.is_running();
        self.stop()?;
        self.in_queue = in_queue;
        if was_running {
            self.start()?;
        }
        Ok(())
    }

    /// Stop the worker and release the plugin.
    pub fn close(mut self) -> Result<(), CollectorError> {
        self.stop()?;
        if let Some(mut plugin) = self.idle_plugin.take() {
            plugin.close();
        }
        Ok(())
    }
}

fn stage_loop(
    name: String,
    mut plugin: Box<dyn IntermediatePlugin>,
    in_queue: Arc<RingBuffer>,
    handle: StageHandle,
) -> Box<dyn IntermediatePlugin> {
    let mut cursor = ReadCursor::new();
    loop {
        let msg = in_queue.read(&mut cursor);
        if let Err(e) = in_queue.release(&mut cursor) {
            warn!("stage {name}: queue release failed: {e}");
        }

        let Some(msg) = msg else {
            debug!("stage {name}: terminating on sentinel");
            break;
        };

        if let Err(e) = plugin.process_message(msg, &handle) {
            warn!("stage {name}: plugin failed to process message: {e}");
        }
    }
    plugin
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::{InputInfo, SourceStatus, Transport};

    struct EvenOdidFilter;

    impl IntermediatePlugin for EvenOdidFilter {
        fn process_message(
            &mut self,
            msg: Arc<IpfixMessage>,
            stage: &StageHandle,
        ) -> Result<(), CollectorError> {
            if msg.odid() % 2 == 0 {
                stage.pass_message(msg)
            } else {
                stage.drop_message(msg);
                Ok(())
            }
        }
    }

    fn message(odid: u32) -> Arc<IpfixMessage> {
        let info = Arc::new(InputInfo::network(
            Transport::Udp,
            "127.0.0.1:4739".parse().unwrap(),
        ));
        info.odid.store(odid, std::sync::atomic::Ordering::Relaxed);
        Arc::new(IpfixMessage::source_event(info, SourceStatus::Opened))
    }

    #[test]
    fn stage_filters_and_forwards() {
        let in_queue = RingBuffer::new(8).unwrap();
        let out_queue = RingBuffer::new(8).unwrap();
        let mut stage = IntermediateStage::new(
            "filter",
            Box::new(EvenOdidFilter),
            Arc::clone(&in_queue),
            Arc::clone(&out_queue),
        );
        stage.start().unwrap();

        for odid in 0..6 {
            in_queue.write(Some(message(odid)), 1).unwrap();
        }
        stage.stop().unwrap();

        let mut cursor = ReadCursor::new();
        let mut seen = Vec::new();
        while !out_queue.is_empty() {
            let msg = out_queue.read(&mut cursor).unwrap();
            seen.push(msg.odid());
            out_queue.release(&mut cursor).unwrap();
        }
        assert_eq!(seen, vec![0, 2, 4]);
        stage.close().unwrap();
    }

    #[test]
    fn stage_survives_an_input_rewire() {
        let first = RingBuffer::new(8).unwrap();
        let second = RingBuffer::new(8).unwrap();
        let out_queue = RingBuffer::new(8).unwrap();
        let mut stage = IntermediateStage::new(
            "filter",
            Box::new(EvenOdidFilter),
            Arc::clone(&first),
            Arc::clone(&out_queue),
        );
        stage.start().unwrap();

        first.write(Some(message(2)), 1).unwrap();
        stage.change_in_queue(Arc::clone(&second)).unwrap();
        assert!(stage.is_running());
        second.write(Some(message(4)), 1).unwrap();
        stage.stop().unwrap();

        let mut cursor = ReadCursor::new();
        let mut seen = Vec::new();
        while !out_queue.is_empty() {
            let msg = out_queue.read(&mut cursor).unwrap();
            seen.push(msg.odid());
            out_queue.release(&mut cursor).unwrap();
        }
        assert_eq!(seen, vec![2, 4]);
        stage.close().unwrap();
    }
}
