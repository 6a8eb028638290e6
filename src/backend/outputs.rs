//! Output bookkeeping shared by the nested backends
//!
//! Both backends keep their outputs in creation order and queue [`BackendEvent`]s until the
//! event source hands them to the compositor. Queuing an event pings the event source so
//! events produced outside of dispatch (e.g. by [`schedule_frame`]) are delivered promptly.
//!
//! [`schedule_frame`]: crate::output::FrameScheduler::schedule_frame

use std::mem;

use calloop::ping::Ping;
use indexmap::IndexMap;
use tracing::{debug, trace};

use crate::backend::allocator::ImageId;
use crate::backend::BackendEvent;
use crate::output::{FrameScheduler, OutputId};

/// An output of a backend, driven by a [`FrameScheduler`]
pub(crate) trait BackendOutput {
    fn scheduler(&mut self) -> &mut FrameScheduler;
}

#[derive(Debug)]
pub(crate) struct Outputs<O> {
    outputs: IndexMap<OutputId, O>,
    events: Vec<BackendEvent>,
    ping: Ping,
    disconnected: bool,
}

impl<O: BackendOutput> Outputs<O> {
    pub fn new(ping: Ping) -> Self {
        Outputs {
            outputs: IndexMap::new(),
            events: Vec::new(),
            ping,
            disconnected: false,
        }
    }

    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }

    pub fn insert(&mut self, id: OutputId, output: O) {
        self.outputs.insert(id, output);
        self.queue(BackendEvent::NewOutput(id));
    }

    pub fn get(&self, id: &OutputId) -> Option<&O> {
        self.outputs.get(id)
    }

    pub fn get_mut(&mut self, id: &OutputId) -> Option<&mut O> {
        self.outputs.get_mut(id)
    }

    /// The first output matching `pred`
    pub fn find_mut(&mut self, mut pred: impl FnMut(&O) -> bool) -> Option<(OutputId, &mut O)> {
        self.outputs
            .iter_mut()
            .find(|(_, output)| pred(output))
            .map(|(id, output)| (*id, output))
    }

    /// Live outputs in creation order
    pub fn ids(&self) -> Vec<OutputId> {
        self.outputs.keys().copied().collect()
    }

    /// Moves the events of all schedulers into the backend queue
    pub fn collect_events(&mut self) {
        let mut queued = false;
        for (id, output) in self.outputs.iter_mut() {
            for event in output.scheduler().take_events() {
                self.events.push(BackendEvent::Output { output: *id, event });
                queued = true;
            }
        }
        if queued {
            self.ping.ping();
        }
    }

    /// Route a release of the display system to the output presenting the image
    ///
    /// Returns `false` if no output holds the image, e.g. because its output is gone.
    pub fn buffer_released(&mut self, image: ImageId) -> bool {
        let released = self
            .outputs
            .values_mut()
            .any(|output| output.scheduler().buffer_released(image));
        if released {
            self.collect_events();
        } else {
            trace!(%image, "Release of a buffer no output holds");
        }
        released
    }

    /// Remove an output, queuing the events of its teardown
    ///
    /// Returns `false` if the output does not exist.
    pub fn destroy(&mut self, id: OutputId, teardown: impl FnOnce(OutputId, O) -> FrameScheduler) -> bool {
        let Some(output) = self.outputs.shift_remove(&id) else {
            return false;
        };
        let mut scheduler = teardown(id, output);
        self.events.extend(
            scheduler
                .take_events()
                .into_iter()
                .map(|event| BackendEvent::Output { output: id, event }),
        );
        self.ping.ping();
        true
    }

    /// Destroy every output, then queue [`BackendEvent::Disconnected`]
    ///
    /// Only the first call has an effect.
    pub fn disconnect(&mut self, mut teardown: impl FnMut(OutputId, O) -> FrameScheduler) -> bool {
        if mem::replace(&mut self.disconnected, true) {
            return false;
        }
        debug!(outputs = self.outputs.len(), "Tearing down outputs of a lost connection");
        for id in self.ids() {
            self.destroy(id, &mut teardown);
        }
        self.queue(BackendEvent::Disconnected);
        true
    }

    pub fn take_events(&mut self) -> Vec<BackendEvent> {
        mem::take(&mut self.events)
    }

    fn queue(&mut self, event: BackendEvent) {
        self.events.push(event);
        self.ping.ping();
    }
}

#[cfg(test)]
mod tests {
    use calloop::ping::make_ping;

    use super::*;
    use crate::output::OutputEvent;
    use crate::test_utils::{fake_image, Counters, FakeSurface};

    #[derive(Debug, Default)]
    struct TestOutput {
        scheduler: FrameScheduler,
        surface: FakeSurface,
    }

    impl BackendOutput for TestOutput {
        fn scheduler(&mut self) -> &mut FrameScheduler {
            &mut self.scheduler
        }
    }

    impl TestOutput {
        fn present(&mut self, counters: &Counters) -> ImageId {
            let image = fake_image(counters, 8, 8);
            let id = image.id();
            self.scheduler.schedule_frame(&mut self.surface, image).unwrap();
            id
        }
    }

    fn teardown(_: OutputId, mut output: TestOutput) -> FrameScheduler {
        output.scheduler.destroy(&mut output.surface);
        output.scheduler
    }

    fn outputs() -> Outputs<TestOutput> {
        let (ping, _source) = make_ping().unwrap();
        Outputs::new(ping)
    }

    /// Flatten events into comparable tags
    fn summary(events: &[BackendEvent]) -> Vec<String> {
        events
            .iter()
            .map(|event| match event {
                BackendEvent::NewOutput(id) => format!("new {}", id),
                BackendEvent::Output { output, event } => match event {
                    OutputEvent::BufferReleased(image) => format!("{} released {}", output, image.id()),
                    OutputEvent::Destroyed => format!("{} destroyed", output),
                    OutputEvent::Frame => format!("{} frame", output),
                    OutputEvent::Mode(_) => format!("{} mode", output),
                },
                BackendEvent::Disconnected => "disconnected".into(),
            })
            .collect()
    }

    #[test]
    fn new_outputs_are_announced() {
        let mut outputs = outputs();
        let id = OutputId::next();
        outputs.insert(id, TestOutput::default());
        assert_eq!(summary(&outputs.take_events()), vec![format!("new {}", id)]);
        assert_eq!(outputs.ids(), vec![id]);
    }

    #[test]
    fn lost_connection_releases_everything_then_disconnects_once() {
        let counters = Counters::default();
        let mut outputs = outputs();

        let busy = OutputId::next();
        let mut output = TestOutput::default();
        let committed = output.present(&counters);
        let pending = output.present(&counters);
        outputs.insert(busy, output);

        let idle = OutputId::next();
        outputs.insert(idle, TestOutput::default());
        outputs.take_events();

        assert!(outputs.disconnect(teardown));
        assert_eq!(
            summary(&outputs.take_events()),
            vec![
                format!("{} released {}", busy, pending),
                format!("{} released {}", busy, committed),
                format!("{} destroyed", busy),
                format!("{} destroyed", idle),
                "disconnected".to_string(),
            ]
        );
        assert!(outputs.ids().is_empty());
        assert!(outputs.is_disconnected());

        assert!(!outputs.disconnect(teardown));
        assert!(outputs.take_events().is_empty());
    }

    #[test]
    fn releases_reach_the_presenting_output() {
        let counters = Counters::default();
        let mut outputs = outputs();

        let first = OutputId::next();
        outputs.insert(first, TestOutput::default());
        let second = OutputId::next();
        let mut output = TestOutput::default();
        let image = output.present(&counters);
        outputs.insert(second, output);
        outputs.take_events();

        assert!(outputs.buffer_released(image));
        assert_eq!(
            summary(&outputs.take_events()),
            vec![format!("{} released {}", second, image)]
        );
    }

    #[test]
    fn releases_of_unknown_images_are_dropped() {
        let counters = Counters::default();
        let mut outputs = outputs();
        let id = OutputId::next();
        let mut output = TestOutput::default();
        output.present(&counters);
        outputs.insert(id, output);
        outputs.take_events();

        let stranger = fake_image(&counters, 8, 8);
        assert!(!outputs.buffer_released(stranger.id()));
        assert!(outputs.take_events().is_empty());
    }

    #[test]
    fn late_release_after_destroy_is_dropped() {
        let counters = Counters::default();
        let mut outputs = outputs();
        let id = OutputId::next();
        let mut output = TestOutput::default();
        let image = output.present(&counters);
        outputs.insert(id, output);
        outputs.take_events();

        assert!(outputs.destroy(id, teardown));
        assert_eq!(
            summary(&outputs.take_events()),
            vec![format!("{} released {}", id, image), format!("{} destroyed", id)]
        );

        assert!(!outputs.buffer_released(image));
        assert!(!outputs.destroy(id, teardown));
        assert!(outputs.take_events().is_empty());
    }
}
