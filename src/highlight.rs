//! Selection to highlight translation.
//!
//! The host renderer receives explicit [`HighlightEvent`]s instead of sharing selection
//! state with the inspector. At most one range is active at a time.

use std::sync::mpsc::Sender;

use crate::tree::ParseNode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HighlightEvent {
    /// Highlight the absolute byte range `[start, end)`.
    Range { start: u64, end: u64 },
    Clear,
}

/// Receiver of highlight events (a renderer, a channel, a test probe).
pub trait HighlightSink {
    fn emit(&mut self, event: HighlightEvent);
}

impl<F: FnMut(HighlightEvent)> HighlightSink for F {
    fn emit(&mut self, event: HighlightEvent) {
        self(event)
    }
}

impl HighlightSink for Sender<HighlightEvent> {
    fn emit(&mut self, event: HighlightEvent) {
        // A closed receiver means nobody renders highlights any more.
        let _ = self.send(event);
    }
}

#[derive(Debug)]
pub struct HighlightBridge<S> {
    sink: S,
    active: Option<(u64, u64)>,
}

impl<S: HighlightSink> HighlightBridge<S> {
    pub fn new(sink: S) -> Self {
        HighlightBridge { sink, active: None }
    }

    /// Highlight the node's range, or clear when it has none.
    pub fn on_node_selected(&mut self, node: &ParseNode) -> HighlightEvent {
        let event = match node.range() {
            Some((start, end)) => {
                self.active = Some((start, end));
                HighlightEvent::Range { start, end }
            }
            None => {
                self.active = None;
                HighlightEvent::Clear
            }
        };
        self.sink.emit(event);
        event
    }

    pub fn on_selection_cleared(&mut self) {
        self.active = None;
        self.sink.emit(HighlightEvent::Clear);
    }

    pub fn active(&self) -> Option<(u64, u64)> {
        self.active
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn into_sink(self) -> S {
        self.sink
    }
}
