use std::sync::{Arc, Mutex};

use crate::host::{HostInput, HostOutput, OutputType, PromptContext};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
    Output { text: String, output_type: OutputType },
    StartCommandLoop,
    StopCommandLoop,
    History(String),
    ForceEventHandling,
    AbortReadLine,
}

/// Ordered log shared by the recording host pieces.
#[derive(Debug, Clone, Default)]
pub struct HostLog(Arc<Mutex<Vec<HostEvent>>>);

impl HostLog {
    fn push(&self, event: HostEvent) {
        self.0.lock().expect("host log poisoned").push(event);
    }

    pub fn events(&self) -> Vec<HostEvent> {
        self.0.lock().expect("host log poisoned").clone()
    }

    pub fn outputs(&self, output_type: OutputType) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::Output {
                    text,
                    output_type: ty,
                } if ty == output_type => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn history(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                HostEvent::History(entry) => Some(entry),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, event: &HostEvent) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

/// Console stand-in that records output and command loop transitions.
#[derive(Debug, Clone, Default)]
pub struct RecordingHost {
    log: HostLog,
}

impl RecordingHost {
    pub fn new(log: HostLog) -> Arc<Self> {
        Arc::new(Self { log })
    }
}

impl HostOutput for RecordingHost {
    fn write_output(&self, text: &str, _include_newline: bool, output_type: OutputType) {
        self.log.push(HostEvent::Output {
            text: text.to_string(),
            output_type,
        });
    }
}

impl HostInput for RecordingHost {
    fn start_command_loop(&self) {
        self.log.push(HostEvent::StartCommandLoop);
    }

    fn stop_command_loop(&self) {
        self.log.push(HostEvent::StopCommandLoop);
    }
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPromptContext {
    log: HostLog,
    supports_eventing: bool,
}

impl RecordingPromptContext {
    pub fn new(log: HostLog, supports_eventing: bool) -> Arc<Self> {
        Arc::new(Self {
            log,
            supports_eventing,
        })
    }
}

impl PromptContext for RecordingPromptContext {
    fn add_to_history(&self, command: &str) {
        self.log.push(HostEvent::History(command.to_string()));
    }

    fn force_event_handling(&self) {
        self.log.push(HostEvent::ForceEventHandling);
    }

    fn supports_eventing(&self) -> bool {
        self.supports_eventing
    }

    fn abort_read_line(&self) {
        self.log.push(HostEvent::AbortReadLine);
    }
}
