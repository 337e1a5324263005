use distiller_types::{TraceEntry, TraceRole};

/// Append-only, timestamped log of a job's user, assistant and system
/// entries. Only a reset (Stop or a new Start) empties it.
#[derive(Debug, Clone, Default)]
pub struct TraceRecorder {
    entries: Vec<TraceEntry>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, role: TraceRole, content: impl Into<String>) -> &TraceEntry {
        let mut entry = TraceEntry::new(role, content);
        // Keep timestamps monotonic even if the wall clock steps back.
        if let Some(last) = self.entries.last() {
            if entry.timestamp < last.timestamp {
                entry.timestamp = last.timestamp;
            }
        }
        self.entries.push(entry);
        &self.entries[self.entries.len() - 1]
    }

    pub fn user(&mut self, content: impl Into<String>) -> &TraceEntry {
        self.record(TraceRole::User, content)
    }

    pub fn assistant(&mut self, content: impl Into<String>) -> &TraceEntry {
        self.record(TraceRole::Assistant, content)
    }

    pub fn system(&mut self, content: impl Into<String>) -> &TraceEntry {
        self.record(TraceRole::System, content)
    }

    pub fn entries(&self) -> &[TraceEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}
