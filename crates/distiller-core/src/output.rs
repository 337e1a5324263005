use distiller_types::END_OF_BOOK_MARKER;

/// Separator placed between turns in the exported document.
pub const DOCUMENT_SEPARATOR: &str = "\n\n";

/// The document produced so far: immutable finalized turns plus at most one
/// turn that is still streaming.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    turns: Vec<String>,
    in_flight: Option<String>,
}

impl OutputLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a fresh entry, dropping whatever a previous attempt streamed.
    pub fn begin_turn(&mut self) {
        self.in_flight = Some(String::new());
    }

    /// Returns false when no turn is open.
    pub fn append(&mut self, chunk: &str) -> bool {
        match self.in_flight.as_mut() {
            Some(current) => {
                current.push_str(chunk);
                true
            }
            None => false,
        }
    }

    /// Seals the open turn with its final content and returns its 1-based
    /// index.
    pub fn finalize(&mut self, content: String) -> usize {
        self.in_flight = None;
        self.turns.push(content);
        self.turns.len()
    }

    pub fn discard_in_flight(&mut self) -> Option<String> {
        self.in_flight.take()
    }

    pub fn turns(&self) -> &[String] {
        &self.turns
    }

    pub fn in_flight(&self) -> Option<&str> {
        self.in_flight.as_deref()
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Finalized turns joined for export. Blank turns (a reply that was only
    /// the end-of-book marker) add no separator.
    pub fn document(&self) -> String {
        self.turns
            .iter()
            .map(String::as_str)
            .filter(|turn| !turn.trim().is_empty())
            .collect::<Vec<_>>()
            .join(DOCUMENT_SEPARATOR)
    }
}

/// Removes every occurrence of the end-of-book marker and trims the rest.
/// Returns the cleaned text and whether the marker was present.
pub fn strip_end_marker(text: &str) -> (String, bool) {
    if !text.contains(END_OF_BOOK_MARKER) {
        return (text.trim().to_string(), false);
    }
    (text.replace(END_OF_BOOK_MARKER, "").trim().to_string(), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_turn_replaces_partial_attempt() {
        let mut log = OutputLog::new();
        log.begin_turn();
        assert!(log.append("partial fail"));
        log.begin_turn();
        log.append("good");
        assert_eq!(log.in_flight(), Some("good"));
        assert_eq!(log.finalize("good".to_string()), 1);
        assert!(log.in_flight().is_none());
        assert!(!log.append("late"));
    }

    #[test]
    fn document_joins_only_finalized_turns() {
        let mut log = OutputLog::new();
        log.finalize("one".to_string());
        log.finalize("two".to_string());
        log.begin_turn();
        log.append("three in progress");
        assert_eq!(log.document(), "one\n\ntwo");
        assert_eq!(log.discard_in_flight().as_deref(), Some("three in progress"));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn blank_final_turn_counts_but_is_not_exported() {
        let mut log = OutputLog::new();
        log.finalize("one".to_string());
        log.begin_turn();
        let (cleaned, found) = strip_end_marker("<end_of_book>");
        assert!(found);
        assert_eq!(log.finalize(cleaned), 2);
        assert_eq!(log.turns().to_vec(), vec!["one".to_string(), String::new()]);
        assert_eq!(log.document(), "one");
    }

    #[test]
    fn marker_is_stripped_wherever_it_appears() {
        for text in [
            "Final words.\n\n<end_of_book>",
            "<end_of_book> Final words.",
            "Final <end_of_book>words.",
        ] {
            let (cleaned, found) = strip_end_marker(text);
            assert!(found);
            assert!(!cleaned.contains(END_OF_BOOK_MARKER));
            assert_eq!(cleaned, text.replace(END_OF_BOOK_MARKER, "").trim());
        }
        assert_eq!(strip_end_marker("<end_of_book>"), (String::new(), true));
        assert_eq!(strip_end_marker(" plain "), ("plain".to_string(), false));
    }

    #[test]
    fn stripping_twice_is_stable() {
        let (once, _) = strip_end_marker("A <end_of_book> B <end_of_book>");
        let (twice, found) = strip_end_marker(&once);
        assert_eq!(once, twice);
        assert!(!found);
    }
}
