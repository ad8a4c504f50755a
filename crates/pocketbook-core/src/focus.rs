//! Input focus probe
//!
//! Push ticks are skipped while the user is typing into a field.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Reports whether a text-entry field currently has focus
pub trait InputFocus: Send + Sync {
    fn is_text_entry_focused(&self) -> bool;
}

/// Host without text entry (headless)
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFocus;

impl InputFocus for NoFocus {
    fn is_text_entry_focused(&self) -> bool {
        false
    }
}

/// Focus signalled by a marker file that editors create while editing
#[derive(Debug, Clone)]
pub struct EditMarkerFocus {
    path: PathBuf,
}

impl EditMarkerFocus {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl InputFocus for EditMarkerFocus {
    fn is_text_entry_focused(&self) -> bool {
        self.path.exists()
    }
}

impl InputFocus for Arc<AtomicBool> {
    fn is_text_entry_focused(&self) -> bool {
        self.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_edit_marker() {
        let temp_dir = TempDir::new().unwrap();
        let marker = temp_dir.path().join("editing");
        let focus = EditMarkerFocus::new(marker.clone());

        assert!(!focus.is_text_entry_focused());
        std::fs::write(&marker, "").unwrap();
        assert!(focus.is_text_entry_focused());
    }

    #[test]
    fn test_shared_flag() {
        let flag = Arc::new(AtomicBool::new(false));
        assert!(!flag.is_text_entry_focused());
        flag.store(true, Ordering::SeqCst);
        assert!(flag.is_text_entry_focused());
        assert!(!NoFocus.is_text_entry_focused());
    }
}
