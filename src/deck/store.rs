use super::Presentation;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Failed to write deck: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize deck: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct SavedDeck {
    saved_at: DateTime<Utc>,
    deck: Presentation,
}

/// JSON file holding the current presentation between runs.
#[derive(Debug, Clone)]
pub struct DeckStore {
    path: PathBuf,
}

impl DeckStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the saved deck. Missing or unreadable files yield the default
    /// single-slide deck.
    pub fn load(&self) -> Presentation {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No saved deck at {}, starting fresh", self.path.display());
                return Presentation::default();
            }
            Err(e) => {
                log::warn!("Could not read {}: {}", self.path.display(), e);
                return Presentation::default();
            }
        };

        match serde_json::from_str::<SavedDeck>(&text) {
            Ok(saved) if !saved.deck.slides.is_empty() => {
                log::info!(
                    "Loaded \"{}\" ({} slides) saved at {}",
                    saved.deck.title,
                    saved.deck.slides.len(),
                    saved.saved_at.format("%Y-%m-%d %H:%M:%S")
                );
                let mut deck = saved.deck;
                if deck.current_slide >= deck.slides.len() {
                    deck.current_slide = 0;
                }
                deck
            }
            Ok(_) => {
                log::warn!("Saved deck has no slides, using default");
                Presentation::default()
            }
            Err(e) => {
                log::warn!("Ignoring malformed deck file {}: {}", self.path.display(), e);
                Presentation::default()
            }
        }
    }

    /// Write the deck atomically via a sibling temp file.
    pub fn save(&self, deck: &Presentation) -> Result<(), StoreError> {
        let saved = SavedDeck {
            saved_at: Utc::now(),
            deck: deck.clone(),
        };
        let json = serde_json::to_string_pretty(&saved)?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        log::debug!("Saved deck to {}", self.path.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deck::{Slide, SlideLayout};
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let store = DeckStore::new(dir.path().join("deck.json"));
        assert_eq!(store.load(), Presentation::default());
    }

    #[test]
    fn test_malformed_file_loads_default() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("deck.json");
        fs::write(&path, r#"{"saved_at": "yesterday", "deck": [1, 2, 3]}"#).unwrap();
        assert_eq!(DeckStore::new(&path).load(), Presentation::default());

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(DeckStore::new(&path).load(), Presentation::default());
    }

    #[test]
    fn test_save_then_load() {
        let dir = TempDir::new().unwrap();
        let store = DeckStore::new(dir.path().join("nested").join("deck.json"));
        let mut deck = Presentation::default();
        deck.title = "Mars".into();
        deck.slides.push(Slide {
            layout: SlideLayout::Quote,
            title: "Quote".into(),
            ..Slide::default()
        });
        deck.current_slide = 1;

        store.save(&deck).unwrap();
        assert_eq!(store.load(), deck);
        assert!(!dir.path().join("nested").join("deck.json.tmp").exists());
    }

    #[test]
    fn test_out_of_range_cursor_repaired() {
        let dir = TempDir::new().unwrap();
        let store = DeckStore::new(dir.path().join("deck.json"));
        let mut deck = Presentation::default();
        deck.current_slide = 9;
        store.save(&deck).unwrap();
        assert_eq!(store.load().current_slide, 0);
    }
}
