//! The presentation document edited by voice.

pub mod editor;
pub mod generator;
pub mod store;

pub use editor::DeckEditor;
pub use generator::{DeckGenerator, GenerationError, ImageGenerator, SLIDE_COUNT};
pub use store::{DeckStore, StoreError};

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use strum::{Display, EnumIter, EnumString};

/// Closed set of slide layouts understood by the renderer
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString, EnumIter,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum SlideLayout {
    #[default]
    Title,
    Content,
    TwoColumn,
    ImageText,
    Quote,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Slide {
    pub layout: SlideLayout,
    pub title: String,
    pub subtitle: Option<String>,
    pub content: Vec<String>,
    pub image_prompt: Option<String>,
    /// Rendered image as a data URL
    pub image: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Source {
    pub title: String,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Presentation {
    pub title: String,
    pub slides: Vec<Slide>,
    #[serde(default)]
    pub current_slide: usize,
    #[serde(default)]
    pub sources: Vec<Source>,
}

impl Default for Presentation {
    fn default() -> Self {
        Self {
            title: "Untitled presentation".to_string(),
            slides: vec![Slide {
                layout: SlideLayout::Title,
                title: "Voice Deck".to_string(),
                subtitle: Some("Tell me what your presentation is about".to_string()),
                ..Slide::default()
            }],
            current_slide: 0,
            sources: Vec::new(),
        }
    }
}

/// Partial slide edit requested by the agent. Absent fields stay untouched.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct SlideUpdate {
    /// Target slide, defaults to the current one
    pub slide_index: Option<i64>,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub content: Option<Vec<String>>,
    pub layout: Option<SlideLayout>,
    pub image_prompt: Option<String>,
}

impl Presentation {
    pub fn current(&self) -> Option<&Slide> {
        self.slides.get(self.current_slide)
    }

    pub fn next_slide(&mut self) -> bool {
        self.go_to(self.current_slide + 1)
    }

    pub fn previous_slide(&mut self) -> bool {
        match self.current_slide.checked_sub(1) {
            Some(index) => self.go_to(index),
            None => false,
        }
    }

    /// Move to `index` if it exists
    pub fn go_to(&mut self, index: usize) -> bool {
        if index < self.slides.len() {
            self.current_slide = index;
            true
        } else {
            false
        }
    }

    /// Append citations, keeping the first entry for each URI.
    pub fn add_sources(&mut self, sources: impl IntoIterator<Item = Source>) {
        let mut seen: HashSet<String> = self.sources.iter().map(|s| s.uri.clone()).collect();
        for source in sources {
            if seen.insert(source.uri.clone()) {
                self.sources.push(source);
            }
        }
    }

    /// Resolve a requested slide index to one that exists.
    pub fn resolve_index(&self, requested: Option<i64>) -> usize {
        let last = self.slides.len().saturating_sub(1);
        match requested {
            Some(index) if index <= 0 => 0,
            Some(index) => (index as usize).min(last),
            None => self.current_slide.min(last),
        }
    }

    /// Apply `update` and return the index of the edited slide. A new image
    /// prompt clears the stale rendered image.
    pub fn apply_update(&mut self, update: &SlideUpdate) -> usize {
        if self.slides.is_empty() {
            self.slides.push(Slide::default());
        }
        let index = self.resolve_index(update.slide_index);
        let slide = &mut self.slides[index];

        if let Some(title) = &update.title {
            slide.title = title.clone();
        }
        if let Some(subtitle) = &update.subtitle {
            slide.subtitle = Some(subtitle.clone());
        }
        if let Some(content) = &update.content {
            slide.content = content.clone();
        }
        if let Some(layout) = update.layout {
            slide.layout = layout;
        }
        if let Some(prompt) = &update.image_prompt {
            if slide.image_prompt.as_deref() != Some(prompt.as_str()) {
                slide.image_prompt = Some(prompt.clone());
                slide.image = None;
            }
        }
        self.current_slide = index;
        index
    }

    /// Pad or truncate to exactly `slide_count` slides and repair the cursor
    /// and citation list.
    pub fn normalize(&mut self, slide_count: usize) {
        self.slides.truncate(slide_count);
        while self.slides.len() < slide_count {
            self.slides.push(Slide {
                layout: SlideLayout::Content,
                title: format!("{} ({})", self.title, self.slides.len() + 1),
                ..Slide::default()
            });
        }
        if self.current_slide >= self.slides.len() {
            self.current_slide = 0;
        }
        let sources = std::mem::take(&mut self.sources);
        self.add_sources(sources);
    }
}

impl fmt::Display for Slide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.layout, self.title)?;
        if let Some(subtitle) = &self.subtitle {
            write!(f, " - {}", subtitle)?;
        }
        for line in &self.content {
            write!(f, "\n  • {}", line)?;
        }
        Ok(())
    }
}
