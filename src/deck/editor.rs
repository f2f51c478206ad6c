use super::{DeckGenerator, DeckStore, GenerationError, ImageGenerator, Presentation, SlideUpdate};
use std::sync::Arc;
use tokio::sync::watch;

/// Owns the live deck: applies generated decks and slide edits, persists
/// after every change and renders slide images in the background.
#[derive(Clone)]
pub struct DeckEditor {
    deck: Arc<watch::Sender<Presentation>>,
    store: DeckStore,
    generator: Arc<dyn DeckGenerator>,
    images: Arc<dyn ImageGenerator>,
}

impl DeckEditor {
    pub fn new(
        deck: Presentation,
        store: DeckStore,
        generator: Arc<dyn DeckGenerator>,
        images: Arc<dyn ImageGenerator>,
    ) -> Self {
        let (tx, _) = watch::channel(deck);
        Self {
            deck: Arc::new(tx),
            store,
            generator,
            images,
        }
    }

    pub fn snapshot(&self) -> Presentation {
        self.deck.borrow().clone()
    }

    /// Observe every change to the deck
    pub fn subscribe(&self) -> watch::Receiver<Presentation> {
        self.deck.subscribe()
    }

    /// Replace the deck with a freshly generated one, then fill in images.
    pub async fn generate(&self, topic: &str) -> Result<(), GenerationError> {
        let deck = self.generator.generate(topic).await?;
        log::info!(
            "Generated \"{}\" with {} slides and {} sources",
            deck.title,
            deck.slides.len(),
            deck.sources.len()
        );
        self.deck.send_replace(deck);
        self.persist();

        let prompts: Vec<(usize, String)> = self
            .deck
            .borrow()
            .slides
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.image_prompt.clone().map(|p| (i, p)))
            .collect();
        for (index, prompt) in prompts {
            self.render_image(index, &prompt).await;
        }
        Ok(())
    }

    /// Apply a partial edit and re-render the slide image if its prompt changed.
    pub async fn update_slide(&self, update: SlideUpdate) {
        let mut index = 0;
        self.deck.send_modify(|deck| index = deck.apply_update(&update));
        log::info!("Updated slide {}", index + 1);
        self.persist();

        let pending = {
            let deck = self.deck.borrow();
            let prompt = deck
                .slides
                .get(index)
                .filter(|s| s.image.is_none())
                .and_then(|s| s.image_prompt.clone());
            prompt
        };
        if let Some(prompt) = pending {
            self.render_image(index, &prompt).await;
        }
    }

    pub fn next_slide(&self) -> bool {
        self.navigate(|deck| deck.next_slide())
    }

    pub fn previous_slide(&self) -> bool {
        self.navigate(|deck| deck.previous_slide())
    }

    pub fn go_to(&self, index: usize) -> bool {
        self.navigate(|deck| deck.go_to(index))
    }

    fn navigate(&self, step: impl FnOnce(&mut Presentation) -> bool) -> bool {
        let moved = self.deck.send_if_modified(step);
        if moved {
            self.persist();
        }
        moved
    }

    async fn render_image(&self, index: usize, prompt: &str) {
        match self.images.render(prompt).await {
            Ok(image) => {
                // The slide may have been regenerated or re-prompted meanwhile
                let applied = self.deck.send_if_modified(|deck| match deck.slides.get_mut(index) {
                    Some(slide) if slide.image_prompt.as_deref() == Some(prompt) => {
                        slide.image = Some(image);
                        true
                    }
                    _ => false,
                });
                if applied {
                    self.persist();
                } else {
                    log::debug!("Discarding stale image for slide {}", index + 1);
                }
            }
            Err(e) => log::warn!("Image for slide {} failed: {}", index + 1, e),
        }
    }

    fn persist(&self) {
        let deck = self.snapshot();
        if let Err(e) = self.store.save(&deck) {
            log::error!("Failed to persist deck: {}", e);
        }
    }
}
