use super::media::MediaElement;
use crate::error::MediaError;
use tracing::debug;

/// Several independent preview players on one page, at most one audible.
///
/// Starting any member pauses every other member and rewinds it to zero.
pub struct PreviewGroup<M> {
    players: Vec<M>,
}

impl<M: MediaElement> PreviewGroup<M> {
    pub fn new() -> Self {
        Self {
            players: Vec::new(),
        }
    }

    pub fn add(&mut self, player: M) -> usize {
        self.players.push(player);
        self.players.len() - 1
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&M> {
        self.players.get(index)
    }

    pub fn play(&mut self, index: usize) -> Result<(), MediaError> {
        if index >= self.players.len() {
            return Err(MediaError::NoSource);
        }
        for (i, other) in self.players.iter_mut().enumerate() {
            if i != index {
                other.pause();
                other.set_current_time(0.0);
            }
        }
        debug!("Preview {} took the output", index);
        self.players[index].play()
    }

    pub fn pause(&mut self, index: usize) {
        if let Some(player) = self.players.get_mut(index) {
            player.pause();
        }
    }

    /// Index of the member currently producing audio, if any.
    pub fn playing(&self) -> Option<usize> {
        self.players.iter().position(|p| !p.is_paused())
    }
}

impl<M: MediaElement> Default for PreviewGroup<M> {
    fn default() -> Self {
        Self::new()
    }
}
