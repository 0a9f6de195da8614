//! Ordered traversal over the tracks of the current view.
//!
//! The queue is plain data plus transitions. It never calls back into the
//! player; the player asks it where to go and then plays that index.

use crate::track::Track;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};


#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatMode {
    #[default]
    Off,
    One,
    All,
}

impl RepeatMode {
    /// Repeat button order: off -> one -> all -> off.
    pub fn cycle(self) -> Self {
        match self {
            RepeatMode::Off => RepeatMode::One,
            RepeatMode::One => RepeatMode::All,
            RepeatMode::All => RepeatMode::Off,
        }
    }
}

/// What caused the queue to move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Advance {
    /// The current track finished; repeat-one holds the cursor.
    Ended,
    /// The user pressed next; repeat-one does not apply.
    Skip,
}

#[derive(Clone, Debug)]
struct ShuffleOrder {
    order: Vec<usize>,
    position: usize,
}

#[derive(Clone, Debug, Default)]
pub struct PlaybackQueue {
    tracks: Vec<Track>,
    cursor: Option<usize>,
    shuffle: Option<ShuffleOrder>,
    repeat: RepeatMode,
}

impl PlaybackQueue {
    pub fn new(tracks: Vec<Track>) -> Self {
        Self {
            tracks,
            ..Self::default()
        }
    }

    /// Rebuilds the queue for a new view. Cursor and shuffle order are dropped,
    /// the repeat setting is a player preference and survives.
    pub fn replace(&mut self, tracks: Vec<Track>) {
        *self = Self {
            tracks,
            repeat: self.repeat,
            ..Self::default()
        };
    }

    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Track> {
        self.tracks.get(index)
    }

    pub fn cursor(&self) -> Option<usize> {
        self.cursor
    }

    pub fn current(&self) -> Option<&Track> {
        self.cursor.and_then(|i| self.tracks.get(i))
    }

    pub fn repeat_mode(&self) -> RepeatMode {
        self.repeat
    }

    pub fn set_repeat_mode(&mut self, mode: RepeatMode) {
        self.repeat = mode;
    }

    pub fn cycle_repeat(&mut self) -> RepeatMode {
        self.repeat = self.repeat.cycle();
        self.repeat
    }

    pub fn is_shuffled(&self) -> bool {
        self.shuffle.is_some()
    }

    pub fn shuffle_order(&self) -> Option<&[usize]> {
        self.shuffle.as_ref().map(|s| s.order.as_slice())
    }

    /// Points the cursor at `index`. While shuffled, the shuffle position
    /// follows so that next/previous continue from the selected track.
    pub fn select(&mut self, index: usize) -> Option<usize> {
        if index >= self.tracks.len() {
            return None;
        }
        self.cursor = Some(index);
        if let Some(shuffle) = self.shuffle.as_mut() {
            if let Some(pos) = shuffle.order.iter().position(|&i| i == index) {
                shuffle.position = pos;
            }
        }
        Some(index)
    }

    /// Moves forward and returns the index to play.
    /// Off and all both wrap to the start.
    pub fn next(&mut self, advance: Advance) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }
        if advance == Advance::Ended && self.repeat == RepeatMode::One {
            if let Some(current) = self.cursor {
                return Some(current);
            }
        }

        let index = match self.shuffle.as_mut() {
            Some(shuffle) => {
                shuffle.position = (shuffle.position + 1) % shuffle.order.len();
                shuffle.order[shuffle.position]
            }
            None => match self.cursor {
                Some(current) => (current + 1) % len,
                None => 0,
            },
        };
        self.cursor = Some(index);
        Some(index)
    }

    /// Moves backward, wrapping to the last entry.
    pub fn previous(&mut self) -> Option<usize> {
        let len = self.tracks.len();
        if len == 0 {
            return None;
        }

        let index = match self.shuffle.as_mut() {
            Some(shuffle) => {
                let n = shuffle.order.len();
                shuffle.position = (shuffle.position + n - 1) % n;
                shuffle.order[shuffle.position]
            }
            None => match self.cursor {
                Some(current) => (current + len - 1) % len,
                None => len - 1,
            },
        };
        self.cursor = Some(index);
        Some(index)
    }

    /// Generates a fresh permutation and moves to its first entry.
    pub fn enable_shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        let mut order: Vec<usize> = (0..self.tracks.len()).collect();
        order.shuffle(rng);
        let first = order.first().copied();
        self.shuffle = Some(ShuffleOrder { order, position: 0 });
        if first.is_some() {
            self.cursor = first;
        }
        first
    }

    /// Back to the original order, starting over at the first track.
    pub fn disable_shuffle(&mut self) -> Option<usize> {
        self.shuffle = None;
        self.cursor = if self.tracks.is_empty() { None } else { Some(0) };
        self.cursor
    }

    pub fn toggle_shuffle<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        if self.is_shuffled() {
            self.disable_shuffle()
        } else {
            self.enable_shuffle(rng)
        }
    }
}
