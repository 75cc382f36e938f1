//! Thread-shared playback handle
//!
//! The audio callback and the control side share one [`Song`] behind a
//! single coarse lock. Every mix period and every mutation runs with the
//! lock held, so the two sides never see a half-updated voice. Length
//! queries copy the module handle out and walk it unlocked.

use std::sync::{Arc, Mutex, MutexGuard};

use nether_tracker::TrackerModule;
use tracing::warn;

use crate::config::MixerConfig;
use crate::song::{MidiSink, NoteCallback, Song, song_length_ms};

/// Cloneable handle to a shared [`Song`]
#[derive(Clone)]
pub struct Player {
    song: Arc<Mutex<Song>>,
}

impl std::fmt::Debug for Player {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Player").finish_non_exhaustive()
    }
}

impl Player {
    pub fn new(module: impl Into<Arc<TrackerModule>>, config: MixerConfig) -> Self {
        Self::from_song(Song::new(module, config))
    }

    pub fn from_song(song: Song) -> Self {
        Self {
            song: Arc::new(Mutex::new(song)),
        }
    }

    /// Hold the lock for the duration of the returned guard. A panic on
    /// another thread while it held the lock does not make the song
    /// unusable; the state is taken as it was left.
    pub fn lock(&self) -> MutexGuard<'_, Song> {
        match self.song.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                warn!("song lock poisoned, continuing with last state");
                poisoned.into_inner()
            }
        }
    }

    /// Run `f` with the song locked
    pub fn with<R>(&self, f: impl FnOnce(&mut Song) -> R) -> R {
        f(&mut self.lock())
    }

    /// Audio callback entry: fill `out` and return the frames rendered
    pub fn read(&self, out: &mut [u8]) -> usize {
        self.lock().read(out)
    }

    pub fn start(&self) {
        self.lock().start();
    }

    pub fn start_once(&self) {
        self.lock().start_once();
    }

    pub fn stop(&self) {
        self.lock().stop();
    }

    pub fn pause(&self) {
        self.lock().pause();
    }

    pub fn resume(&self) {
        self.lock().resume();
    }

    pub fn note_on(&self, channel: usize, note: u8, instrument: u32, volume: Option<u32>) -> bool {
        self.lock().note_on(channel, note, instrument, volume)
    }

    pub fn set_midi_sink(&self, sink: Option<MidiSink>) {
        self.lock().set_midi_sink(sink);
    }

    pub fn set_note_callback(&self, callback: Option<NoteCallback>) {
        self.lock().set_note_callback(callback);
    }

    /// Song length in milliseconds. Only the module handle is read under
    /// the lock; the walk itself runs unlocked.
    pub fn length_ms(&self) -> u64 {
        let (module, stop_at) = {
            let song = self.lock();
            (song.module_arc(), song.stop_at)
        };
        song_length_ms(&module, stop_at)
    }

    /// (order, row) currently playing
    pub fn position(&self) -> (u32, u32) {
        let song = self.lock();
        (song.current_order(), song.current_row())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nether_tracker::TrackerPattern;

    fn module() -> TrackerModule {
        let mut module = TrackerModule::default();
        module.orders = vec![0];
        module.set_pattern(0, TrackerPattern::empty(4));
        module
    }

    #[test]
    fn test_player_is_shared_between_threads() {
        let player = Player::new(module(), MixerConfig::default());
        player.start();
        let audio = player.clone();
        let rendered = std::thread::spawn(move || {
            let mut buf = vec![0u8; 4 * 882];
            audio.read(&mut buf)
        })
        .join()
        .unwrap();
        assert_eq!(rendered, 882, "one tick at tempo 125");
        assert_eq!(player.position(), (0, 0));
    }

    #[test]
    fn test_length_without_holding_lock() {
        let player = Player::new(module(), MixerConfig::default());
        let guard = player.lock();
        drop(guard);
        assert_eq!(player.length_ms(), 4 * 120);
        player.with(|song| song.set_stop_at(0, 2));
        assert_eq!(player.length_ms(), 2 * 120);
    }

    #[test]
    fn test_stopped_player_renders_nothing() {
        let player = Player::new(module(), MixerConfig::default());
        let mut buf = [0u8; 64];
        assert_eq!(player.read(&mut buf), 0);
        player.start();
        player.stop();
        assert_eq!(player.read(&mut buf), 0);
    }
}
