//! Waveform samples for the player.
//!
//! Uploaded mixes have real samples stored next to the rest of the instance
//! data. Channel videos have none, so the player gets a random placeholder
//! shape instead; nothing here analyses audio.

use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

pub const WAVEFORMS_FILE: &str = "waveforms.json";
pub const WAVEFORM_SAMPLES: usize = 100;

const SAMPLE_MIN: u32 = 20;
const SAMPLE_MAX: u32 = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Waveform {
    pub samples: Vec<u32>,
    #[serde(default)]
    pub duration: f64,
}

#[derive(Debug, Default)]
pub struct WaveformProvider {
    stored: HashMap<String, Waveform>,
}

impl WaveformProvider {
    /// Reads `waveforms.json` from the data root. A missing root or file means
    /// no stored waveforms; an unreadable file is logged and ignored.
    pub fn load(data_root: Option<&Path>) -> Self {
        let Some(root) = data_root else {
            return Self::default();
        };
        let path: PathBuf = root.join(WAVEFORMS_FILE);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(_) => return Self::default(),
        };
        let entries = match serde_json::from_str::<HashMap<String, Value>>(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "ignoring unreadable waveform file");
                return Self::default();
            }
        };

        let mut stored = HashMap::with_capacity(entries.len());
        for (id, entry) in entries {
            match serde_json::from_value::<Waveform>(entry) {
                Ok(waveform) => {
                    stored.insert(id, waveform);
                }
                Err(err) => warn!(%id, error = %err, "skipping malformed stored waveform"),
            }
        }
        info!(count = stored.len(), path = %path.display(), "loaded stored waveforms");
        Self { stored }
    }

    pub fn stored_count(&self) -> usize {
        self.stored.len()
    }

    pub fn waveform(&self, id: &str) -> Waveform {
        match self.stored.get(id) {
            Some(stored) => stored.clone(),
            None => Waveform {
                samples: placeholder_samples(),
                duration: 0.0,
            },
        }
    }
}

/// `WAVEFORM_SAMPLES` values in `[20, 100)`.
pub fn placeholder_samples() -> Vec<u32> {
    (0..WAVEFORM_SAMPLES)
        .map(|_| SAMPLE_MIN + OsRng.next_u32() % (SAMPLE_MAX - SAMPLE_MIN))
        .collect()
}
