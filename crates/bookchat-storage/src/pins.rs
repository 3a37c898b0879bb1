//! Pinned messages, kept as `pins.json` on the main branch.

use std::collections::BTreeMap;
use std::sync::Arc;

use bookchat_core::{Clock, Message, Pin, ValidationError, validate_author};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::repo::{RepositoryDriver, WorkTreeSession};
use crate::store::BranchedMessageStore;

const PINS_FILE: &str = "pins.json";
const MAX_PIN_ID_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PinEntry {
    pinned_by: String,
    pinned_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PinFile {
    #[serde(default)]
    pins: BTreeMap<String, PinEntry>,
}

impl PinFile {
    fn load(session: &WorkTreeSession<'_>) -> StoreResult<Self> {
        match session.read_file(PINS_FILE)? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Self::default()),
        }
    }

    fn store(&self, session: &mut WorkTreeSession<'_>) -> StoreResult<()> {
        let mut json = serde_json::to_vec_pretty(self)?;
        json.push(b'\n');
        session.write_file(PINS_FILE, &json)?;
        Ok(())
    }

    fn into_pins(self) -> Vec<Pin> {
        let mut pins: Vec<Pin> = self
            .pins
            .into_iter()
            .map(|(message_id, e)| Pin {
                message_id,
                pinned_by: e.pinned_by,
                pinned_at: e.pinned_at,
            })
            .collect();
        pins.sort_by(|a, b| {
            b.pinned_at
                .cmp(&a.pinned_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        pins
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinOutcome {
    Pinned(Pin),
    AlreadyPinned(Pin),
}

impl PinOutcome {
    #[must_use]
    pub fn pin(&self) -> &Pin {
        match self {
            Self::Pinned(p) | Self::AlreadyPinned(p) => p,
        }
    }
}

pub struct PinBoard {
    driver: Arc<RepositoryDriver>,
    clock: Arc<dyn Clock>,
}

impl PinBoard {
    #[must_use]
    pub fn new(driver: Arc<RepositoryDriver>, clock: Arc<dyn Clock>) -> Self {
        Self { driver, clock }
    }

    /// Pins `message_id`. Pinning an already pinned id changes nothing and
    /// creates no commit.
    ///
    /// # Errors
    /// Invalid id or pinner name; repository errors.
    pub fn pin(&self, message_id: &str, by: &str) -> StoreResult<PinOutcome> {
        validate_pin_id(message_id)?;
        validate_author(by)?;
        let pinned_at = self.clock.now_utc();
        let main = self.driver.main_branch().to_string();
        self.driver.with_branch(&main, |session| -> StoreResult<PinOutcome> {
            let mut file = PinFile::load(session)?;
            if let Some(existing) = file.pins.get(message_id) {
                return Ok(PinOutcome::AlreadyPinned(Pin {
                    message_id: message_id.to_string(),
                    pinned_by: existing.pinned_by.clone(),
                    pinned_at: existing.pinned_at,
                }));
            }
            file.pins.insert(
                message_id.to_string(),
                PinEntry {
                    pinned_by: by.to_string(),
                    pinned_at,
                },
            );
            file.store(session)?;
            session.commit(&format!("pins: pin {message_id} by {by}"), Some(by))?;
            tracing::info!(message_id, by, "pinned message");
            Ok(PinOutcome::Pinned(Pin {
                message_id: message_id.to_string(),
                pinned_by: by.to_string(),
                pinned_at,
            }))
        })
    }

    /// Removes the pin on `message_id`. Returns whether one existed.
    ///
    /// # Errors
    /// Invalid id; repository errors.
    pub fn unpin(&self, message_id: &str) -> StoreResult<bool> {
        validate_pin_id(message_id)?;
        let main = self.driver.main_branch().to_string();
        self.driver.with_branch(&main, |session| -> StoreResult<bool> {
            let mut file = PinFile::load(session)?;
            if file.pins.remove(message_id).is_none() {
                return Ok(false);
            }
            file.store(session)?;
            session.commit(&format!("pins: unpin {message_id}"), None)?;
            tracing::info!(message_id, "unpinned message");
            Ok(true)
        })
    }

    /// Every pin, newest first.
    ///
    /// # Errors
    /// Repository errors or a corrupt pins file.
    pub fn list_pinned(&self) -> StoreResult<Vec<Pin>> {
        let file = match self.driver.read_file(self.driver.main_branch(), PINS_FILE)? {
            Some(bytes) => serde_json::from_slice::<PinFile>(&bytes)?,
            None => PinFile::default(),
        };
        Ok(file.into_pins())
    }

    /// Pins joined with their messages, newest pin first. Pins whose message
    /// is not present locally are left out.
    ///
    /// # Errors
    /// Repository errors other than a missing message.
    pub fn pinned_messages(&self, store: &BranchedMessageStore) -> StoreResult<Vec<(Pin, Message)>> {
        let mut out = Vec::new();
        for pin in self.list_pinned()? {
            match store.get_by_id(&pin.message_id) {
                Ok(message) => out.push((pin, message)),
                Err(StoreError::Validation(_)) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!(message_id = %pin.message_id, "pinned message not present");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn validate_pin_id(message_id: &str) -> Result<(), ValidationError> {
    if message_id.is_empty()
        || message_id.len() > MAX_PIN_ID_LEN
        || message_id.chars().any(|c| c.is_whitespace() || c.is_control())
    {
        return Err(ValidationError::InvalidMessageId(message_id.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bookchat_core::{ManualClock, RepoSettings};
    use std::time::Duration;
    use tempfile::TempDir;

    fn board(tmp: &TempDir) -> (PinBoard, Arc<ManualClock>) {
        let driver =
            Arc::new(RepositoryDriver::open_or_init(RepoSettings::for_root(tmp.path().join("r"))).unwrap());
        let clock = Arc::new(ManualClock::default());
        (PinBoard::new(driver, clock.clone()), clock)
    }

    #[test]
    fn pin_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let (board, clock) = board(&tmp);
        let first = board.pin("msg-1", "alice").unwrap();
        assert!(matches!(first, PinOutcome::Pinned(_)));
        clock.advance(Duration::from_secs(5));
        let second = board.pin("msg-1", "alice").unwrap();
        assert_eq!(second, PinOutcome::AlreadyPinned(first.pin().clone()));

        let pins = board.list_pinned().unwrap();
        assert_eq!(pins.len(), 1);
        assert_eq!(pins[0].message_id, "msg-1");
        assert_eq!(pins[0].pinned_by, "alice");
        // initial commit + one pin commit
        assert_eq!(board.driver.log("main", 10).unwrap().len(), 2);
    }

    #[test]
    fn unpin_and_ordering() {
        let tmp = TempDir::new().unwrap();
        let (board, clock) = board(&tmp);
        board.pin("a", "alice").unwrap();
        clock.advance(Duration::from_secs(1));
        board.pin("b", "bob").unwrap();
        let ids: Vec<_> = board
            .list_pinned()
            .unwrap()
            .into_iter()
            .map(|p| p.message_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);

        assert!(board.unpin("a").unwrap());
        assert!(!board.unpin("a").unwrap());
        assert_eq!(board.list_pinned().unwrap().len(), 1);
    }

    #[test]
    fn rejects_bad_ids_and_pinners() {
        let tmp = TempDir::new().unwrap();
        let (board, _) = board(&tmp);
        assert!(board.pin("", "alice").is_err());
        assert!(board.pin("two words", "alice").is_err());
        assert!(board.pin("m", "not valid!").is_err());
        assert!(board.list_pinned().unwrap().is_empty());
    }
}
