// src/worker/store.rs

//! Worker-local object storage.
//!
//! Objects live in memory until the resident total passes the spill
//! threshold; then the largest in-memory objects are written to
//! `<work_dir>/data` until the total is back under it. Concurrent pulls of
//! the same object share one transfer.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{debug, warn};

use crate::errors::{GovernorError, Result};
use crate::protocol::DataSource;
use crate::types::ObjectId;
use crate::worker::data_server;

#[derive(Debug)]
enum Slot {
    Memory(Bytes),
    Spilled { path: PathBuf, size: u64 },
}

impl Slot {
    fn size(&self) -> u64 {
        match self {
            Slot::Memory(bytes) => bytes.len() as u64,
            Slot::Spilled { size, .. } => *size,
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    objects: HashMap<ObjectId, Slot>,
    memory_used: u64,
}

/// Result of storing one object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stored {
    pub size: u64,
    /// Objects moved to disk to make room, possibly including the new one.
    pub spilled: Vec<ObjectId>,
}

type Inflight = HashMap<ObjectId, Arc<OnceCell<Option<Bytes>>>>;

#[derive(Debug)]
pub struct LocalStore {
    slots: AsyncMutex<Slots>,
    spill_dir: PathBuf,
    spill_threshold: u64,
    inflight: Mutex<Inflight>,
}

impl LocalStore {
    pub fn new(work_dir: &Path, spill_threshold: u64) -> Self {
        Self {
            slots: AsyncMutex::new(Slots::default()),
            spill_dir: work_dir.join("data"),
            spill_threshold,
            inflight: Mutex::new(HashMap::new()),
        }
    }

    pub async fn put(&self, object: ObjectId, data: Bytes) -> Result<Stored> {
        let size = data.len() as u64;
        let mut slots = self.slots.lock().await;
        if let Some(old) = slots.objects.insert(object, Slot::Memory(data)) {
            Self::forget(&mut slots, old).await;
        }
        slots.memory_used += size;

        let spilled = self.spill_over_threshold(&mut slots).await?;
        Ok(Stored { size, spilled })
    }

    pub async fn get(&self, object: ObjectId) -> Result<Option<Bytes>> {
        let path = {
            let slots = self.slots.lock().await;
            match slots.objects.get(&object) {
                None => return Ok(None),
                Some(Slot::Memory(bytes)) => return Ok(Some(bytes.clone())),
                Some(Slot::Spilled { path, .. }) => path.clone(),
            }
        };
        let bytes = tokio::fs::read(&path).await?;
        Ok(Some(Bytes::from(bytes)))
    }

    pub async fn contains(&self, object: ObjectId) -> bool {
        self.slots.lock().await.objects.contains_key(&object)
    }

    pub async fn remove(&self, objects: &[ObjectId]) {
        let mut slots = self.slots.lock().await;
        for object in objects {
            if let Some(slot) = slots.objects.remove(object) {
                Self::forget(&mut slots, slot).await;
                debug!(object = %object, "object removed");
            }
        }
    }

    pub async fn memory_used(&self) -> u64 {
        self.slots.lock().await.memory_used
    }

    pub async fn len(&self) -> usize {
        self.slots.lock().await.objects.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Make `object` local from `source` and return its content.
    pub async fn fetch(&self, object: ObjectId, source: &DataSource) -> Result<(Bytes, Stored)> {
        match source {
            DataSource::Local => {
                let bytes = self.get(object).await?.ok_or_else(|| not_found(object))?;
                let stored = Stored {
                    size: bytes.len() as u64,
                    spilled: Vec::new(),
                };
                Ok((bytes, stored))
            }
            DataSource::Inline(data) => {
                let bytes = Bytes::from(data.clone());
                let stored = self.put(object, bytes.clone()).await?;
                Ok((bytes, stored))
            }
            DataSource::Worker { address, .. } => {
                if let Some(bytes) = self.get(object).await? {
                    let stored = Stored {
                        size: bytes.len() as u64,
                        spilled: Vec::new(),
                    };
                    return Ok((bytes, stored));
                }
                let bytes = self.pull_once(object, address).await?;
                let stored = self.put(object, bytes.clone()).await?;
                Ok((bytes, stored))
            }
        }
    }

    /// One network pull per object, however many tasks wait for it.
    async fn pull_once(&self, object: ObjectId, address: &str) -> Result<Bytes> {
        let cell = {
            let mut inflight = self
                .inflight
                .lock()
                .map_err(|_| GovernorError::Protocol("in-flight table poisoned".into()))?;
            Arc::clone(inflight.entry(object).or_default())
        };

        let pulled = cell
            .get_or_init(|| async {
                match data_server::pull(address, object).await {
                    Ok(Some(data)) => Some(Bytes::from(data)),
                    Ok(None) => None,
                    Err(err) => {
                        warn!(object = %object, %address, error = %err, "pull failed");
                        None
                    }
                }
            })
            .await
            .clone();

        if let Ok(mut inflight) = self.inflight.lock() {
            inflight.remove(&object);
        }
        pulled.ok_or_else(|| not_found(object))
    }

    async fn spill_over_threshold(&self, slots: &mut Slots) -> Result<Vec<ObjectId>> {
        if slots.memory_used <= self.spill_threshold {
            return Ok(Vec::new());
        }

        let mut resident: Vec<(u64, ObjectId)> = slots
            .objects
            .iter()
            .filter_map(|(id, slot)| match slot {
                Slot::Memory(bytes) => Some((bytes.len() as u64, *id)),
                Slot::Spilled { .. } => None,
            })
            .collect();
        // Largest first.
        resident.sort_unstable_by(|a, b| b.cmp(a));

        tokio::fs::create_dir_all(&self.spill_dir).await?;
        let mut spilled = Vec::new();
        for (size, id) in resident {
            if slots.memory_used <= self.spill_threshold {
                break;
            }
            let path = self.spill_dir.join(format!("{id}.bin"));
            let Some(Slot::Memory(bytes)) = slots.objects.get(&id) else {
                continue;
            };
            tokio::fs::write(&path, bytes).await?;
            slots.objects.insert(id, Slot::Spilled { path, size });
            slots.memory_used = slots.memory_used.saturating_sub(size);
            spilled.push(id);
        }
        debug!(count = spilled.len(), memory_used = slots.memory_used, "spilled objects to disk");
        Ok(spilled)
    }

    async fn forget(slots: &mut Slots, slot: Slot) {
        let size = slot.size();
        match slot {
            Slot::Memory(_) => slots.memory_used = slots.memory_used.saturating_sub(size),
            Slot::Spilled { path, .. } => {
                if let Err(err) = tokio::fs::remove_file(&path).await {
                    debug!(path = %path.display(), error = %err, "could not delete spill file");
                }
            }
        }
    }
}

fn not_found(object: ObjectId) -> GovernorError {
    GovernorError::Protocol(format!("object {object} is not available"))
}
