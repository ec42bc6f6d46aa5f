//! Device residency for bound arrays.
//!
//! One entry per (backing storage, device) remembers the buffer handle and
//! the host version the device copy was taken from. Staging re-uploads
//! only when the host version moved, so repeated calls over unchanged data
//! pay for one transfer. Names that alias one storage share one buffer.
//! A device write propagates to peers through the version bump recorded at
//! read-back: stale copies re-upload on their next use.

use std::collections::{hash_map, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use parloop::error::{OffloadError, Result};
use parloop::exec::DeviceHandle;
use parloop::symbols::ArrayRef;

use crate::driver::{ClDriver, Handle};

/// One array parameter of a staged launch.
#[derive(Clone)]
pub struct StageRequest {
    pub name: String,
    pub array: ArrayRef,
    pub written: bool,
    pub write_only: bool,
}

/// Result of staging one launch's arrays.
#[derive(Debug)]
pub struct Staged {
    /// Buffer handle per parameter name. Aliased names map to one handle.
    pub handles: HashMap<String, Handle>,
    pub uploaded_bytes: u64,
}

struct Entry {
    handle: Handle,
    bytes: u64,
    /// Host version the device copy matches. `None` marks a buffer whose
    /// contents were never uploaded, e.g. write-only staging.
    version: Option<u64>,
    /// Stage count, the eviction order.
    uses: u64,
}

#[derive(Default)]
struct Residency {
    entries: HashMap<u64, Entry>,
    resident_bytes: u64,
}

/// Requests deduplicated by backing storage.
struct StorageGroup {
    id: u64,
    names: Vec<String>,
    array: ArrayRef,
    bytes: u64,
    write_only: bool,
    written: bool,
}

pub struct DataBroker {
    driver: Arc<dyn ClDriver>,
    /// Fraction of a device's global memory the broker may occupy.
    portion: f64,
    state: Mutex<HashMap<String, Residency>>,
}

impl DataBroker {
    pub fn new(driver: Arc<dyn ClDriver>, portion: f64) -> DataBroker {
        DataBroker {
            driver,
            portion,
            state: Mutex::new(HashMap::new()),
        }
    }

    fn budget(&self, device: &DeviceHandle) -> u64 {
        (self.portion * device.limits.global_mem_bytes as f64) as u64
    }

    /// Make every requested array resident and current on `device`.
    /// Evicts the least-used buffers outside the request when the budget
    /// would overflow; a request that cannot fit at all is a capacity
    /// failure.
    pub fn stage(&self, device: &DeviceHandle, requests: &[StageRequest]) -> Result<Staged> {
        let groups = group_requests(requests);
        let budget = self.budget(device);
        let mut state = self.state.lock().expect("broker state lock poisoned");
        let residency = state.entry(device.identity()).or_default();

        // Storage that changed size since it was staged is dropped first.
        let resized: Vec<u64> = groups
            .iter()
            .filter(|g| {
                residency
                    .entries
                    .get(&g.id)
                    .is_some_and(|e| e.bytes != g.bytes)
            })
            .map(|g| g.id)
            .collect();
        for id in resized {
            if let Some(entry) = residency.entries.remove(&id) {
                residency.resident_bytes = residency.resident_bytes.saturating_sub(entry.bytes);
                self.driver.free(device, entry.handle);
            }
        }

        let required: HashSet<u64> = groups.iter().map(|g| g.id).collect();
        let needed: u64 = groups
            .iter()
            .filter(|g| !residency.entries.contains_key(&g.id))
            .map(|g| g.bytes)
            .sum();
        while residency.resident_bytes + needed > budget {
            let victim = residency
                .entries
                .iter()
                .filter(|(id, _)| !required.contains(id))
                .min_by_key(|(id, e)| (e.uses, **id))
                .map(|(id, _)| *id);
            match victim {
                Some(id) => {
                    if let Some(entry) = residency.entries.remove(&id) {
                        residency.resident_bytes =
                            residency.resident_bytes.saturating_sub(entry.bytes);
                        self.driver.free(device, entry.handle);
                    }
                }
                None => {
                    return Err(OffloadError::capacity(format!(
                        "Data too large for '{}' memory.",
                        device.name
                    )))
                }
            }
        }

        let mut staged = Staged {
            handles: HashMap::new(),
            uploaded_bytes: 0,
        };
        for g in &groups {
            let data = g.array.lock();
            let entry = match residency.entries.entry(g.id) {
                hash_map::Entry::Occupied(occupied) => occupied.into_mut(),
                hash_map::Entry::Vacant(vacant) => {
                    let handle = self.driver.alloc(device, g.bytes)?;
                    residency.resident_bytes += g.bytes;
                    vacant.insert(Entry {
                        handle,
                        bytes: g.bytes,
                        version: None,
                        uses: 0,
                    })
                }
            };
            entry.uses += 1;
            if !g.write_only && entry.version != Some(data.version()) {
                self.driver.upload(device, entry.handle, &data.to_bytes())?;
                entry.version = Some(data.version());
                staged.uploaded_bytes += g.bytes;
            }
            for name in &g.names {
                staged.handles.insert(name.clone(), entry.handle);
            }
        }
        Ok(staged)
    }

    /// Download every written array back into host storage. Recorded
    /// versions keep this device's copies current while peers go stale.
    pub fn read_back(&self, device: &DeviceHandle, requests: &[StageRequest]) -> Result<u64> {
        let groups = group_requests(requests);
        let mut state = self.state.lock().expect("broker state lock poisoned");
        let residency = state.entry(device.identity()).or_default();
        let mut downloaded = 0u64;
        for g in groups.iter().filter(|g| g.written) {
            let entry = residency.entries.get_mut(&g.id).ok_or_else(|| {
                OffloadError::device(format!(
                    "read back of '{}' before it was staged",
                    g.names[0]
                ))
            })?;
            let mut bytes = vec![0u8; entry.bytes as usize];
            self.driver.download(device, entry.handle, &mut bytes)?;
            let mut data = g.array.lock();
            data.copy_from_bytes(&bytes)?;
            entry.version = Some(data.version());
            downloaded += entry.bytes;
        }
        Ok(downloaded)
    }

    /// Drop the device copies of these arrays so the next stage uploads
    /// fresh host data. Used to discard the writes of a failed or violated
    /// launch.
    pub fn discard(&self, device: &DeviceHandle, requests: &[StageRequest]) {
        let groups = group_requests(requests);
        let mut state = self.state.lock().expect("broker state lock poisoned");
        if let Some(residency) = state.get_mut(&device.identity()) {
            for g in &groups {
                if let Some(entry) = residency.entries.remove(&g.id) {
                    residency.resident_bytes =
                        residency.resident_bytes.saturating_sub(entry.bytes);
                    self.driver.free(device, entry.handle);
                }
            }
        }
    }

    /// Bytes currently resident on one device.
    pub fn resident_bytes(&self, device: &DeviceHandle) -> u64 {
        self.state
            .lock()
            .expect("broker state lock poisoned")
            .get(&device.identity())
            .map_or(0, |r| r.resident_bytes)
    }
}

fn group_requests(requests: &[StageRequest]) -> Vec<StorageGroup> {
    let mut groups: Vec<StorageGroup> = Vec::new();
    for req in requests {
        let id = req.array.id().0;
        match groups.iter_mut().find(|g| g.id == id) {
            Some(g) => {
                g.names.push(req.name.clone());
                g.write_only &= req.write_only;
                g.written |= req.written;
            }
            None => groups.push(StorageGroup {
                id,
                names: vec![req.name.clone()],
                array: req.array.clone(),
                bytes: req.array.lock().byte_len() as u64,
                write_only: req.write_only,
                written: req.written,
            }),
        }
    }
    groups.sort_by(|a, b| a.names[0].cmp(&b.names[0]));
    groups
}
