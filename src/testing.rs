//! Fault-injecting store wrapper for tests.

use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::UploadError;
use crate::storage::backend::{
    ListedPart, MultipartStore, ObjectLocation, ObjectMetadata, StoreFuture, StoredObjectInfo,
    UploadSummary,
};
use crate::storage::memory::MemoryStore;

/// Failure to inject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Auth,
    SessionExpired,
    /// Complete only: the server refuses the part list.
    CompleteRejected,
    /// Sleep before delegating; the call itself succeeds.
    Delay(Duration),
    /// Panic inside the call.
    Panic,
}

impl Fault {
    fn error(self, operation: &'static str, upload_id: &str) -> Option<UploadError> {
        match self {
            Fault::Transient => Some(UploadError::transient(operation, "injected 503")),
            Fault::Auth => Some(UploadError::Auth {
                operation,
                message: "injected AccessDenied".into(),
            }),
            Fault::SessionExpired => Some(UploadError::SessionExpired {
                session_id: upload_id.to_string(),
            }),
            Fault::CompleteRejected => Some(UploadError::CompleteRejected {
                session_id: upload_id.to_string(),
                message: "injected InvalidPart".into(),
            }),
            Fault::Delay(_) => None,
            Fault::Panic => panic!("injected panic in {operation}"),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    parts: HashMap<u32, (Fault, u32)>,
    complete: Option<(Fault, u32)>,
    complete_calls: u32,
    part_calls: HashMap<u32, u32>,
    /// Part left out of the next `n` listings.
    hidden: Option<(u32, u32)>,
}

/// Wraps a [`MemoryStore`] and fails chosen calls a set number of times.
#[derive(Debug)]
pub struct FaultyStore {
    inner: MemoryStore,
    faults: Mutex<Faults>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FaultyStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            faults: Mutex::new(Faults::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    /// Fail the next `times` uploads of part `number` with `fault`.
    pub fn fail_part(&self, number: u32, fault: Fault, times: u32) {
        self.faults.lock().unwrap().parts.insert(number, (fault, times));
    }

    /// Fail the next `times` completes with `fault`.
    pub fn fail_complete(&self, fault: Fault, times: u32) {
        self.faults.lock().unwrap().complete = Some((fault, times));
    }

    /// Leave part `number` out of the next `times` part listings.
    pub fn hide_listed_part(&self, number: u32, times: u32) {
        self.faults.lock().unwrap().hidden = Some((number, times));
    }

    /// Upload calls made for part `number`, failed ones included.
    pub fn part_calls(&self, number: u32) -> u32 {
        self.faults
            .lock()
            .unwrap()
            .part_calls
            .get(&number)
            .copied()
            .unwrap_or(0)
    }

    /// Complete calls made, failed ones included.
    pub fn complete_calls(&self) -> u32 {
        self.faults.lock().unwrap().complete_calls
    }

    /// Total upload calls across all parts.
    pub fn total_part_calls(&self) -> u32 {
        self.faults.lock().unwrap().part_calls.values().sum()
    }

    /// Highest number of part uploads observed running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn take_part_fault(&self, number: u32) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        *faults.part_calls.entry(number).or_default() += 1;
        take(faults.parts.get_mut(&number))
    }

    fn take_complete_fault(&self) -> Option<Fault> {
        let mut faults = self.faults.lock().unwrap();
        faults.complete_calls += 1;
        take(faults.complete.as_mut())
    }
}

fn take(slot: Option<&mut (Fault, u32)>) -> Option<Fault> {
    let (fault, remaining) = slot?;
    if *remaining == 0 {
        return None;
    }
    *remaining -= 1;
    Some(*fault)
}

impl MultipartStore for FaultyStore {
    fn create_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, String> {
        self.inner.create_multipart_upload(location, metadata)
    }

    fn upload_part<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        part_number: u32,
        data: Bytes,
        content_md5: Option<String>,
    ) -> StoreFuture<'a, String> {
        Box::pin(async move {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            let fault = self.take_part_fault(part_number);
            // Yield so concurrent uploads overlap.
            tokio::time::sleep(Duration::from_millis(1)).await;
            let result = match fault {
                Some(Fault::Delay(d)) => {
                    tokio::time::sleep(d).await;
                    None
                }
                Some(f) => f.error("upload_part", upload_id),
                None => None,
            };
            let result = match result {
                Some(err) => Err(err),
                None => {
                    self.inner
                        .upload_part(location, upload_id, part_number, data, content_md5)
                        .await
                }
            };
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result
        })
    }

    fn list_parts<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, Vec<ListedPart>> {
        Box::pin(async move {
            let mut parts = self.inner.list_parts(location, upload_id).await?;
            let hidden = {
                let mut faults = self.faults.lock().unwrap();
                match faults.hidden.as_mut() {
                    Some((number, remaining)) if *remaining > 0 => {
                        *remaining -= 1;
                        Some(*number)
                    }
                    _ => None,
                }
            };
            if let Some(number) = hidden {
                parts.retain(|p| p.number != number);
            }
            Ok(parts)
        })
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
        parts: &'a [(u32, String)],
    ) -> StoreFuture<'a, StoredObjectInfo> {
        Box::pin(async move {
            if let Some(err) = self
                .take_complete_fault()
                .and_then(|f| f.error("complete_multipart_upload", upload_id))
            {
                return Err(err);
            }
            self.inner
                .complete_multipart_upload(location, upload_id, parts)
                .await
        })
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        location: &'a ObjectLocation,
        upload_id: &'a str,
    ) -> StoreFuture<'a, ()> {
        self.inner.abort_multipart_upload(location, upload_id)
    }

    fn list_multipart_uploads<'a>(
        &'a self,
        bucket: &'a str,
        prefix: &'a str,
    ) -> StoreFuture<'a, Vec<UploadSummary>> {
        self.inner.list_multipart_uploads(bucket, prefix)
    }

    fn put_object<'a>(
        &'a self,
        location: &'a ObjectLocation,
        data: Bytes,
        content_md5: Option<String>,
        metadata: &'a ObjectMetadata,
    ) -> StoreFuture<'a, StoredObjectInfo> {
        self.inner.put_object(location, data, content_md5, metadata)
    }
}

/// Shared handle, so tests can keep inspecting the store after handing it
/// to the engine.
pub fn faulty() -> Arc<FaultyStore> {
    Arc::new(FaultyStore::new(MemoryStore::new()))
}
