//! The six-step "index one file" protocol shared by the Subtree Watcher's
//! `fileAdded` handler (§4.E) and the Volume Manager's bulk scan (§4.F).
//!
//! Both callers walk the same sequence — detect, check brokenness, check
//! the stored etag, mark optimistically broken, extract, insert — against
//! a different write target (the live `Store` for one-off watcher events,
//! a long-running `Transaction` for a bulk scan), so the steps are written
//! once here against each target rather than pulled behind a shared trait.

use std::path::Path;

use crate::error::Result;
use crate::metadata::{self, MetadataExtractor};
use crate::store::{Store, Transaction};

/// Run the protocol against the live store (used by the watcher).
///
/// Returns `true` if the catalog changed (insert happened), `false` if the
/// file was silently skipped or was already up to date.
pub async fn index_into_store(
    store: &Store,
    extractor: &mut MetadataExtractor,
    path: &Path,
) -> Result<bool> {
    let Ok(detected) = metadata::detect(path) else {
        return Ok(false);
    };

    if store.is_broken_file(&detected.filename, &detected.etag).await? {
        store.insert(&metadata::fallback_extract(&detected)).await?;
        return Ok(true);
    }

    let stored_etag = store.get_etag(&detected.filename).await?;
    if stored_etag == detected.etag {
        return Ok(false);
    }

    store
        .insert_broken_file(&detected.filename, &detected.etag)
        .await?;

    let record = match extractor.extract(&detected).await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(filename = %detected.filename, error = %e, "extraction failed, using fallback record");
            metadata::fallback_extract(&detected)
        }
    };
    store.insert(&record).await?;
    Ok(true)
}

/// Run the protocol against a long-running bulk-scan transaction (used by
/// the volume manager's initial scan).
pub async fn index_into_transaction(
    txn: &mut Transaction,
    extractor: &mut MetadataExtractor,
    path: &Path,
) -> Result<bool> {
    let Ok(detected) = metadata::detect(path) else {
        return Ok(false);
    };

    if txn.is_broken_file(&detected.filename, &detected.etag).await? {
        txn.insert(&metadata::fallback_extract(&detected)).await?;
        return Ok(true);
    }

    let stored_etag = txn.get_etag(&detected.filename).await?;
    if stored_etag == detected.etag {
        return Ok(false);
    }

    txn.insert_broken_file(&detected.filename, &detected.etag)
        .await?;

    let record = match extractor.extract(&detected).await {
        Ok(record) => record,
        Err(e) => {
            tracing::warn!(filename = %detected.filename, error = %e, "extraction failed, using fallback record");
            metadata::fallback_extract(&detected)
        }
    };
    txn.insert(&record).await?;
    Ok(true)
}
