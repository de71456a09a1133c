// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The expected-measurements store: a JSON object mapping VM titles to
//! their latest measurement run. Updates go through read-merge-write of the
//! whole document; the write is published atomically so a reader never
//! observes a torn file.

use std::collections::BTreeMap;
use std::io::Write;

use anyhow::Context;
use camino::Utf8Path;
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

use vcpu_spec_config::CpuSpec;

/// Top-level store document. `serde_json::Map` keeps its keys sorted, which
/// keeps the serialized store diff-friendly across runs.
pub type Document = serde_json::Map<String, Value>;

/// One successful measurement in a VM record.
#[derive(Debug, Serialize)]
pub struct MeasurementEntry {
    pub cpu_spec: CpuSpec,
    pub measurement_hex: String,
}

/// The fields a measurement run owns within a VM record.
///
/// Merging serializes this struct and overwrites exactly these keys in the
/// existing record; everything else in the record is preserved verbatim.
/// `cpu_types`, `measurements`, and `errors` are therefore replaced
/// wholesale: a spec dropped from the catalog disappears from the record on
/// the next run.
#[derive(Debug, Serialize)]
pub struct VmRecordUpdate {
    pub timestamp_utc: String,
    pub mode: &'static str,
    pub vmm_type: &'static str,
    pub al: u8,
    pub vcpus: u32,
    pub ovmf: String,
    pub kernel: String,
    pub initrd: String,
    pub append: String,
    pub cpu_types_config: String,
    pub cpu_types: Vec<CpuSpec>,
    pub measurements: BTreeMap<String, MeasurementEntry>,
    pub errors: BTreeMap<String, String>,
}

/// Reads the store document, tolerating a missing or damaged file.
///
/// Historical records are never worth failing a run over: anything that
/// cannot be read back as a top-level JSON object degrades to an empty
/// document and the run rebuilds from there.
pub fn load(path: &Utf8Path) -> Document {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Document::new();
        }
        Err(e) => {
            warn!(%path, error = %e, "store is unreadable, starting empty");
            return Document::new();
        }
    };

    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => map,
        Ok(_) => {
            warn!(%path, "store is not a JSON object, starting empty");
            Document::new()
        }
        Err(e) => {
            warn!(%path, error = %e, "store is not valid JSON, starting empty");
            Document::new()
        }
    }
}

/// Merges a run's update into the existing record for one VM title.
///
/// The existing entry's fields are copied first (a non-object entry counts
/// as empty), then the update's owned keys overwrite theirs. Caller-added
/// fields outside the owned set survive repeated runs untouched.
pub fn merge_vm_record(
    existing: &Value,
    update: &VmRecordUpdate,
) -> anyhow::Result<Value> {
    let mut merged = match existing {
        Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };

    let update = serde_json::to_value(update)
        .context("Failed to serialize VM record update")?;
    let Value::Object(owned) = update else {
        anyhow::bail!("VM record update did not serialize to an object");
    };
    for (key, value) in owned {
        merged.insert(key, value);
    }

    Ok(Value::Object(merged))
}

/// Publishes the full document at `path` atomically.
///
/// The document is written to a temporary file in the store's directory and
/// renamed into place; a failure at any point before the rename drops the
/// temporary file and leaves the previous store untouched.
pub fn persist(path: &Utf8Path, doc: &Document) -> anyhow::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_str().is_empty() => dir,
        _ => Utf8Path::new("."),
    };
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create store directory `{dir}`"))?;

    let tmp = tempfile::Builder::new()
        .prefix(".expected-measurements.")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| {
            format!("Failed to create temporary store file in `{dir}`")
        })?;

    let mut file = tmp.as_file();
    serde_json::to_writer_pretty(&mut file, doc)
        .context("Failed to serialize measurement store")?;
    file.write_all(b"\n")
        .and_then(|()| file.sync_all())
        .with_context(|| format!("Failed to write temporary store for `{path}`"))?;

    // A failed rename drops the temp file right away rather than carrying
    // it inside the returned error.
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to publish store at `{path}`"))?;
    Ok(())
}
