// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Normalization and validation of vCPU spec catalogs.
//!
//! A catalog is a JSON array in which every entry names a vCPU
//! microarchitecture in one of three ways: a CPU type string
//! (`"EPYC-Milan"`), a raw vCPU signature (`"0x0a201009"` or
//! `{"vcpu_sig": "0x0a201009"}`), or a family/model/stepping triple
//! (`{"family": 25, "model": 1, "stepping": 2}`).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// A single normalized vCPU spec.
#[derive(Serialize, Deserialize, Debug, PartialEq, Eq, Clone)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CpuSpec {
    /// A named microarchitecture, e.g. "EPYC-Milan".
    Type {
        #[serde(rename = "type")]
        name: String,
    },
    /// A raw vCPU signature as lowercase `0x`-prefixed hex.
    Sig { sig: String },
    /// A family/model/stepping triple.
    Fms { family: u64, model: u64, stepping: u64 },
}

impl CpuSpec {
    /// Stable identifier used for uniqueness checks within a catalog.
    ///
    /// Two specs are considered the same iff their identifiers match; a
    /// `Type` and a `Sig` describing the same silicon remain distinct.
    pub fn id(&self) -> String {
        match self {
            CpuSpec::Type { name } => format!("type:{name}"),
            CpuSpec::Sig { sig } => format!("sig:{sig}"),
            CpuSpec::Fms { family, model, stepping } => {
                format!("fms:{family}:{model}:{stepping}")
            }
        }
    }

    /// Human-readable form used in report lines and record keys.
    pub fn label(&self) -> String {
        match self {
            CpuSpec::Type { name } => name.clone(),
            CpuSpec::Sig { sig } => format!("vcpu-sig={sig}"),
            CpuSpec::Fms { family, model, stepping } => format!(
                "vcpu-family={family},vcpu-model={model},vcpu-stepping={stepping}"
            ),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum SpecParseError {
    #[error("CPU spec strings must not be empty")]
    EmptyString,

    #[error("vcpu_sig must be a hex string like 0x8b10 or a non-negative integer")]
    BadSignature,

    #[error("{0} must be a non-negative integer")]
    BadFmsField(&'static str),

    #[error(
        "CPU spec objects must carry either {{family, model, stepping}} \
         or {{vcpu_sig}}/{{sig}}"
    )]
    UnknownObjectShape,

    #[error("CPU spec entries must be strings or objects")]
    UnsupportedEntry,
}

/// A raw signature is a literal `0x` prefix followed by one or more hex
/// digits; the digits may be upper- or lowercase, the prefix may not.
fn is_hex_sig(s: &str) -> bool {
    match s.strip_prefix("0x") {
        Some(digits) => {
            !digits.is_empty() && digits.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

impl TryFrom<&serde_json::Value> for CpuSpec {
    type Error = SpecParseError;

    fn try_from(entry: &serde_json::Value) -> Result<Self, Self::Error> {
        use serde_json::Value;

        match entry {
            // Bare string: either a raw signature or a CPU type name.
            Value::String(s) => {
                let s = s.trim();
                if s.is_empty() {
                    return Err(SpecParseError::EmptyString);
                }
                if is_hex_sig(s) {
                    Ok(CpuSpec::Sig { sig: s.to_lowercase() })
                } else {
                    Ok(CpuSpec::Type { name: s.to_string() })
                }
            }

            Value::Object(map) => {
                // Signature form takes precedence over the triple when an
                // object carries both key sets.
                if let Some(val) =
                    map.get("vcpu_sig").or_else(|| map.get("sig"))
                {
                    return match val {
                        Value::Number(n) => {
                            let sig = n
                                .as_u64()
                                .ok_or(SpecParseError::BadSignature)?;
                            Ok(CpuSpec::Sig { sig: format!("{sig:#x}") })
                        }
                        Value::String(s) if is_hex_sig(s.trim()) => {
                            Ok(CpuSpec::Sig { sig: s.trim().to_lowercase() })
                        }
                        _ => Err(SpecParseError::BadSignature),
                    };
                }

                const FMS_KEYS: [&str; 3] = ["family", "model", "stepping"];
                if FMS_KEYS.iter().all(|k| map.contains_key(*k)) {
                    let mut fms = [0u64; 3];
                    for (slot, key) in fms.iter_mut().zip(FMS_KEYS) {
                        *slot = map
                            .get(key)
                            .and_then(Value::as_u64)
                            .ok_or(SpecParseError::BadFmsField(key))?;
                    }
                    let [family, model, stepping] = fms;
                    return Ok(CpuSpec::Fms { family, model, stepping });
                }

                Err(SpecParseError::UnknownObjectShape)
            }

            _ => Err(SpecParseError::UnsupportedEntry),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum AllowlistError {
    #[error("legal CPU type list must be a non-empty JSON array")]
    NotAList,

    #[error("legal CPU type list entries must be non-empty strings")]
    BadEntry,
}

/// The set of CPU type strings a catalog may name.
///
/// Only `Type` specs are checked against this list; `Sig` and `Fms` specs
/// are passed through to the measurement tool unchecked.
#[derive(Debug, Clone)]
pub struct TypeAllowlist {
    names: BTreeSet<String>,
}

impl TypeAllowlist {
    /// Parses the allowlist out of its JSON form: a non-empty array of
    /// strings that are non-empty after trimming. A single bad entry
    /// invalidates the whole list.
    pub fn from_value(
        value: &serde_json::Value,
    ) -> Result<Self, AllowlistError> {
        let entries = match value.as_array() {
            Some(a) if !a.is_empty() => a,
            _ => return Err(AllowlistError::NotAList),
        };

        let mut names = BTreeSet::new();
        for entry in entries {
            let name =
                entry.as_str().map(str::trim).filter(|s| !s.is_empty());
            match name {
                Some(name) => {
                    names.insert(name.to_string());
                }
                None => return Err(AllowlistError::BadEntry),
            }
        }
        Ok(Self { names })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum CatalogError {
    #[error("CPU type catalog must be a non-empty JSON array")]
    NotACatalog,

    #[error("invalid CPU spec entry: {0}")]
    Spec(#[from] SpecParseError),

    #[error("catalog contains duplicate CPU specs (not allowed): {0}")]
    Duplicate(String),

    #[error("illegal CPU type string: '{0}' (not in the legal CPU type list)")]
    IllegalType(String),
}

/// Normalizes and validates a whole catalog.
///
/// Entries are normalized in order; validation fails fast on the first
/// malformed entry, the first duplicate identity, or the first `Type` spec
/// whose name is absent from `allowlist` (case-sensitive).
pub fn validated_catalog(
    catalog: &serde_json::Value,
    allowlist: &TypeAllowlist,
) -> Result<Vec<CpuSpec>, CatalogError> {
    let entries = match catalog.as_array() {
        Some(a) if !a.is_empty() => a,
        _ => return Err(CatalogError::NotACatalog),
    };

    let mut specs = Vec::with_capacity(entries.len());
    let mut seen = BTreeSet::new();
    for entry in entries {
        let spec = CpuSpec::try_from(entry)?;
        if !seen.insert(spec.id()) {
            return Err(CatalogError::Duplicate(spec.id()));
        }
        if let CpuSpec::Type { name } = &spec {
            if !allowlist.contains(name) {
                return Err(CatalogError::IllegalType(name.clone()));
            }
        }
        specs.push(spec);
    }
    Ok(specs)
}
