// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Records expected SEV-SNP launch measurements.
//!
//! For every vCPU spec in a validated CPU type catalog, the external
//! measurement tool is invoked once against the VM's boot inputs, and the
//! outcomes are merged into a per-VM entry of the expected-measurements
//! store. Configuration errors abort before anything is measured or
//! written; individual measurement failures are recorded alongside the
//! successes and never fail the run.

mod config;
mod measure;
mod store;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Context;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use clap::Parser;
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_bunyan_formatter::{BunyanFormattingLayer, JsonStorageLayer};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use vcpu_spec_config::{validated_catalog, CpuSpec, TypeAllowlist};

use crate::config::{
    BootParams, Command, MeasureOptions, ProcessArgs, ValidateOptions,
};
use crate::measure::MeasureError;
use crate::store::{MeasurementEntry, VmRecordUpdate};

/// Exit code for configuration errors the caller must fix: malformed
/// catalog or type list, duplicate specs, illegal type strings, missing
/// boot inputs.
const EXIT_INVALID: i32 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ProcessArgs::parse();
    set_tracing_subscriber(&args);

    match args.command {
        Command::Measure(opts) => run_measure(opts).await,
        Command::Validate(opts) => run_validate(&opts),
    }
}

/// All the validated inputs a measurement run needs; assembling it is the
/// hard-failure phase, completed before the first tool invocation.
struct MeasurePlan {
    specs: Vec<CpuSpec>,
    boot: BootParams,
    catalog_config: Utf8PathBuf,
}

impl MeasurePlan {
    fn from_options(opts: &MeasureOptions) -> anyhow::Result<Self> {
        let specs = load_specs(&opts.cpu_types, &opts.legal_cpu_types)?;
        let boot = BootParams::new(
            opts.al,
            opts.vcpus,
            opts.ovmf.clone(),
            opts.kernel.as_deref(),
            opts.initrd.as_deref(),
            &opts.append,
        )?;
        let catalog_config = opts
            .cpu_types
            .canonicalize_utf8()
            .unwrap_or_else(|_| opts.cpu_types.clone());
        Ok(Self { specs, boot, catalog_config })
    }
}

async fn run_measure(opts: MeasureOptions) -> anyhow::Result<()> {
    let plan = match MeasurePlan::from_options(&opts) {
        Ok(plan) => plan,
        Err(e) => invalid_config(&e),
    };

    let timeout = Duration::from_secs(opts.measure_timeout_secs);
    let mut results: Vec<(String, Result<String, MeasureError>)> =
        Vec::with_capacity(plan.specs.len());
    for spec in &plan.specs {
        let label = spec.label();
        info!(%label, "measuring");
        let outcome =
            measure::measure(&opts.measure_cmd, &plan.boot, spec, timeout)
                .await;
        if let Err(e) = &outcome {
            warn!(%label, error = %e, "measurement failed");
        }
        results.push((label, outcome));
    }

    let mut measurements = BTreeMap::new();
    let mut errors = BTreeMap::new();
    for ((label, outcome), spec) in results.iter().zip(&plan.specs) {
        match outcome {
            Ok(hex) => {
                measurements.insert(
                    label.clone(),
                    MeasurementEntry {
                        cpu_spec: spec.clone(),
                        measurement_hex: hex.clone(),
                    },
                );
            }
            Err(e) => {
                errors.insert(label.clone(), e.to_string());
            }
        }
    }

    let update = VmRecordUpdate {
        timestamp_utc: Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string(),
        mode: measure::MEASURE_MODE,
        vmm_type: measure::VMM_TYPE,
        al: plan.boot.level.number(),
        vcpus: plan.boot.vcpus,
        ovmf: opts.ovmf.to_string(),
        kernel: path_or_empty(opts.kernel.as_deref()),
        initrd: path_or_empty(opts.initrd.as_deref()),
        append: opts.append.clone(),
        cpu_types_config: plan.catalog_config.to_string(),
        cpu_types: plan.specs.clone(),
        measurements,
        errors,
    };

    let mut doc = store::load(&opts.out_json);
    let existing =
        doc.get(&opts.vm_title).cloned().unwrap_or(Value::Null);
    let merged = store::merge_vm_record(&existing, &update)?;
    doc.insert(opts.vm_title.clone(), merged);
    store::persist(&opts.out_json, &doc)?;
    info!(
        store = %opts.out_json,
        vm_title = %opts.vm_title,
        "recorded expected measurements"
    );

    // Reporting contract: one stdout line per catalog entry, in catalog
    // order, errors flattened to a single line.
    for (label, outcome) in &results {
        match outcome {
            Ok(hex) => println!("{label}\t{hex}"),
            Err(e) => {
                let msg = e.to_string().replace('\n', "\\n");
                println!("{label}\tERROR\t{msg}");
            }
        }
    }

    Ok(())
}

fn run_validate(opts: &ValidateOptions) -> anyhow::Result<()> {
    match load_specs(&opts.cpu_types, &opts.legal_cpu_types) {
        Ok(specs) => {
            info!(specs = specs.len(), "CPU type catalog is valid");
            Ok(())
        }
        Err(e) => invalid_config(&e),
    }
}

fn load_specs(
    cpu_types: &Utf8Path,
    legal_cpu_types: &Utf8Path,
) -> anyhow::Result<Vec<CpuSpec>> {
    let catalog = load_json(cpu_types)?;
    let allowlist = TypeAllowlist::from_value(&load_json(legal_cpu_types)?)
        .with_context(|| {
            format!("Invalid legal CPU type list `{legal_cpu_types}`")
        })?;
    let specs =
        validated_catalog(&catalog, &allowlist).with_context(|| {
            format!("Invalid CPU type catalog `{cpu_types}`")
        })?;
    Ok(specs)
}

fn load_json(path: &Utf8Path) -> anyhow::Result<Value> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read JSON `{path}`"))?;
    serde_json::from_str(&contents)
        .with_context(|| format!("Failed to parse JSON `{path}`"))
}

fn path_or_empty(path: Option<&Utf8Path>) -> String {
    path.map(|p| p.to_string()).unwrap_or_default()
}

fn invalid_config(e: &anyhow::Error) -> ! {
    error!("invalid configuration: {:#}", e);
    std::process::exit(EXIT_INVALID);
}

fn set_tracing_subscriber(args: &ProcessArgs) {
    let filter = EnvFilter::builder()
        .with_default_directive(tracing::Level::INFO.into());
    let subscriber = Registry::default().with(filter.from_env_lossy());
    // stdout carries the measurement report, so diagnostics go to stderr.
    if args.emit_bunyan {
        let bunyan_layer =
            BunyanFormattingLayer::new("snp-baseline".into(), std::io::stderr);
        let subscriber = subscriber.with(JsonStorageLayer).with(bunyan_layer);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    } else {
        let stderr_log = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_line_number(true)
            .with_ansi(!args.disable_ansi);
        let subscriber = subscriber.with(stderr_log);
        tracing::subscriber::set_global_default(subscriber).unwrap();
    }
}
