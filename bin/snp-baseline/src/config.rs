// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use camino::{Utf8Path, Utf8PathBuf};
use clap::{Args, Parser, Subcommand};

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Compute expected launch measurements for every spec in the CPU type
    /// catalog and record them in the measurement store.
    Measure(MeasureOptions),

    /// Validate a CPU type catalog against the legal CPU type list without
    /// invoking the measurement tool.
    Validate(ValidateOptions),
}

/// Runtime configuration options for the recorder.
#[derive(Debug, Parser)]
#[clap(verbatim_doc_comment)]
pub struct ProcessArgs {
    #[clap(subcommand)]
    pub command: Command,

    /// Suppress emission of terminal control codes in log output.
    #[clap(long, conflicts_with = "emit_bunyan")]
    pub disable_ansi: bool,

    /// Emit Bunyan-formatted logs.
    #[clap(long)]
    pub emit_bunyan: bool,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct MeasureOptions {
    /// Path to the expected-measurements store to update.
    #[clap(long, value_parser)]
    pub out_json: Utf8PathBuf,

    /// Attestation level (2|3|4). Levels 3 and 4 measure the kernel, initrd,
    /// and kernel command line in addition to the firmware.
    #[clap(long, value_parser)]
    pub al: AttestationLevel,

    /// VM title to record the measurements under.
    #[clap(long, value_parser)]
    pub vm_title: String,

    /// Path to the OVMF code file.
    #[clap(long, value_parser)]
    pub ovmf: Utf8PathBuf,

    /// Path to the kernel. Required at levels 3/4; ignored at level 2.
    #[clap(long, value_parser)]
    pub kernel: Option<Utf8PathBuf>,

    /// Path to the initrd. Required at levels 3/4; ignored at level 2.
    #[clap(long, value_parser)]
    pub initrd: Option<Utf8PathBuf>,

    /// Kernel command line. Only measured at levels 3/4.
    #[clap(long, value_parser, default_value = "")]
    pub append: String,

    /// Number of vCPUs the VM boots with.
    #[clap(long, value_parser)]
    pub vcpus: u32,

    /// Path to the CPU type catalog (JSON array).
    #[clap(long, value_parser)]
    pub cpu_types: Utf8PathBuf,

    /// Path to the legal CPU type list (JSON array of strings).
    #[clap(long, value_parser)]
    pub legal_cpu_types: Utf8PathBuf,

    /// The command to use to run the measurement tool (sev-snp-measure).
    #[clap(long, value_parser)]
    pub measure_cmd: Utf8PathBuf,

    /// Per-invocation timeout for the measurement tool, in seconds.
    #[clap(long, value_parser, default_value = "120")]
    pub measure_timeout_secs: u64,
}

#[derive(Args, Debug)]
#[clap(verbatim_doc_comment)]
pub struct ValidateOptions {
    /// Path to the CPU type catalog (JSON array).
    #[clap(long, value_parser)]
    pub cpu_types: Utf8PathBuf,

    /// Path to the legal CPU type list (JSON array of strings).
    #[clap(long, value_parser)]
    pub legal_cpu_types: Utf8PathBuf,
}

/// Which boot inputs feed the launch measurement.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum AttestationLevel {
    /// Firmware only.
    Al2,
    /// Firmware plus kernel, initrd, and command line.
    Al3,
    /// As level 3, with the stricter runtime policy checked elsewhere.
    Al4,
}

impl AttestationLevel {
    pub fn number(self) -> u8 {
        match self {
            AttestationLevel::Al2 => 2,
            AttestationLevel::Al3 => 3,
            AttestationLevel::Al4 => 4,
        }
    }

    pub fn requires_direct_boot(self) -> bool {
        !matches!(self, AttestationLevel::Al2)
    }
}

impl FromStr for AttestationLevel {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "2" => Ok(AttestationLevel::Al2),
            "3" => Ok(AttestationLevel::Al3),
            "4" => Ok(AttestationLevel::Al4),
            other => bail!("unsupported attestation level '{other}' (expected 2|3|4)"),
        }
    }
}

impl fmt::Display for AttestationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Kernel/initrd/cmdline inputs measured at levels 3 and 4.
#[derive(Clone, Debug)]
pub struct DirectBoot {
    pub kernel: Utf8PathBuf,
    pub initrd: Utf8PathBuf,
    pub cmdline: String,
}

/// The boot inputs one measurement run describes.
///
/// `direct_boot` is populated exactly when the attestation level measures
/// the kernel; at level 2 any supplied kernel/initrd/cmdline are left out of
/// the tool invocation entirely.
#[derive(Clone, Debug)]
pub struct BootParams {
    pub level: AttestationLevel,
    pub vcpus: u32,
    pub ovmf: Utf8PathBuf,
    pub direct_boot: Option<DirectBoot>,
}

impl BootParams {
    pub fn new(
        level: AttestationLevel,
        vcpus: u32,
        ovmf: Utf8PathBuf,
        kernel: Option<&Utf8Path>,
        initrd: Option<&Utf8Path>,
        cmdline: &str,
    ) -> anyhow::Result<Self> {
        let direct_boot = if level.requires_direct_boot() {
            let (kernel, initrd) = match (kernel, initrd) {
                (Some(k), Some(i)) => (k.to_path_buf(), i.to_path_buf()),
                _ => bail!(
                    "attestation level {level} requires --kernel and --initrd"
                ),
            };
            Some(DirectBoot {
                kernel,
                initrd,
                cmdline: cmdline.to_string(),
            })
        } else {
            None
        };
        Ok(Self { level, vcpus, ovmf, direct_boot })
    }
}
