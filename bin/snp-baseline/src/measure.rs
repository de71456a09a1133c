// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Drives the external measurement tool (sev-snp-measure) once per vCPU
//! spec. A failed invocation is an expected per-spec outcome, never a run
//! failure; callers iterate the whole catalog and collect every result.

use std::process::Stdio;
use std::time::Duration;

use camino::Utf8Path;
use tokio::process::Command;

use vcpu_spec_config::CpuSpec;

use crate::config::BootParams;

/// Mode marker passed to the measurement tool.
pub const MEASURE_MODE: &str = "snp";
/// VMM whose launch sequence the measurement models.
pub const VMM_TYPE: &str = "QEMU";

#[derive(Debug, thiserror::Error)]
pub enum MeasureError {
    #[error("failed to run measurement tool '{tool}': {source}")]
    Launch {
        tool: camino::Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("measurement tool failed ({status}): {stderr}")]
    Failed { status: std::process::ExitStatus, stderr: String },

    #[error("measurement tool timed out after {0:?}")]
    TimedOut(Duration),
}

/// Assembles the tool's argument vector for one spec.
///
/// Exactly one vCPU selector group is emitted, chosen by the spec variant.
/// The kernel/initrd/cmdline flags appear iff the boot parameters carry a
/// direct-boot section (attestation levels 3/4).
pub fn tool_args(boot: &BootParams, spec: &CpuSpec) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--mode".to_string(),
        MEASURE_MODE.to_string(),
        "--vmm-type".to_string(),
        VMM_TYPE.to_string(),
        "--vcpus".to_string(),
        boot.vcpus.to_string(),
        "--ovmf".to_string(),
        boot.ovmf.to_string(),
        "--output-format".to_string(),
        "hex".to_string(),
    ];

    match spec {
        CpuSpec::Type { name } => {
            args.extend(["--vcpu-type".to_string(), name.clone()]);
        }
        CpuSpec::Sig { sig } => {
            args.extend(["--vcpu-sig".to_string(), sig.clone()]);
        }
        CpuSpec::Fms { family, model, stepping } => {
            args.extend([
                "--vcpu-family".to_string(),
                family.to_string(),
                "--vcpu-model".to_string(),
                model.to_string(),
                "--vcpu-stepping".to_string(),
                stepping.to_string(),
            ]);
        }
    }

    if let Some(direct) = &boot.direct_boot {
        args.extend([
            "--kernel".to_string(),
            direct.kernel.to_string(),
            "--initrd".to_string(),
            direct.initrd.to_string(),
            "--append".to_string(),
            direct.cmdline.clone(),
        ]);
    }

    args
}

/// Runs one measurement, returning the trimmed hex digest the tool printed.
pub async fn measure(
    tool: &Utf8Path,
    boot: &BootParams,
    spec: &CpuSpec,
    timeout: Duration,
) -> Result<String, MeasureError> {
    let mut cmd = Command::new(tool);
    cmd.args(tool_args(boot, spec))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Err(_elapsed) => return Err(MeasureError::TimedOut(timeout)),
        Ok(result) => result.map_err(|source| MeasureError::Launch {
            tool: tool.to_path_buf(),
            source,
        })?,
    };

    if !output.status.success() {
        return Err(MeasureError::Failed {
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr)
                .trim_end()
                .to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttestationLevel, BootParams};
    use camino::{Utf8Path, Utf8PathBuf};

    fn al2_boot() -> BootParams {
        BootParams::new(
            AttestationLevel::Al2,
            4,
            "/fw/OVMF.fd".into(),
            Some(Utf8Path::new("/boot/vmlinuz")),
            Some(Utf8Path::new("/boot/initrd")),
            "console=ttyS0",
        )
        .unwrap()
    }

    fn al3_boot() -> BootParams {
        BootParams::new(
            AttestationLevel::Al3,
            4,
            "/fw/OVMF.fd".into(),
            Some(Utf8Path::new("/boot/vmlinuz")),
            Some(Utf8Path::new("/boot/initrd")),
            "console=ttyS0",
        )
        .unwrap()
    }

    fn type_spec() -> CpuSpec {
        CpuSpec::Type { name: "EPYC-Milan".to_string() }
    }

    #[test]
    fn fixed_prefix_is_stable() {
        let args = tool_args(&al2_boot(), &type_spec());
        assert_eq!(
            &args[..10],
            &[
                "--mode",
                "snp",
                "--vmm-type",
                "QEMU",
                "--vcpus",
                "4",
                "--ovmf",
                "/fw/OVMF.fd",
                "--output-format",
                "hex",
            ]
        );
    }

    #[test]
    fn selector_group_follows_the_spec_variant() {
        let args = tool_args(&al2_boot(), &type_spec());
        assert_eq!(&args[10..], &["--vcpu-type", "EPYC-Milan"]);

        let args = tool_args(
            &al2_boot(),
            &CpuSpec::Sig { sig: "0x0a201009".to_string() },
        );
        assert_eq!(&args[10..], &["--vcpu-sig", "0x0a201009"]);

        let args = tool_args(
            &al2_boot(),
            &CpuSpec::Fms { family: 25, model: 1, stepping: 2 },
        );
        assert_eq!(
            &args[10..],
            &[
                "--vcpu-family",
                "25",
                "--vcpu-model",
                "1",
                "--vcpu-stepping",
                "2",
            ]
        );
    }

    #[test]
    fn level_2_never_passes_direct_boot_flags() {
        // The level 2 boot params above were built with kernel/initrd/cmdline
        // supplied; none of it may reach the tool.
        let args = tool_args(&al2_boot(), &type_spec());
        assert!(!args.iter().any(|a| a == "--kernel"));
        assert!(!args.iter().any(|a| a == "--initrd"));
        assert!(!args.iter().any(|a| a == "--append"));
    }

    #[test]
    fn level_3_appends_direct_boot_flags() {
        let args = tool_args(&al3_boot(), &type_spec());
        assert_eq!(
            &args[12..],
            &[
                "--kernel",
                "/boot/vmlinuz",
                "--initrd",
                "/boot/initrd",
                "--append",
                "console=ttyS0",
            ]
        );
    }

    #[cfg(unix)]
    fn stub_tool(dir: &Utf8Path, body: &str) -> Utf8PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-measure");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_tool_output_is_trimmed() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let tool = stub_tool(dir_path, "echo '  deadbeef01  '");
        let hex = measure(
            &tool,
            &al2_boot(),
            &type_spec(),
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(hex, "deadbeef01");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_captures_stderr_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let tool =
            stub_tool(dir_path, "echo 'unsupported vcpu type' >&2\nexit 3");
        let err = measure(
            &tool,
            &al2_boot(),
            &type_spec(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        match err {
            MeasureError::Failed { status, stderr } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "unsupported vcpu type");
            }
            other => panic!("unexpected outcome: {other}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_trips_the_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let dir_path = Utf8Path::from_path(dir.path()).unwrap();
        let tool = stub_tool(dir_path, "sleep 30");
        let err = measure(
            &tool,
            &al2_boot(),
            &type_spec(),
            Duration::from_millis(100),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MeasureError::TimedOut(_)));
    }

    #[tokio::test]
    async fn missing_tool_is_a_launch_error() {
        let err = measure(
            Utf8Path::new("/nonexistent/sev-snp-measure"),
            &al2_boot(),
            &type_spec(),
            Duration::from_secs(10),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, MeasureError::Launch { .. }));
    }
}
