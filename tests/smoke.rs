//! Smoke tests -- verify the binary runs and each subcommand works end to end.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

const INVENTORY: &str = r#"
[[platform]]
name = "Acme CL"
vendor = "Acme Corp"
version = "CL 2.0"
extensions = ["cl_khr_icd"]

[[platform.devices]]
name = "Rocket"
vendor = "Acme Corp"
class = "accelerator"
max_clock_mhz = 1000
compute_units = 32
global_mem_bytes = 4294967296

[[platform.devices]]
name = "Anvil"
vendor = "Acme Corp"
class = "cpu"
max_clock_mhz = 3000
compute_units = 8
global_mem_bytes = 8589934592
"#;

fn inventory_file() -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(INVENTORY.as_bytes()).unwrap();
    file
}

fn accelctl() -> Command {
    let mut cmd = Command::cargo_bin("accelctl").unwrap();
    cmd.env_remove("ACCELCTL_CONFIG").env("RUST_LOG", "warn");
    cmd
}

#[test]
fn test_cli_help() {
    accelctl()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Accelerator device selection"));
}

#[test]
fn test_cli_version() {
    accelctl()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("accelctl"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["platforms", "select", "resolve"] {
        accelctl().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_platforms_lists_inventory() {
    let inv = inventory_file();
    accelctl()
        .args(["platforms", "--devices", "--class", "accelerator", "--inventory"])
        .arg(inv.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("Platform info [ 0 ]"))
        .stdout(predicates::str::contains("Rocket"))
        .stdout(predicates::str::contains("cl_khr_icd"))
        .stdout(predicates::str::contains("Anvil").not());
}

#[test]
fn test_platforms_json() {
    let inv = inventory_file();
    accelctl()
        .args(["platforms", "--devices", "--json", "--inventory"])
        .arg(inv.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("\"vendor\": \"Acme Corp\""))
        .stdout(predicates::str::contains("\"Anvil\""));
}

#[test]
fn test_select_json_picks_accelerator() {
    let inv = inventory_file();
    accelctl()
        .args(["select", "--vendor", "Acme", "--json", "--inventory"])
        .arg(inv.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("\"Rocket\""))
        .stdout(predicates::str::contains("\"fallback_reason\": null"));
}

#[test]
fn test_select_reports_fallback() {
    let inv = inventory_file();
    accelctl()
        .args(["select", "--vendor", "Initech", "--inventory"])
        .arg(inv.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("Using platform default"))
        .stdout(predicates::str::contains("Initech"));
}

#[test]
fn test_resolve_modes() {
    let inv = inventory_file();
    accelctl()
        .args(["resolve", "--size", "100000", "--mode", "serial", "--inventory"])
        .arg(inv.path())
        .assert()
        .success()
        .stdout("serial-cpu\n");

    // No preferred-vendor accelerator: large work goes to the CPU cores.
    accelctl()
        .args(["resolve", "--size", "100000", "--inventory"])
        .arg(inv.path())
        .assert()
        .success()
        .stdout("multi-core-cpu\n");
}

#[test]
fn test_bad_config_is_reported() {
    let mut cfg = tempfile::NamedTempFile::new().unwrap();
    writeln!(cfg, "[dispatch]\nwg_per_compute_unit = 0").unwrap();
    let inv = inventory_file();
    accelctl()
        .arg("--config")
        .arg(cfg.path())
        .args(["resolve", "--size", "1", "--inventory"])
        .arg(inv.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("wg_per_compute_unit"));
}
