use assert_cmd::prelude::*;
use predicates::str::contains;
use std::process::Command;

#[test]
fn cli_rejects_unknown_flags() {
    let mut cmd = Command::cargo_bin("showroom").expect("binary exists");
    cmd.arg("--bogus");
    cmd.assert()
        .failure()
        .stderr(contains("Unknown argument: --bogus"))
        .stderr(contains("Usage: showroom"));
}

#[test]
fn cli_rejects_extra_positional_arguments() {
    let mut cmd = Command::cargo_bin("showroom").expect("binary exists");
    cmd.arg("car.glb").arg("sky.hdr").arg("surplus.bin");
    cmd.assert()
        .failure()
        .stderr(contains("Too many arguments"))
        .stderr(contains("Usage: showroom"));
}
