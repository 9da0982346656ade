// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of SpiralTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use std::fs;
use std::process::Command;

use op_nn::StateDict;
use op_pursuit::checkpoint::write_checkpoint;
use op_pursuit::BasisRecord;
use op_tensor::Tensor;
use tempfile::tempdir;

fn run_cli(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_basis-cli"))
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "basis-cli failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).unwrap()
}

#[test]
fn export_and_import_codes() {
    let dir = tempdir().unwrap();
    let bases = dir.path().join("bases");
    let vecs = dir.path().join("vec");
    fs::create_dir_all(&bases).unwrap();
    let z = Tensor::from_vec(&[3], vec![0.5, -1.0, 2.0]).unwrap();
    BasisRecord::new(&z, None).write(bases.join("Pot.json")).unwrap();

    run_cli(&[
        "export-codes",
        "--bases",
        bases.to_str().unwrap(),
        "--out",
        vecs.to_str().unwrap(),
    ]);
    let exported: Vec<f32> =
        serde_json::from_str(&fs::read_to_string(vecs.join("Pot.vec")).unwrap()).unwrap();
    assert_eq!(exported, vec![0.5, -1.0, 2.0]);

    let record = dir.path().join("Pot.json");
    run_cli(&[
        "import-code",
        "--vector",
        vecs.join("Pot.vec").to_str().unwrap(),
        "--record",
        record.to_str().unwrap(),
    ]);
    assert_eq!(BasisRecord::read(&record).unwrap().z.data, vec![0.5, -1.0, 2.0]);
}

#[test]
fn flatten_head_only_checkpoint() {
    let dir = tempdir().unwrap();
    let mut state = StateDict::new();
    state.insert(
        "backbone.stem.weight".into(),
        Tensor::from_vec(&[2], vec![7.0, 7.0]).unwrap(),
    );
    state.insert(
        "decoder.classifier.bias".into(),
        Tensor::from_vec(&[1], vec![0.25]).unwrap(),
    );
    state.insert(
        "decoder.fuse.0.bn.running_mean".into(),
        Tensor::from_vec(&[2], vec![3.0, 3.0]).unwrap(),
    );
    let checkpoint = dir.path().join("model.bin");
    write_checkpoint(&checkpoint, &state).unwrap();

    let out = dir.path().join("weights.vec");
    let layout = dir.path().join("layout.json");
    run_cli(&[
        "flatten",
        "--input",
        checkpoint.to_str().unwrap(),
        "--out",
        out.to_str().unwrap(),
        "--layout",
        layout.to_str().unwrap(),
        "--head-only",
    ]);
    let values: Vec<f32> = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(values, vec![0.25]);
    let names: Vec<(String, Vec<usize>)> =
        serde_json::from_str(&fs::read_to_string(&layout).unwrap()).unwrap();
    assert_eq!(names, vec![("decoder.classifier.bias".to_string(), vec![1])]);
}

#[test]
fn inspect_lists_record_tensors() {
    let dir = tempdir().unwrap();
    let z = Tensor::from_vec(&[2], vec![1.0, 2.0]).unwrap();
    let mut weights = StateDict::new();
    weights.insert(
        "aspp.pool.conv.weight".into(),
        Tensor::zeros(&[2, 4, 1, 1]).unwrap(),
    );
    let path = dir.path().join("Egg.json");
    BasisRecord::new(&z, Some(&weights)).write(&path).unwrap();

    let stdout = run_cli(&["inspect", path.to_str().unwrap()]);
    assert!(stdout.contains("z [2]"));
    assert!(stdout.contains("weights.aspp.pool.conv.weight [2, 4, 1, 1]"));
}
