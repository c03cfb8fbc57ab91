use std::fmt::Write as _;
use std::fs;
use std::process::Command;

use nystrom_krr::ModelArtifact;
use tempfile::tempdir;

fn training_table(rows: usize) -> String {
    let mut table = String::from("sample_id,x1,x2,price\n");
    for i in 0..rows {
        let x1 = (i as f64 * 0.37).sin() * 2.0;
        let x2 = (i as f64 * 0.11).cos();
        let price = x1.sin() + 0.5 * x2;
        writeln!(table, "s{i},{x1},{x2},{price}").unwrap();
    }
    table
}

#[test]
fn train_then_infer_writes_one_prediction_per_row() {
    let tmp = tempdir().expect("temporary directory");
    let training_path = tmp.path().join("train.csv");
    fs::write(&training_path, training_table(80)).expect("write training data");

    let exe = env!("CARGO_BIN_EXE_krr");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "train",
            training_path.to_str().expect("path str"),
            "--targets",
            "price",
            "--sigma",
            "1.0",
            "--penalty",
            "1e-3",
            "--centers",
            "30",
            "--seed",
            "7",
        ])
        .status()
        .expect("run krr train");
    assert!(status.success(), "train exited with status {status:?}");
    let model_path = tmp.path().join("model.toml");
    let model = ModelArtifact::load(&model_path).expect("model.toml written");
    assert_eq!(model.feature_names, vec!["x1", "x2"]);
    assert_eq!(model.target_names, vec!["price"]);
    assert_eq!(model.num_centers(), 30);

    let test_path = tmp.path().join("test.csv");
    fs::write(&test_path, "sample_id,x2,x1\na,0.5,1.0\nb,-0.2,0.3\n").expect("write test data");
    let status = Command::new(exe)
        .current_dir(tmp.path())
        .args([
            "infer",
            test_path.to_str().expect("path str"),
            "--model",
            model_path.to_str().expect("path str"),
        ])
        .status()
        .expect("run krr infer");
    assert!(status.success(), "infer exited with status {status:?}");

    let predictions =
        fs::read_to_string(tmp.path().join("predictions.csv")).expect("predictions written");
    let lines: Vec<&str> = predictions.lines().collect();
    assert_eq!(lines[0], "sample_id,price_pred");
    assert_eq!(lines.len(), 3);
    assert!(lines[1].starts_with("a,"));
    assert!(lines[2].starts_with("b,"));
}

#[test]
fn missing_target_column_fails_cleanly() {
    let tmp = tempdir().expect("temporary directory");
    let training_path = tmp.path().join("train.csv");
    fs::write(&training_path, training_table(10)).expect("write training data");

    let output = Command::new(env!("CARGO_BIN_EXE_krr"))
        .current_dir(tmp.path())
        .args(["train", training_path.to_str().expect("path str")])
        .output()
        .expect("run krr train");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("'target' was not found"), "stderr: {stderr}");
}
