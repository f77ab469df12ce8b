use burn::backend::NdArray;
use dropnet::{
    calibration::CalibrationConfig,
    dataset::{TEST_SPLIT, TRAINING_SPLIT},
    model::DropNet,
    pipeline,
    quantize::ElementType,
    tflite::{self, FILE_IDENTIFIER},
    training::TrainingConfig,
};
use image::{Rgb, RgbImage};
use std::path::Path;

type B = NdArray<f32>;

fn write_split(root: &Path, classes: &[&str], per_class: u32) {
    for (c, class) in classes.iter().enumerate() {
        let dir = root.join(class);
        std::fs::create_dir_all(&dir).unwrap();
        for i in 0..per_class {
            let value = (c as u32 * 150 + i * 20) as u8;
            RgbImage::from_fn(120, 90, |x, y| Rgb([value, (x % 256) as u8, (y % 256) as u8]))
                .save(dir.join(format!("{i}.jpg")))
                .unwrap();
        }
    }
}

#[test]
fn export_writes_a_single_int8_tflite_model() {
    let dir = tempfile::tempdir().unwrap();
    let data_root = dir.path().join("imageVer3");
    write_split(&data_root.join(TRAINING_SPLIT), &["drop", "no_drop"], 3);
    write_split(&data_root.join(TEST_SPLIT), &["drop", "no_drop"], 1);
    let out_dir = dir.path().join("out");
    std::fs::create_dir_all(&out_dir).unwrap();
    let output = out_dir.join("trained.tflite");

    let config = TrainingConfig::new()
        .with_calibration(CalibrationConfig::new().with_num_samples(4));
    let device = Default::default();

    let (train, test) = pipeline::load_splits(&data_root, &config).unwrap();
    assert_eq!(train.classes(), &["drop".to_string(), "no_drop".to_string()]);

    let model: DropNet<B> = pipeline::build_model(&config, None, &device).unwrap();
    let report = pipeline::export(&model, train, &test, &config, &output, &device).unwrap();

    let entries: Vec<_> = std::fs::read_dir(&out_dir).unwrap().collect();
    assert_eq!(entries.len(), 1);

    let bytes = std::fs::read(&output).unwrap();
    assert!(!bytes.is_empty());
    assert_eq!(bytes.len(), report.num_bytes);
    assert_eq!(&bytes[4..8], FILE_IDENTIFIER.as_bytes());

    let summary = tflite::inspect(&bytes).unwrap();
    assert_eq!(summary, report.summary);
    assert_eq!(summary.num_operators, 34);

    let input = &summary.inputs[0];
    assert_eq!(input.shape, vec![1, 80, 100, 3]);
    assert_eq!(input.element_type, Some(ElementType::Int8));

    let output = &summary.outputs[0];
    assert_eq!(output.shape, vec![1, 2]);
    assert_eq!(output.element_type, Some(ElementType::Int8));

    assert!((0.0..=1.0).contains(&report.quantized_accuracy));
}

#[test]
fn export_overwrites_previous_model() {
    let dir = tempfile::tempdir().unwrap();
    let data_root = dir.path().join("data");
    write_split(&data_root.join(TRAINING_SPLIT), &["drop", "no_drop"], 1);
    write_split(&data_root.join(TEST_SPLIT), &["drop", "no_drop"], 1);
    let output = dir.path().join("trained.tflite");
    std::fs::write(&output, b"previous").unwrap();

    let config = TrainingConfig::new()
        .with_calibration(CalibrationConfig::new().with_num_samples(2));
    let device = Default::default();
    let (train, test) = pipeline::load_splits(&data_root, &config).unwrap();
    let model: DropNet<B> = pipeline::build_model(&config, None, &device).unwrap();

    pipeline::export(&model, train, &test, &config, &output, &device).unwrap();

    let bytes = std::fs::read(&output).unwrap();
    assert_ne!(bytes, b"previous");
    assert!(tflite::inspect(&bytes).is_ok());
}
