use crate::{
    calibration::CalibrationSource,
    error::Result,
    model::BackboneWeights,
    pipeline::RunOptions,
    training::TrainingConfig,
};
use burn::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Trains the drop / no-drop classifier and exports it as an int8 TFLite model.
#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    /// Directory holding `training_set/` and `test_set/`.
    #[arg(long, default_value = "imageVer3")]
    pub data_root: PathBuf,

    /// Path of the exported model.
    #[arg(short, long, default_value = "trained.tflite")]
    pub output: PathBuf,

    /// Directory for the saved config, float model and training logs.
    #[arg(long, default_value = "artifacts")]
    pub artifact_dir: String,

    /// Training configuration JSON replacing the built-in defaults.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Pretrained backbone record (`.mpk`, or a PyTorch `.pt` state dict).
    #[arg(long)]
    pub backbone_weights: Option<PathBuf>,

    /// Renames state dict keys matching PATTERN, a regular expression.
    /// Repeatable, applied in order.
    #[arg(long, value_name = "PATTERN=REPLACEMENT", value_parser = parse_key_remap)]
    pub key_remap: Vec<(String, String)>,

    /// Maps the keys of a `torch.nn.Sequential` MobileNet onto the backbone.
    #[arg(long)]
    pub sequential_keys: bool,

    /// Key holding the state dict inside the checkpoint.
    #[arg(long)]
    pub state_dict_key: Option<String>,

    /// Calibrate on the training images without augmentation.
    #[arg(long)]
    pub clean_calibration: bool,

    #[arg(long)]
    pub num_epochs: Option<usize>,
}

impl Cli {
    /// Training configuration with the command line overrides applied.
    pub fn training_config(&self) -> Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)?,
            None => TrainingConfig::new(),
        };

        if let Some(num_epochs) = self.num_epochs {
            config.num_epochs = num_epochs;
        }
        if self.clean_calibration {
            config.calibration.source = CalibrationSource::Clean;
        }

        Ok(config)
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            data_root: self.data_root.clone(),
            output: self.output.clone(),
            artifact_dir: self.artifact_dir.clone(),
            backbone_weights: self.backbone_weights.as_ref().map(|path| {
                let mut weights = BackboneWeights::new(path.clone());
                if self.sequential_keys {
                    weights = weights.with_sequential_keys();
                }
                for (pattern, replacement) in self.key_remap.iter() {
                    weights = weights.with_key_remap(pattern, replacement);
                }
                weights.with_top_level_key(self.state_dict_key.clone())
            }),
        }
    }
}

fn parse_key_remap(value: &str) -> std::result::Result<(String, String), String> {
    match value.split_once('=') {
        Some((pattern, replacement)) if !pattern.is_empty() => {
            Ok((pattern.to_string(), replacement.to_string()))
        }
        _ => Err(format!("expected PATTERN=REPLACEMENT, got `{value}`")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_reproduce_the_fixed_run() {
        let cli = Cli::parse_from(["dropnet"]);
        let config = cli.training_config().unwrap();
        let options = cli.run_options();

        assert_eq!(options.data_root, PathBuf::from("imageVer3"));
        assert_eq!(options.output, PathBuf::from("trained.tflite"));
        assert_eq!(config.num_epochs, 100);
        assert_eq!(config.model.backbone.input_height, 80);
        assert_eq!(config.model.backbone.input_width, 100);
        assert_eq!(config.model.num_classes, 2);
        assert_eq!(config.calibration.source, CalibrationSource::AugmentedTraining);
        assert!(options.backbone_weights.is_none());
    }

    #[test]
    fn backbone_flags_build_the_key_remaps() {
        let cli = Cli::parse_from([
            "dropnet",
            "--backbone-weights",
            "mobilenet.pt",
            "--key-remap",
            r"^features\.(.*)=model.$1",
            "--key-remap",
            "fc=classifier",
            "--state-dict-key",
            "state_dict",
        ]);
        let weights = cli.run_options().backbone_weights.unwrap();

        assert_eq!(weights.path, PathBuf::from("mobilenet.pt"));
        assert_eq!(
            weights.key_remap,
            vec![
                (r"^features\.(.*)".to_string(), "model.$1".to_string()),
                ("fc".to_string(), "classifier".to_string()),
            ]
        );
        assert_eq!(weights.top_level_key.as_deref(), Some("state_dict"));
    }

    #[test]
    fn sequential_keys_come_before_explicit_remaps() {
        let cli = Cli::parse_from([
            "dropnet",
            "--backbone-weights",
            "mobilenet.pt",
            "--sequential-keys",
            "--key-remap",
            "a=b",
        ]);
        let weights = cli.run_options().backbone_weights.unwrap();
        let mut expected = BackboneWeights::new("mobilenet.pt").with_sequential_keys();
        expected = expected.with_key_remap("a", "b");

        assert_eq!(weights, expected);
    }

    #[test]
    fn key_remap_needs_a_separator() {
        let result = Cli::try_parse_from(["dropnet", "--key-remap", "no-separator"]);
        assert!(result.is_err());
        assert!(parse_key_remap("=x").is_err());
        assert_eq!(
            parse_key_remap("a=b=c").unwrap(),
            ("a".to_string(), "b=c".to_string())
        );
    }

    #[test]
    fn overrides_apply_on_top_of_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        TrainingConfig::new().with_seed(7).save(&path).unwrap();

        let cli = Cli::parse_from([
            "dropnet",
            "--config",
            path.to_str().unwrap(),
            "--num-epochs",
            "3",
            "--clean-calibration",
        ]);
        let config = cli.training_config().unwrap();

        assert_eq!(config.seed, 7);
        assert_eq!(config.num_epochs, 3);
        assert_eq!(config.calibration.source, CalibrationSource::Clean);
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["dropnet", "--config", "/nonexistent/config.json"]);
        assert!(matches!(cli.training_config(), Err(crate::Error::Config(_))));
    }
}
