#[cfg(any(
    feature = "ndarray",
    feature = "ndarray-blas-netlib",
    feature = "ndarray-blas-openblas",
    feature = "ndarray-blas-accelerate",
))]
mod ndarray {
    use burn::backend::{
        ndarray::{NdArray, NdArrayDevice},
        Autodiff,
    };
    use dropnet::{cli::Cli, pipeline, Result};

    pub fn run(cli: &Cli) -> Result<()> {
        let device = NdArrayDevice::Cpu;
        super::report(pipeline::run::<Autodiff<NdArray>>(
            &cli.training_config()?,
            &cli.run_options(),
            device,
        )?);
        Ok(())
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };
    use dropnet::{cli::Cli, pipeline, Result};

    pub fn run(cli: &Cli) -> Result<()> {
        let device = LibTorchDevice::Cpu;
        super::report(pipeline::run::<Autodiff<LibTorch>>(
            &cli.training_config()?,
            &cli.run_options(),
            device,
        )?);
        Ok(())
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::{
        wgpu::{Wgpu, WgpuDevice},
        Autodiff,
    };
    use dropnet::{cli::Cli, pipeline, Result};

    pub fn run(cli: &Cli) -> Result<()> {
        let device = WgpuDevice::default();
        super::report(pipeline::run::<Autodiff<Wgpu>>(
            &cli.training_config()?,
            &cli.run_options(),
            device,
        )?);
        Ok(())
    }
}

use clap::Parser;
use dropnet::{cli::Cli, pipeline::ExportReport, Error};
use std::{fs::File, path::Path, sync::Mutex};
use tracing_subscriber::{filter::LevelFilter, prelude::*, registry};

fn report(report: ExportReport) {
    log::info!(
        "Exported {} ({} bytes, {} operators), int8 accuracy {:.4}",
        report.path.display(),
        report.num_bytes,
        report.summary.num_operators,
        report.quantized_accuracy
    );
}

/// Logs INFO and above to `<artifact_dir>/experiment.log` and warnings to
/// stderr, leaving the terminal to the training dashboard.
fn install_logger(artifact_dir: &str) -> Result<(), Error> {
    std::fs::create_dir_all(artifact_dir).map_err(|source| Error::Io {
        path: artifact_dir.into(),
        source,
    })?;
    let path = Path::new(artifact_dir).join("experiment.log");
    let file = File::create(&path).map_err(|source| Error::Io { path, source })?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(Mutex::new(file))
        .with_filter(LevelFilter::INFO);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(LevelFilter::WARN);

    // An already installed global subscriber wins.
    let _ = registry().with(file_layer).with(stderr_layer).try_init();
    Ok(())
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();
    install_logger(&cli.artifact_dir)?;

    #[cfg(any(
        feature = "ndarray",
        feature = "ndarray-blas-netlib",
        feature = "ndarray-blas-openblas",
        feature = "ndarray-blas-accelerate",
    ))]
    ndarray::run(&cli)?;
    #[cfg(feature = "tch-cpu")]
    tch_cpu::run(&cli)?;
    #[cfg(feature = "wgpu")]
    wgpu::run(&cli)?;

    Ok(())
}
