use std::process::ExitCode;

use clap::Parser;
use mnist_training::{cli::Cli, logging::install_logger, training::TrainingSummary, TrainingError};

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
    use mnist_training::{
        cli::{launch, Cli},
        training::TrainingSummary,
        TrainingError,
    };

    pub fn run(cli: &Cli) -> Result<TrainingSummary, TrainingError> {
        launch::<Autodiff<NdArray>>(cli, NdArrayDevice::Cpu)
    }
}

#[cfg(feature = "tch-gpu")]
mod tch_gpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };
    use mnist_training::{
        cli::{launch, Cli},
        training::TrainingSummary,
        TrainingError,
    };

    pub fn run(cli: &Cli) -> Result<TrainingSummary, TrainingError> {
        #[cfg(not(target_os = "macos"))]
        let device = LibTorchDevice::Cuda(0);
        #[cfg(target_os = "macos")]
        let device = LibTorchDevice::Mps;

        launch::<Autodiff<LibTorch>>(cli, device)
    }
}

#[cfg(feature = "tch-cpu")]
mod tch_cpu {
    use burn::backend::{
        libtorch::{LibTorch, LibTorchDevice},
        Autodiff,
    };
    use mnist_training::{
        cli::{launch, Cli},
        training::TrainingSummary,
        TrainingError,
    };

    pub fn run(cli: &Cli) -> Result<TrainingSummary, TrainingError> {
        launch::<Autodiff<LibTorch>>(cli, LibTorchDevice::Cpu)
    }
}

#[cfg(feature = "wgpu")]
mod wgpu {
    use burn::backend::{wgpu::WgpuDevice, Autodiff, Wgpu};
    use mnist_training::{
        cli::{launch, Cli},
        training::TrainingSummary,
        TrainingError,
    };

    pub fn run(cli: &Cli) -> Result<TrainingSummary, TrainingError> {
        launch::<Autodiff<Wgpu>>(cli, WgpuDevice::default())
    }
}

#[allow(unreachable_code)]
fn train(cli: &Cli) -> Result<TrainingSummary, TrainingError> {
    #[cfg(feature = "wgpu")]
    return wgpu::run(cli);

    #[cfg(feature = "tch-gpu")]
    return tch_gpu::run(cli);

    #[cfg(feature = "tch-cpu")]
    return tch_cpu::run(cli);

    #[cfg(any(
        feature = "ndarray",
        feature = "ndarray-blas-netlib",
        feature = "ndarray-blas-openblas",
        feature = "ndarray-blas-accelerate",
    ))]
    return ndarray::run(cli);

    Err(TrainingError::Configuration("no backend feature is enabled".to_string()))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    install_logger(cli.log_file.as_deref());

    match train(&cli) {
        Ok(summary) => {
            match serde_json::to_string_pretty(&summary) {
                Ok(summary) => println!("{summary}"),
                Err(err) => log::warn!("Unable to print the run summary: {err}"),
            }
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("Training failed: {err}");
            ExitCode::FAILURE
        }
    }
}
