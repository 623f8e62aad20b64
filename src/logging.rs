use std::path::{Path, PathBuf};
use tracing_core::{Level, LevelFilter};
use tracing_subscriber::filter::{filter_fn, EnvFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::{registry, Layer};

/// Installs the global subscriber: human readable logs on stderr, filtered by
/// `RUST_LOG` (`info` by default), and optionally a copy in `log_file`.
///
/// Records emitted through the `log` facade are captured as well. Returns
/// `false` when a global subscriber was already installed.
pub fn install_logger(log_file: Option<&Path>) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter);

    let file = log_file.map(|path| {
        let writer = tracing_appender::rolling::never(
            path.parent().unwrap_or_else(|| Path::new(".")),
            path.file_name().unwrap_or_else(|| path.as_os_str()),
        );

        tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(writer)
            .with_filter(LevelFilter::INFO)
            .with_filter(filter_fn(|m| {
                // The wgpu crate is logging too much, so we skip `info` level.
                match m.module_path() {
                    Some(path) => !(path.starts_with("wgpu") && *m.level() >= Level::INFO),
                    None => true,
                }
            }))
    });

    if registry().with(stderr).with(file).try_init().is_err() {
        return false;
    }

    update_panic_hook(log_file.map(Path::to_path_buf));
    true
}

fn update_panic_hook(log_file: Option<PathBuf>) {
    let hook = std::panic::take_hook();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");

        if let Some(path) = &log_file {
            eprintln!(
                "=== PANIC ===\nA fatal error happened, you can check the training logs here => \
                 '{}'\n=============",
                path.display()
            );
        }
        hook(info);
    }));
}
