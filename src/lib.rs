pub mod error;
pub mod loaders;
pub mod memory;
pub mod models;
pub mod platform;
pub mod trainers;

#[cfg(test)]
mod testing;

// Re-export common types
pub use error::{Result, TrainerError};
pub use trainers::{load_config, Config, NetworkSession};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Timestamped logger at `info`, overridable through `RUST_LOG`.
    pub fn init_logger() {
        let mut builder = Builder::new();
        builder
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info);
        if let Ok(filters) = std::env::var("RUST_LOG") {
            builder.parse_filters(&filters);
        }
        let _ = builder.try_init();
    }
}
