pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use config::{cli::LocalStorage, AttributionConfig, PipelineOptions};
pub use core::{
    etl::EtlEngine, observe_api::ObserveClient, pipeline::AttributionPipeline,
    scheduler::Scheduler, snowflake::SnowflakeClient,
};
pub use utils::error::{EtlError, Result};
