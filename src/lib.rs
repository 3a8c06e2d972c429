// Library exports for megahic
pub mod alignment_source;
pub mod artifacts;
pub mod config;
pub mod controller;
pub mod engines;
pub mod error;
pub mod homolog;
pub mod merge_sort;
pub mod record_mapper;
pub mod records;
pub mod stage;
pub mod worker_pool;
