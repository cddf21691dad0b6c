//! Everything that touches the outside world: storage, datasets, configs,
//! services and the model registry.

pub mod catalog;
pub mod columnar;
pub mod configs;
pub mod datasets;
pub mod deltalake;
pub mod delimited;
pub mod registries;
pub mod services;
pub mod storage;
